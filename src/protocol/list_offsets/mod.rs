//! Locate offsets by timestamp.

pub mod request;
pub mod response;

pub use request::{EARLIEST_OFFSET, LATEST_OFFSET};
