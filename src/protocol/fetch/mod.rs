//! Read record batches from a broker.

pub mod request;
pub mod response;
