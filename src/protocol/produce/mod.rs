//! Send record batches to a broker.

pub mod request;
pub mod response;
