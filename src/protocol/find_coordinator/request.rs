//! Encoding and creation for Find Coordinator requests.
//!
//! The offsets for a given consumer group are maintained by a
//! specific broker called the group coordinator. A client discovers
//! the current coordinator by issuing this request.
//!
//! ### Protocol Def
//! ```text
//! FindCoordinator Request (Version: 0) => key
//!   key => STRING
//! ```
//!
//! Note we are using version 0 of the request.

use crate::{
    encode::ToByte,
    protocol::{HeaderRequest, KafkaRequest},
};

const API_KEY_FIND_COORDINATOR: i16 = 10;
const API_VERSION: i16 = 0;

/// The base Find Coordinator request object.
#[derive(Debug)]
pub struct FindCoordinatorRequest<'a> {
    pub header: HeaderRequest,
    /// The coordinator key, i.e. the group id.
    pub key: &'a str,
}

impl<'a> FindCoordinatorRequest<'a> {
    pub fn new(correlation_id: i32, client_id: &str, key: &'a str) -> Self {
        let header = HeaderRequest::new(
            API_KEY_FIND_COORDINATOR,
            API_VERSION,
            correlation_id,
            client_id,
        );
        Self { header, key }
    }
}

impl<'a> ToByte for FindCoordinatorRequest<'a> {
    fn encode<T: bytes::BufMut>(&self, buffer: &mut T) -> crate::error::Result<()> {
        tracing::trace!("Encoding FindCoordinatorRequest {:?}", self);
        self.header.encode(buffer)?;
        self.key.encode(buffer)?;
        Ok(())
    }
}

impl<'a> KafkaRequest for FindCoordinatorRequest<'a> {
    fn api_key(&self) -> i16 {
        API_KEY_FIND_COORDINATOR
    }
}
