//! Encoding and creation for Metadata requests.
//!
//! ### Example
//! ```ignore
//! let metadata_request = protocol::MetadataRequest::new(1, client_id, &topic_names);
//! conn.send(&metadata_request, None, &cancel).await?;
//! ```
//!
//! ### Protocol Def
//! ```text
//! Metadata Request (Version: 0) => [topics]
//!   topics => name
//!   name => STRING
//! ```
//!
//! Note we are using version 0 of the request. An empty topic list asks
//! the broker for every topic it knows about.

use bytes::BufMut;

use crate::{
    encode::{AsStrings, ToByte},
    error::Result,
    protocol::{HeaderRequest, KafkaRequest},
};

const API_KEY_METADATA: i16 = 3;
const API_VERSION: i16 = 0;

/// The base Metadata request object.
#[derive(Debug)]
pub struct MetadataRequest<'a, T> {
    pub header: HeaderRequest,
    /// The topics to fetch metadata for.
    pub topics: &'a [T],
}

impl<'a, T: AsRef<str>> MetadataRequest<'a, T> {
    pub fn new(correlation_id: i32, client_id: &str, topics: &'a [T]) -> MetadataRequest<'a, T> {
        MetadataRequest {
            header: HeaderRequest::new(API_KEY_METADATA, API_VERSION, correlation_id, client_id),
            topics,
        }
    }
}

impl<'a, T: AsRef<str> + 'a> ToByte for MetadataRequest<'a, T> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.header.encode(buffer)?;
        AsStrings(self.topics).encode(buffer)?;
        Ok(())
    }
}

impl<'a, T: AsRef<str> + Send + Sync + std::fmt::Debug + 'a> KafkaRequest
    for MetadataRequest<'a, T>
{
    fn api_key(&self) -> i16 {
        API_KEY_METADATA
    }
}
