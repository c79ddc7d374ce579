//! Bytecode protocol requests & responses.
//!
//! This module aims to implement the bytecode protocol outlined in the
//! [Kafka Documentation](https://kafka.apache.org/protocol.html)
//!
//! The module is set up as a list of message pairs containing two files
//! each corresponding to the request and response.
//!
//! The request files hold the logic for creating and encoding structs that
//! will be sent to the broker. The response files hold the logic for parsing
//! and processing the messages coming from the broker.
//!
//! The connection layer treats the bodies as opaque: all it relies on
//! is the [`KafkaRequest`] capability (api key, whether a response is
//! expected, how to encode) and the correlation id sitting at a fixed
//! offset of every header.

pub mod fetch;
pub mod find_coordinator;
pub mod list_offsets;
pub mod metadata;
pub mod produce;

use std::fmt::Debug;

use bytes::BufMut;
use nom::{number::complete::be_i32, IResult};
use nombytes::NomBytes;

// re exporting these for ease
pub use self::{
    fetch::{request::FetchRequest, response::FetchResponse},
    find_coordinator::{request::FindCoordinatorRequest, response::FindCoordinatorResponse},
    list_offsets::{request::ListOffsetsRequest, response::ListOffsetsResponse},
    metadata::{request::MetadataRequest, response::MetadataResponse},
    produce::{
        request::{Attributes, Header, ProduceRequest},
        response::ProduceResponse,
    },
};
use crate::{
    encode::ToByte,
    error::{KafkaCode, Result},
};

/// A request message the connection layer can put on the wire.
///
/// Modelled as a capability rather than a closed enum so the channel
/// never has to know one message body from another.
pub trait KafkaRequest: ToByte + Debug + Send + Sync {
    /// The numeric API key of this message type.
    fn api_key(&self) -> i16;

    /// Whether the broker will answer at all. Produce with acks=0 is
    /// the one message in the core that says no.
    fn expects_response(&self) -> bool {
        true
    }
}

/// A response body able to report the broker error codes it carries,
/// so the send coordinator can classify a reply without knowing its
/// shape.
pub trait KafkaResponse {
    /// Every error code present in the body, `KafkaCode::None` included.
    fn error_codes(&self) -> Vec<KafkaCode>;
}

#[derive(Debug, Clone)]
pub struct HeaderRequest {
    /// The API key of this request.
    pub api_key: i16,
    /// The API version of this request.
    pub api_version: i16,
    /// The correlation ID of this request.
    ///
    /// Note the connection overwrites this on the wire with an id of
    /// its own; see the network module.
    pub correlation_id: i32,
    /// The client ID string.
    pub client_id: String,
}

impl HeaderRequest {
    /// Create new header request.
    ///
    /// This goes at the beginning of every single request.
    pub fn new(api_key: i16, api_version: i16, correlation_id: i32, client_id: &str) -> Self {
        HeaderRequest {
            api_key,
            api_version,
            correlation_id,
            client_id: client_id.to_string(),
        }
    }
}

impl ToByte for HeaderRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct HeaderResponse {
    /// The correlation ID of this response.
    pub correlation_id: i32,
}

pub fn parse_header_response(s: NomBytes) -> IResult<NomBytes, HeaderResponse> {
    let (s, correlation_id) = be_i32(s)?;
    Ok((s, HeaderResponse { correlation_id }))
}
