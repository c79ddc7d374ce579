//! Connection & communication with a broker.
//!
//! # Network Module
//!
//! Kafka uses a binary protocol over TCP. The protocol defines all APIs
//! as request response message pairs. All messages are size delimited.
//!
//! The client initiates a socket connection and then writes a sequence
//! of request messages and reads back the corresponding response
//! messages. No handshake is required on connection or disconnection.
//!
//! The client will likely need to maintain a connection to multiple
//! brokers, as data is partitioned and the clients will need to talk to
//! the server that has their data. However it should not generally be
//! necessary to maintain multiple connections to a single broker from a
//! single client instance (i.e. connection pooling).
//!
//! Unlike the server, which processes the requests of one connection
//! strictly in order, a client may have many requests in flight on one
//! socket. Each request carries a correlation id in its header and the
//! matching response echoes it back, so responses can be matched to
//! their callers no matter the order they arrive in.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::KafkaRequest;

pub mod frame;
pub mod tcp;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A resolved broker address.
///
/// Carries the advertised `host:port` pair alongside the socket address
/// it resolved to. Hostnames are resolved when the endpoint is built,
/// not when a request is sent, and two endpoints are equal iff their
/// socket addresses are equal. That identity is what the router keys
/// its connection pool on.
#[derive(Clone, Debug)]
pub struct BrokerEndpoint {
    /// The advertised hostname.
    pub host: String,
    /// The advertised port.
    pub port: u16,
    /// The resolved socket address.
    pub addr: SocketAddr,
}

impl BrokerEndpoint {
    /// Resolve an advertised `host` + `port` into an endpoint.
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        use std::net::ToSocketAddrs;

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|err| {
                tracing::warn!("Failed resolving {}:{} {:?}", host, port, err);
                Error::AddressResolution(format!("{host}:{port}"))
            })?
            .next()
            .ok_or_else(|| Error::AddressResolution(format!("{host}:{port}")))?;

        Ok(Self {
            host: host.to_string(),
            port,
            addr,
        })
    }

    /// Resolve a `host:port` string, e.g. a bootstrap address.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::ArgError(format!("broker address without port: {addr}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::ArgError(format!("invalid broker port in {addr}")))?;
        Self::resolve(host, port)
    }
}

impl PartialEq for BrokerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for BrokerEndpoint {}

impl std::hash::Hash for BrokerEndpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Tunables for a single broker channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Deadline for one request/response exchange.
    pub request_timeout: Duration,
    /// Deadline for the TCP connect.
    pub connect_timeout: Duration,
    /// Ceiling on a single frame; larger length prefixes fail the
    /// connection as a protocol desync.
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// A duplex channel to one broker.
///
/// Implementations multiplex many in-flight request/response pairs over
/// a single socket; `send` may be called concurrently from any number
/// of tasks. The router, not the channel, is responsible for
/// reconnecting: once a channel reports itself closed it stays closed.
#[async_trait]
pub trait BrokerChannel: Clone + Debug + Send + Sync + 'static {
    /// Open a channel to `endpoint` and start its reader.
    async fn connect(endpoint: BrokerEndpoint, config: ChannelConfig) -> Result<Self>
    where
        Self: Sized;

    /// Send one request and await its correlated response.
    ///
    /// Returns `Ok(None)` for requests that expect no response (acks=0
    /// produce) as soon as the frame is flushed. `deadline` overrides
    /// the channel's `request_timeout` for this exchange.
    async fn send<R: KafkaRequest>(
        &self,
        req: &R,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>>;

    /// The endpoint this channel is pinned to.
    fn endpoint(&self) -> &BrokerEndpoint;

    /// Whether the channel has been torn down.
    fn is_closed(&self) -> bool;

    /// Tear the channel down, failing all in-flight sends.
    fn close(&self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_equality_is_by_resolved_addr() {
        let a = BrokerEndpoint::resolve("127.0.0.1", 9092).unwrap();
        let b = BrokerEndpoint::resolve("localhost", 9092);
        // localhost may resolve to ::1 depending on the host; only
        // assert when it lands on the same address family
        if let Ok(b) = b {
            assert_eq!(a == b, a.addr == b.addr);
        }

        let c = BrokerEndpoint::resolve("127.0.0.1", 9093).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!(matches!(
            BrokerEndpoint::parse("localhost"),
            Err(Error::ArgError(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("localhost:not-a-port"),
            Err(Error::ArgError(_))
        ));
    }

    #[test]
    fn resolution_failure_is_reported() {
        assert!(matches!(
            BrokerEndpoint::resolve("host.invalid.gregor.test", 9092),
            Err(Error::AddressResolution(_))
        ));
    }
}
