//! Error & result types.
use bytes::Bytes;
use num_derive::FromPrimitive;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Broker-reported error codes travel as [`KafkaCode`]; everything else in
/// this enum is produced on the client side.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Error from the underlying socket.
    #[error("broker socket error: {0:?}")]
    IoError(std::io::ErrorKind),

    /// A hostname did not resolve to any address.
    #[error("unable to resolve broker address {0}")]
    AddressResolution(String),

    /// Every candidate broker refused or failed the request.
    #[error("no broker reachable: {0}")]
    NoBrokerReachable(String),

    /// The connection has been torn down; no further sends are possible.
    #[error("connection to {0} is closed")]
    ConnectionClosed(String),

    /// The local topology cache cannot answer a route lookup.
    ///
    /// Raised when a topic or partition is unknown, or while a partition
    /// leader election is in progress. A metadata refresh usually clears it.
    #[error("no cached route for topic {topic} partition {partition:?}")]
    CachedMetadata {
        topic: String,
        partition: Option<i32>,
    },

    /// A broker answered with a non-retryable error code.
    #[error("broker {endpoint} returned {code:?}")]
    Request { code: KafkaCode, endpoint: String },

    /// Broker error code outside of a routed request/response exchange.
    #[error("kafka error {0:?}")]
    KafkaError(KafkaCode),

    /// The requested fetch offset is outside the broker's retention window.
    #[error("fetch offset out of range for topic {topic} partition {partition}")]
    FetchOutOfRange { topic: String, partition: i32 },

    /// The broker has a message larger than the current fetch buffer.
    #[error("a record larger than the {limit} byte fetch buffer is waiting on the broker")]
    BufferUnderrun { limit: usize },

    /// A frame length prefix was negative or above the configured ceiling.
    #[error("frame of {length} bytes exceeds the {limit} byte frame ceiling")]
    FrameOversize { length: i64, limit: usize },

    /// The per-operation deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Cooperative cancellation was signalled.
    #[error("operation cancelled")]
    Cancelled,

    /// A response frame carried a correlation id with no pending request.
    #[error("protocol desync: unknown correlation id {0}")]
    CorrelationMismatch(i32),

    /// The producer has been stopped and accepts no further records.
    #[error("producer is stopped")]
    ProducerStopped,

    #[error("failed parsing protocol message")]
    ParsingError(Bytes),

    #[error("failed encoding protocol message")]
    EncodingError,

    #[error("failed compressing or decompressing a record batch")]
    CompressionError,

    #[error("error converting bytes to utf8")]
    DecodingUtf8Error,

    #[error("invalid argument: {0}")]
    ArgError(String),
}

impl Error {
    /// Whether a metadata refresh plus re-route may clear this error.
    ///
    /// Connection losses, timeouts, cache misses and out-of-range fetch
    /// offsets all fall into this class; anything else is terminal for the
    /// request that hit it.
    pub fn is_refresh_recoverable(&self) -> bool {
        matches!(
            self,
            Error::IoError(_)
                | Error::AddressResolution(_)
                | Error::NoBrokerReachable(_)
                | Error::ConnectionClosed(_)
                | Error::CachedMetadata { .. }
                | Error::FetchOutOfRange { .. }
                | Error::Timeout
        )
    }
}

/// Kafka broker error codes.
///
/// Quoted from the [protocol documentation](https://kafka.apache.org/protocol.html#protocol_error_codes).
#[derive(Clone, Copy, Debug, Default, FromPrimitive, PartialEq)]
pub enum KafkaCode {
    /// The server experienced an unexpected error when processing the request.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is not within the range of offsets maintained by the server.
    OffsetOutOfRange = 1,
    /// This message has failed its CRC checksum, exceeds the valid size, has a null key for a compacted topic, or is otherwise corrupt.
    CorruptMessage = 2,
    /// This server does not host this topic-partition.
    UnknownTopicOrPartition = 3,
    /// The requested fetch size is invalid.
    InvalidFetchSize = 4,
    /// There is no leader for this topic-partition as we are in the middle of a leadership election.
    LeaderNotAvailable = 5,
    /// For requests intended only for the leader, this error indicates that the broker is not the current leader.
    NotLeaderForPartition = 6,
    /// The request timed out.
    RequestTimedOut = 7,
    /// The broker is not available.
    BrokerNotAvailable = 8,
    /// The replica is not available for the requested topic-partition.
    ReplicaNotAvailable = 9,
    /// The request included a message larger than the max message size the server will accept.
    MessageTooLarge = 10,
    /// The controller moved to another broker.
    StaleControllerEpoch = 11,
    /// The metadata field of the offset request was too large.
    OffsetMetadataTooLarge = 12,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// The coordinator is loading and hence can't process requests.
    CoordinatorLoadInProgress = 14,
    /// The coordinator is not available.
    CoordinatorNotAvailable = 15,
    /// This is not the correct coordinator.
    NotCoordinator = 16,
    /// The request attempted to perform an operation on an invalid topic.
    InvalidTopic = 17,
    /// The request included message batch larger than the configured segment size on the server.
    RecordListTooLarge = 18,
    /// Messages are rejected since there are fewer in-sync replicas than required.
    NotEnoughReplicas = 19,
    /// Messages are written to the log, but to fewer in-sync replicas than required.
    NotEnoughReplicasAfterAppend = 20,
    /// Produce request specified an invalid value for required acks.
    InvalidRequiredAcks = 21,
    /// Specified group generation id is not valid.
    IllegalGeneration = 22,
    /// The group member's supported protocols are incompatible with those of existing members.
    InconsistentGroupProtocol = 23,
    /// The configured groupId is invalid.
    InvalidGroupId = 24,
    /// The coordinator is not aware of this member.
    UnknownMemberId = 25,
    /// The session timeout is not within the range allowed by the broker.
    InvalidSessionTimeout = 26,
    /// The group is rebalancing, so a rejoin is needed.
    RebalanceInProgress = 27,
    /// The committing offset data size is not valid.
    InvalidCommitOffsetSize = 28,
    /// Topic authorization failed.
    TopicAuthorizationFailed = 29,
    /// Group authorization failed.
    GroupAuthorizationFailed = 30,
    /// Cluster authorization failed.
    ClusterAuthorizationFailed = 31,
    /// The timestamp of the message is out of acceptable range.
    InvalidTimestamp = 32,
    /// The broker does not support the requested SASL mechanism.
    UnsupportedSaslMechanism = 33,
    /// Request is not valid given the current SASL state.
    IllegalSaslState = 34,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// Topic with this name already exists.
    TopicAlreadyExists = 36,
    /// Number of partitions is below 1.
    InvalidPartitions = 37,
    /// Replication factor is below 1 or larger than the number of available brokers.
    InvalidReplicationFactor = 38,
    /// Replica assignment is invalid.
    InvalidReplicaAssignment = 39,
    /// Configuration is invalid.
    InvalidConfig = 40,
    /// This is not the correct controller for this cluster.
    NotController = 41,
    /// This most likely occurs because of a request being malformed by the client library or the message was sent to an incompatible broker.
    InvalidRequest = 42,
    /// The message format version on the broker does not support the request.
    UnsupportedForMessageFormat = 43,
    /// Request parameters do not satisfy the configured policy.
    PolicyViolation = 44,
    /// The broker received an out of order sequence number.
    OutOfOrderSequenceNumber = 45,
    /// The broker received a duplicate sequence number.
    DuplicateSequenceNumber = 46,
    /// Producer attempted an operation with an old epoch.
    InvalidProducerEpoch = 47,
    /// The producer attempted a transactional operation in an invalid state.
    InvalidTxnState = 48,
    /// The producer attempted to use a producer id which is not currently assigned to its transactional id.
    InvalidProducerIdMapping = 49,
    /// The transaction timeout is larger than the maximum value allowed by the broker.
    InvalidTransactionTimeout = 50,
    /// The producer attempted to update a transaction while another concurrent operation on the same transaction was ongoing.
    ConcurrentTransactions = 51,
    /// Indicates that the transaction coordinator sending a WriteTxnMarker is no longer the current coordinator for a given producer.
    TransactionCoordinatorFenced = 52,
    /// Transactional Id authorization failed.
    TransactionalIdAuthorizationFailed = 53,
    /// Security features are disabled.
    SecurityDisabled = 54,
    /// The broker did not attempt to execute this operation.
    OperationNotAttempted = 55,
    /// Disk error when trying to access log file on the disk.
    KafkaStorageError = 56,
    /// The user-specified log directory is not found in the broker config.
    LogDirNotFound = 57,
    /// SASL Authentication failed.
    SaslAuthenticationFailed = 58,
    /// This exception is raised by the broker if it could not locate the producer metadata associated with the producerId in question.
    UnknownProducerId = 59,
    /// A partition reassignment is in progress.
    ReassignmentInProgress = 60,
}

impl KafkaCode {
    /// Codes that signal the client's leader/coordinator mapping is out of
    /// date. A successful metadata refresh is expected to clear them.
    pub fn is_stale_metadata(&self) -> bool {
        matches!(
            self,
            KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::BrokerNotAvailable
                | KafkaCode::CoordinatorNotAvailable
        )
    }

    /// Codes safe to retry without any client-side state change.
    pub fn is_retryable(&self) -> bool {
        self.is_stale_metadata()
            || matches!(
                self,
                KafkaCode::UnknownTopicOrPartition
                    | KafkaCode::RequestTimedOut
                    | KafkaCode::ReplicaNotAvailable
                    | KafkaCode::NetworkException
                    | KafkaCode::CoordinatorLoadInProgress
                    | KafkaCode::NotCoordinator
                    | KafkaCode::NotEnoughReplicas
                    | KafkaCode::NotEnoughReplicasAfterAppend
            )
    }
}
