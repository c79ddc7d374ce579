//! # Gregor
//! Rust-native Apache Kafka client with a multiplexing connection layer.
//!
//! This crate provides Rust native producers and consumers as well as
//! low level bindings for the Apache Kafka protocol. Everything is Rust
//! all the way down; meaning memory safety, safe concurrency, low
//! resource usage, and of course blazing speed.
//!
//! ## Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as Tokio, Nom to do the heavy lifting
//! - Hide broker topology, leader election, batching, and recovery from
//!   transient cluster changes behind small surfaces
//! - Be a good building block for future works based around Kafka
//!
//! ## The moving parts
//!
//! - A [`TcpChannel`](prelude::TcpChannel) holds one socket to one
//!   broker and multiplexes any number of concurrent request/response
//!   pairs over it by correlation id.
//! - The [`Router`](prelude::Router) caches cluster topology - which
//!   broker leads which partition, which broker coordinates which
//!   group - and pools one channel per broker, refreshing lazily when a
//!   lookup misses or the cluster moves.
//! - The [`SendCoordinator`](prelude::SendCoordinator) wraps the two
//!   with the retry loop every topic-scoped request wants: route, send,
//!   classify, maybe refresh, try again.
//! - The [`Producer`](prelude::Producer) batches records behind a
//!   queue, groups each batch by broker, bounds the requests in flight,
//!   and resolves every record with the offset the broker assigned.
//! - The [`Consumer`](prelude::Consumer) polls each assigned partition
//!   in its own task and delivers records in partition order to a
//!   bounded queue.
//!
//! ## Getting started
//!
//! ### Producer
//! A [`Producer`](prelude::Producer) sends records to the given topic.
//! To instantiate one, start with a
//! [`ProducerBuilder`](prelude::ProducerBuilder).
//!
//! It is buffered, with both a delay and a volume threshold that flush
//! the queue when reached. This is how latency and throughput can be
//! tweaked to achieve the desired rates.
//! ```ignore
//! use gregor::prelude::*;
//!
//! let producer = ProducerBuilder::<TcpChannel>::new(vec!["localhost:9092".to_string()])
//!     .await?
//!     .batch_size(100)
//!     .required_acks(1)
//!     .build();
//!
//! let record = ProduceRecord {
//!     topic: "my-topic".to_string(),
//!     key: Some(bytes::Bytes::from_static(b"Tester")),
//!     value: Some(bytes::Bytes::from_static(b"Value")),
//!     ..Default::default()
//! };
//!
//! let results = producer.send(vec![record], CancellationToken::new()).await?;
//! ```
//!
//! ### Consumer
//! A [`Consumer`](prelude::Consumer) fetches records from the broker.
//! To instantiate one, start with a
//! [`ConsumerBuilder`](prelude::ConsumerBuilder).
//! ```ignore
//! use gregor::prelude::*;
//! use tokio_stream::StreamExt;
//!
//! let assignment = TopicPartitionsBuilder::new()
//!     .assign("my-topic".to_string(), vec![0, 1])
//!     .build();
//!
//! let mut consumer = ConsumerBuilder::<TcpChannel>::new(
//!     vec!["localhost:9092".to_string()],
//!     assignment,
//! )
//! .await?
//! .build();
//!
//! while let Some(record) = consumer.recv().await {
//!     println!("{:?}", record);
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

mod compression;
mod consumer;
mod consumer_builder;
mod coordinator;
mod encode;
mod error;
mod network;
mod parser;
mod producer;
mod producer_builder;
mod protocol;
mod retry;
mod router;
mod selector;
mod utils;

/// Placeholder correlation id baked into freshly built requests; the
/// connection assigns the real one as the frame goes out.
const DEFAULT_CORRELATION_ID: i32 = 0;
const DEFAULT_CLIENT_ID: &str = "gregor";

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! We break the library into four main sections: the network layer,
    //! the router, producing, and consuming.
    //!
    //! # Network
    //!
    //! [`TcpChannel`] is the duplex connection to one broker. Many
    //! requests can be in flight on one channel at once; responses are
    //! matched to callers by correlation id, so they may complete in
    //! any order. Implement [`BrokerChannel`] to swap the transport
    //! out.
    //!
    //! # Routing
    //!
    //! The [`Router`] maps topics, partitions, and consumer groups to
    //! broker connections, caching topology snapshots and refreshing
    //! them when a lookup misses or a broker reports them stale. The
    //! [`SendCoordinator`] is the retry loop over it.
    //!
    //! # Producing
    //!
    //! The [`Producer`] queues records and flushes them in batches, one
    //! request per broker per batch, with the number of in-flight
    //! requests capped. Per-record outcomes carry the assigned offset.
    //!
    //! ## Example
    //! ```ignore
    //! let producer = ProducerBuilder::<TcpChannel>::new(bootstrap_addrs).await?.build();
    //! let results = producer.send(records, CancellationToken::new()).await?;
    //! ```
    //!
    //! # Consuming
    //!
    //! The [`Consumer`] runs one polling loop per assigned partition
    //! and hands records out in partition order, with back-pressure
    //! through its bounded buffer.
    //!
    //! ## Example
    //! ```ignore
    //! let mut consumer = ConsumerBuilder::<TcpChannel>::new(bootstrap_addrs, assignment)
    //!     .await?
    //!     .build();
    //! while let Some(record) = consumer.recv().await {
    //!     println!("{:?}", record);
    //! }
    //! ```

    pub use crate::compression::Compression;
    pub use crate::consumer::{
        ConsumeRecord, Consumer, ConsumerOptions, PartitionOffsets, TopicPartitions,
        TopicPartitionsBuilder,
    };
    pub use crate::consumer_builder::ConsumerBuilder;
    pub use crate::coordinator::SendCoordinator;
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::network::{tcp::TcpChannel, BrokerChannel, BrokerEndpoint, ChannelConfig};
    pub use crate::producer::{
        ProduceConfirmation, ProduceOptions, ProduceOutcome, ProduceRecord, Producer,
    };
    pub use crate::producer_builder::ProducerBuilder;
    pub use crate::retry::RetryPolicy;
    pub use crate::router::{
        GroupCoordinator, PartitionMetadata, Route, Router, RouterConfig, TopicMetadata,
    };
    pub use crate::selector::{DefaultPartitionSelector, PartitionSelector};

    pub use bytes;
    pub use tokio_util::sync::CancellationToken;

    pub mod encode {
        pub use crate::encode::*;
    }

    pub mod protocol {
        pub use crate::protocol::*;
    }
}
