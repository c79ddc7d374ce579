//! Configure a [`Producer`].

use std::time::Duration;

use crate::{
    compression::Compression,
    error::Result,
    network::BrokerChannel,
    producer::{ProduceOptions, Producer},
    router::{Router, RouterConfig},
};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_BATCH_MAX_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_REQUEST_PARALLELIZATION: usize = 3;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub(crate) struct ProducerConfig {
    pub batch_size: usize,
    pub batch_max_delay: Duration,
    pub request_parallelization: usize,
    pub stop_timeout: Duration,
    pub produce: ProduceOptions,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_max_delay: DEFAULT_BATCH_MAX_DELAY,
            request_parallelization: DEFAULT_REQUEST_PARALLELIZATION,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            produce: ProduceOptions::default(),
        }
    }
}

/// Configure a [`Producer`].
///
/// ### Example
/// ```ignore
/// let producer = ProducerBuilder::<TcpChannel>::new(vec!["localhost:9092".to_string()])
///     .await?
///     .batch_size(500)
///     .batch_max_delay(Duration::from_millis(5))
///     .required_acks(1)
///     .build();
/// ```
pub struct ProducerBuilder<T: BrokerChannel> {
    router: Router<T>,
    config: ProducerConfig,
}

impl<T: BrokerChannel> ProducerBuilder<T> {
    /// Start a producer builder from seed broker addresses. To
    /// complete, use the [`build`](Self::build) method.
    pub async fn new(seed_addrs: Vec<String>) -> Result<Self> {
        let router = Router::connect(seed_addrs, RouterConfig::default()).await?;
        Ok(Self::with_router(router))
    }

    /// Start from an already connected router, sharing its topology
    /// cache and connection pool.
    pub fn with_router(router: Router<T>) -> Self {
        Self {
            router,
            config: ProducerConfig::default(),
        }
    }

    /// The max number of records one batch collects before flushing.
    ///
    /// Increasing this number will increase latency, but also increase
    /// throughput.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// The maximum time a record will sit in the queue before its
    /// batch is flushed regardless of size.
    ///
    /// Decreasing this number will lower latency, but also lower
    /// throughput.
    pub fn batch_max_delay(mut self, batch_max_delay: Duration) -> Self {
        self.config.batch_max_delay = batch_max_delay;
        self
    }

    /// Cap on produce requests in flight across all brokers; the
    /// batcher stalls when it is reached.
    pub fn request_parallelization(mut self, request_parallelization: usize) -> Self {
        self.config.request_parallelization = request_parallelization.max(1);
        self
    }

    /// How long [`Producer::stop`] waits for the worker to drain.
    pub fn stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.config.stop_timeout = stop_timeout;
        self
    }

    /// The number of acknowledgments the producer requires the leader to have received before considering a request complete. Allowed values: 0 for no acknowledgments, 1 for only the leader and -1 for the full ISR.
    pub fn required_acks(mut self, required_acks: i16) -> Self {
        self.config.produce.required_acks = required_acks;
        self
    }

    /// The timeout the broker is given to collect the acks, in
    /// milliseconds.
    pub fn ack_timeout_ms(mut self, ack_timeout_ms: i32) -> Self {
        self.config.produce.ack_timeout_ms = ack_timeout_ms;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.produce.compression = compression;
        self
    }

    pub fn build(self) -> Producer {
        Producer::start(self.router, self.config)
    }
}
