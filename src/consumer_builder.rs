//! Configure a [`Consumer`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    consumer::{list_offset_at, Consumer, ConsumerOptions, PartitionOffsets, TopicPartitions},
    coordinator::SendCoordinator,
    error::Result,
    network::BrokerChannel,
    retry::RetryPolicy,
    router::{Router, RouterConfig},
};

/// Configure a [`Consumer`].
pub struct ConsumerBuilder<T: BrokerChannel> {
    router: Router<T>,
    retry: RetryPolicy,
    assignment: TopicPartitions,
    offsets: PartitionOffsets,
    options: ConsumerOptions,
}

impl<T: BrokerChannel> ConsumerBuilder<T> {
    /// Start a consumer builder. To complete, use the
    /// [`build`](Self::build) method.
    pub async fn new(seed_addrs: Vec<String>, assignment: TopicPartitions) -> Result<Self> {
        let router = Router::connect(seed_addrs, RouterConfig::default()).await?;
        Ok(Self::with_router(router, assignment))
    }

    /// Start from an already connected router, sharing its topology
    /// cache and connection pool.
    pub fn with_router(router: Router<T>, assignment: TopicPartitions) -> Self {
        Self {
            router,
            retry: RetryPolicy::default(),
            assignment,
            offsets: PartitionOffsets::new(),
            options: ConsumerOptions::default(),
        }
    }

    /// Seek offsets to a given set of partition offsets.
    ///
    /// Overwrites the current offsets with the given offsets.
    pub fn seek(mut self, offsets: &PartitionOffsets) -> Self {
        tracing::debug!("Seeking offsets to given values");
        self.offsets = offsets.clone();
        self
    }

    /// Seek offsets to a given timestamp.
    ///
    /// Given a timestamp, move the offsets for each assigned topic
    /// partition to the point in the log at that time.
    ///
    /// Note: This method overwrites the entire offsets object.
    pub async fn seek_to_timestamp(
        mut self,
        timestamp: i64,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        tracing::debug!("Seeking offsets to timestamp {}", timestamp);
        let coordinator = SendCoordinator::new(self.router.clone(), self.retry.clone());
        self.offsets = PartitionOffsets::new();

        for (topic, partitions) in self.assignment.iter() {
            for partition_id in partitions {
                let offset =
                    list_offset_at(&coordinator, topic, *partition_id, timestamp, cancel).await?;
                self.offsets.insert((topic.clone(), *partition_id), offset);
            }
        }
        tracing::trace!("Offsets set to {:?}", self.offsets);

        Ok(self)
    }

    /// Retry policy of the per-partition fetch loop.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Capacity of the output queue shared by all partition tasks.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.options.buffer_size = buffer_size.max(1);
        self
    }

    /// Pause after a transient fetch failure.
    pub fn backoff_interval(mut self, backoff_interval: Duration) -> Self {
        self.options.backoff_interval = backoff_interval;
        self
    }

    /// Growth factor applied to a partition's fetch buffer when the
    /// broker holds a record larger than it.
    pub fn fetch_buffer_multiplier(mut self, fetch_buffer_multiplier: f64) -> Self {
        self.options.fetch_buffer_multiplier = fetch_buffer_multiplier.max(1.0);
        self
    }

    /// Starting fetch buffer per partition.
    pub fn max_partition_bytes(mut self, max_partition_bytes: i32) -> Self {
        self.options.max_partition_bytes = max_partition_bytes;
        self
    }

    /// The maximum bytes to fetch. See KIP-74 for cases where this limit may not be honored.
    pub fn max_bytes(mut self, max_bytes: i32) -> Self {
        self.options.max_bytes = max_bytes;
        self
    }

    /// The minimum bytes to accumulate in the response.
    pub fn min_bytes(mut self, min_bytes: i32) -> Self {
        self.options.min_bytes = min_bytes;
        self
    }

    /// The maximum time in milliseconds to wait for `min_bytes`.
    pub fn max_wait_ms(mut self, max_wait_ms: i32) -> Self {
        self.options.max_wait_ms = max_wait_ms;
        self
    }

    /// This setting controls the visibility of transactional records. Using READ_UNCOMMITTED (isolation_level = 0) makes all records visible. With READ_COMMITTED (isolation_level = 1), non-transactional and COMMITTED transactional records are visible.
    pub fn isolation_level(mut self, isolation_level: i8) -> Self {
        self.options.isolation_level = isolation_level;
        self
    }

    /// Spawn the per-partition polling tasks and hand back the
    /// consumer.
    pub fn build(self) -> Consumer {
        let coordinator = SendCoordinator::new(self.router, self.retry);

        let mut assignments = Vec::new();
        for (topic, partitions) in self.assignment {
            for partition_id in partitions {
                // missing offsets default to the start of the log
                let offset = self
                    .offsets
                    .get(&(topic.clone(), partition_id))
                    .copied()
                    .unwrap_or(0);
                assignments.push((topic.clone(), partition_id, offset));
            }
        }

        Consumer::start(coordinator, assignments, self.options)
    }
}
