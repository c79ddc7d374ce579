//! Client that consumes records from a cluster.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    coordinator::SendCoordinator,
    error::{Error, Result},
    network::BrokerChannel,
    protocol::{
        self,
        list_offsets::{EARLIEST_OFFSET, LATEST_OFFSET},
        FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    },
    DEFAULT_CORRELATION_ID,
};

const DEFAULT_BUFFER_SIZE: usize = 50;
const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FETCH_BUFFER_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_PARTITION_BYTES: i32 = 32 * 1024;
const DEFAULT_MAX_BYTES: i32 = 1024 * 1024;
const DEFAULT_MIN_BYTES: i32 = 100;
const DEFAULT_MAX_WAIT_MS: i32 = 200;
const DEFAULT_ISOLATION_LEVEL: i8 = 0;

/// Fixed headroom added on top of the multiplied fetch buffer so batch
/// framing never eats the growth.
const FETCH_BUFFER_OVERHEAD: i32 = 512;

/// Used to represent topic-partition assignments.
///
/// Consumers need to be assigned to consume from topics and their
/// partitions. The [`TopicPartitionsBuilder`] is an ease of use type to
/// build these assignments.
pub type TopicPartitions = HashMap<String, Vec<i32>>;

/// Used to represent topic partition offsets.
pub type PartitionOffsets = HashMap<(String, i32), i64>;

/// Build a topic-partition assignment for Consumers.
///
/// # Example
/// ```rust
/// use gregor::prelude::TopicPartitionsBuilder;
///
/// let topic_partitions = TopicPartitionsBuilder::new()
///     .assign(String::from("topic1"), vec![0, 1, 2])
///     .assign(String::from("topic2"), vec![3, 4, 5])
///     .build();
/// ```
#[derive(Default)]
pub struct TopicPartitionsBuilder {
    data: TopicPartitions,
}

impl TopicPartitionsBuilder {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Add assignment for a topic and its partitions.
    pub fn assign(mut self, topic: String, partitions: Vec<i32>) -> Self {
        self.data.insert(topic, partitions);

        self
    }

    pub fn build(self) -> TopicPartitions {
        self.data
    }
}

/// Common consumed message format.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeRecord {
    pub topic: String,
    pub partition_id: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub headers: Vec<(Bytes, Bytes)>,
}

/// Fetching knobs shared by every partition task of one consumer.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Capacity of the consumer's output queue; delivery suspends
    /// while it is full.
    pub buffer_size: usize,
    /// Pause after a transient fetch failure.
    pub backoff_interval: Duration,
    /// Growth factor applied to the partition fetch buffer on
    /// underrun.
    pub fetch_buffer_multiplier: f64,
    /// Starting per-partition fetch buffer.
    pub max_partition_bytes: i32,
    /// The maximum bytes to fetch per request. See KIP-74 for cases where this limit may not be honored.
    pub max_bytes: i32,
    /// The minimum bytes the broker accumulates before answering.
    pub min_bytes: i32,
    /// The maximum time in milliseconds the broker waits for `min_bytes`.
    pub max_wait_ms: i32,
    /// READ_UNCOMMITTED (0) or READ_COMMITTED (1).
    pub isolation_level: i8,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            backoff_interval: DEFAULT_BACKOFF_INTERVAL,
            fetch_buffer_multiplier: DEFAULT_FETCH_BUFFER_MULTIPLIER,
            max_partition_bytes: DEFAULT_MAX_PARTITION_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
            min_bytes: DEFAULT_MIN_BYTES,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            isolation_level: DEFAULT_ISOLATION_LEVEL,
        }
    }
}

/// Kafka/Redpanda Consumer.
///
/// One polling task per assigned partition fetches records through the
/// send coordinator and delivers them, in partition order, to a
/// bounded queue read with [`recv`](Self::recv) or
/// [`into_stream`](Self::into_stream). Each task tracks its own
/// offset, grows its fetch buffer when the broker holds records larger
/// than it, and clamps the offset back into the broker's retention
/// window when it falls out of range.
pub struct Consumer {
    receiver: mpsc::Receiver<ConsumeRecord>,
    cancel: CancellationToken,
    // aborts the partition tasks when the consumer is dropped
    _tasks: JoinSet<()>,
}

impl Consumer {
    pub(crate) fn start<T: BrokerChannel>(
        coordinator: SendCoordinator<T>,
        assignments: Vec<(String, i32, i64)>,
        options: ConsumerOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(options.buffer_size);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (topic, partition_id, offset) in assignments {
            tasks.spawn(poll_partition(
                coordinator.clone(),
                topic,
                partition_id,
                offset,
                options.clone(),
                sender.clone(),
                cancel.clone(),
            ));
        }

        Self {
            receiver,
            cancel,
            _tasks: tasks,
        }
    }

    /// Await the next record from any assigned partition. Returns
    /// `None` once the consumer is stopped and drained.
    pub async fn recv(&mut self) -> Option<ConsumeRecord> {
        self.receiver.recv().await
    }

    /// Stop the partition tasks. In-flight fetches are allowed to
    /// complete; already-buffered records can still be received.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Convert the consumer into an asynchronous iterator.
    #[must_use = "stream does nothing by itself"]
    pub fn into_stream(mut self) -> impl Stream<Item = ConsumeRecord> {
        async_stream::stream! {
            while let Some(record) = self.recv().await {
                yield record;
            }
        }
    }
}

async fn poll_partition<T: BrokerChannel>(
    coordinator: SendCoordinator<T>,
    topic: String,
    partition_id: i32,
    mut offset: i64,
    options: ConsumerOptions,
    output: mpsc::Sender<ConsumeRecord>,
    cancel: CancellationToken,
) {
    let mut max_partition_bytes = options.max_partition_bytes;
    // fetches in flight at cancellation run to completion; the loop
    // checks the token between iterations instead
    let request_cancel = CancellationToken::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let partition = match fetch_partition(
            &coordinator,
            &topic,
            partition_id,
            offset,
            max_partition_bytes,
            &options,
            &request_cancel,
        )
        .await
        {
            Ok(partition) => partition,
            Err(Error::FetchOutOfRange { .. }) => {
                match fix_offset(&coordinator, &topic, partition_id, offset, &request_cancel).await
                {
                    Ok(fixed) => {
                        tracing::warn!(
                            "Offset {} out of range for {}:{}, clamped to {}",
                            offset,
                            topic,
                            partition_id,
                            fixed
                        );
                        offset = fixed;
                    }
                    Err(err) => {
                        tracing::error!(
                            "ERROR: Failed clamping offset for {}:{} {:?}",
                            topic,
                            partition_id,
                            err
                        );
                        if pause(&options, &cancel).await.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            Err(Error::Cancelled) => break,
            Err(err) => {
                tracing::warn!(
                    "Fetch for {}:{} failed, backing off: {:?}",
                    topic,
                    partition_id,
                    err
                );
                if pause(&options, &cancel).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if partition.truncated && partition.record_count() == 0 {
            let underrun = Error::BufferUnderrun {
                limit: max_partition_bytes as usize,
            };
            max_partition_bytes = (max_partition_bytes as f64 * options.fetch_buffer_multiplier)
                as i32
                + FETCH_BUFFER_OVERHEAD;
            tracing::debug!(
                "{:?} on {}:{}, growing fetch buffer to {}",
                underrun,
                topic,
                partition_id,
                max_partition_bytes
            );
            continue;
        }

        for (_, _, base_offset, base_timestamp, record) in partition.into_box_iter() {
            let record_offset = base_offset + record.offset_delta;
            // batches replay from their base; skip what we already saw
            if record_offset < offset {
                continue;
            }
            let message = ConsumeRecord {
                topic: topic.clone(),
                partition_id,
                offset: record_offset,
                timestamp: base_timestamp + record.timestamp_delta,
                key: record.key,
                value: record.value,
                headers: record
                    .headers
                    .into_iter()
                    .map(|header| (header.key, header.value))
                    .collect(),
            };
            tokio::select! {
                sent = output.send(message) => {
                    if sent.is_err() {
                        tracing::debug!("Consumer output closed, exiting {}:{}", topic, partition_id);
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
            offset = record_offset + 1;
        }
    }

    tracing::debug!("Consumer task for {}:{} exiting", topic, partition_id);
}

/// One fetch round-trip, returning our partition's slice of the
/// response.
async fn fetch_partition<T: BrokerChannel>(
    coordinator: &SendCoordinator<T>,
    topic: &str,
    partition_id: i32,
    offset: i64,
    max_partition_bytes: i32,
    options: &ConsumerOptions,
    cancel: &CancellationToken,
) -> Result<protocol::fetch::response::Partition> {
    let mut request = FetchRequest::new(
        DEFAULT_CORRELATION_ID,
        coordinator.router().client_id(),
        options.max_wait_ms,
        options.min_bytes,
        options.max_bytes,
        options.isolation_level,
    );
    request.add(topic, partition_id, offset, max_partition_bytes);

    let response: FetchResponse = coordinator
        .send_to_partition(&request, topic, partition_id, cancel)
        .await?;

    response
        .topics
        .into_iter()
        .find(|t| t.name.as_ref() == topic.as_bytes())
        .and_then(|t| {
            t.partitions
                .into_iter()
                .find(|partition| partition.id == partition_id)
        })
        .ok_or_else(|| Error::CachedMetadata {
            topic: topic.to_string(),
            partition: Some(partition_id),
        })
}

/// Clamp `offset` into the broker's retention window.
async fn fix_offset<T: BrokerChannel>(
    coordinator: &SendCoordinator<T>,
    topic: &str,
    partition_id: i32,
    offset: i64,
    cancel: &CancellationToken,
) -> Result<i64> {
    let earliest = list_offset_at(coordinator, topic, partition_id, EARLIEST_OFFSET, cancel).await?;
    let latest = list_offset_at(coordinator, topic, partition_id, LATEST_OFFSET, cancel).await?;
    Ok(offset.max(earliest).min(latest.max(earliest)))
}

/// Look up the single offset a broker holds for `timestamp`.
pub async fn list_offset_at<T: BrokerChannel>(
    coordinator: &SendCoordinator<T>,
    topic: &str,
    partition_id: i32,
    timestamp: i64,
    cancel: &CancellationToken,
) -> Result<i64> {
    let mut request =
        ListOffsetsRequest::new(DEFAULT_CORRELATION_ID, coordinator.router().client_id(), -1);
    request.add(topic, partition_id, timestamp);

    let response: ListOffsetsResponse = coordinator
        .send_to_partition(&request, topic, partition_id, cancel)
        .await?;

    response
        .into_box_iter()
        .find(|(name, partition)| {
            name.as_ref() == topic.as_bytes() && partition.partition_index == partition_id
        })
        .map(|(_, partition)| partition.offset)
        .ok_or_else(|| Error::CachedMetadata {
            topic: topic.to_string(),
            partition: Some(partition_id),
        })
}

async fn pause(options: &ConsumerOptions, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(options.backoff_interval) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
