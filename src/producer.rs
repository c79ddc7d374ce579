//! Client that sends records to a cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    compression::Compression,
    error::{Error, KafkaCode, Result},
    network::{BrokerChannel, BrokerEndpoint},
    producer_builder::ProducerConfig,
    protocol::{produce::request::Attributes, Header, ProduceRequest, ProduceResponse},
    router::Router,
    DEFAULT_CORRELATION_ID,
};

/// One record bound for a topic.
///
/// Leaving `partition_id` unset hands the choice to the router's
/// partition selector, keyed on `key`.
#[derive(Clone, Debug, Default)]
pub struct ProduceRecord {
    pub topic: String,
    pub partition_id: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    /// Create-time in unix millis; the enqueue time when unset.
    pub timestamp: Option<i64>,
}

/// Per-send knobs; every record of one `send` call shares them.
#[derive(Clone, Copy, Debug)]
pub struct ProduceOptions {
    /// The number of acknowledgments the producer requires the leader to have received before considering a request complete. Allowed values: 0 for no acknowledgments, 1 for only the leader and -1 for the full ISR.
    pub required_acks: i16,
    /// How long the broker may wait for the acks, delivered in the request.
    pub ack_timeout_ms: i32,
    pub compression: Compression,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            required_acks: 1,
            ack_timeout_ms: 1000,
            compression: Compression::None,
        }
    }
}

/// What the broker said about one record.
#[derive(Clone, Debug, PartialEq)]
pub struct ProduceConfirmation {
    pub topic: String,
    pub partition_id: i32,
    /// The offset assigned to this record, or -1 for acks=0 sends.
    pub offset: i64,
    pub error_code: KafkaCode,
    /// The broker's append time, or -1 when the topic uses create time.
    pub log_append_time: i64,
}

/// Per-record result: `None` when the broker response had no entry for
/// the record's topic and partition.
pub type ProduceOutcome = Option<ProduceConfirmation>;

pub(crate) struct ProduceTask {
    record: ProduceRecord,
    options: ProduceOptions,
    cancel: CancellationToken,
    slot: oneshot::Sender<Result<ProduceOutcome>>,
}

/// Kafka/Redpanda Producer.
///
/// This struct is a handle to a background worker that does the actual
/// producing. The worker collects incoming records in a queue and
/// flushes it when either the batch size is reached or the batch delay
/// runs out; those two knobs on the
/// [`ProducerBuilder`](crate::prelude::ProducerBuilder) trade latency
/// against throughput. Flushed batches are grouped by broker, encoded
/// into one request per broker, and capped in flight by the
/// request-parallelization semaphore.
///
/// Every enqueued record resolves exactly once: with the offset the
/// broker assigned, with a typed error, or as cancelled.
pub struct Producer {
    sender: Mutex<Option<mpsc::UnboundedSender<ProduceTask>>>,
    sending: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    options: ProduceOptions,
    stop_timeout: Duration,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    pub(crate) fn start<T: BrokerChannel>(router: Router<T>, config: ProducerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sending = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_batcher(
            router,
            receiver,
            config.clone(),
            in_flight.clone(),
        ));

        Self {
            sender: Mutex::new(Some(sender)),
            sending,
            in_flight,
            options: config.produce,
            stop_timeout: config.stop_timeout,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Produce `records` with the builder's default options.
    ///
    /// Returns one result per input record, in input order. Partial
    /// failures are per-record; only a dead connection fails a whole
    /// batch.
    pub async fn send(
        &self,
        records: Vec<ProduceRecord>,
        cancel: CancellationToken,
    ) -> Result<Vec<Result<ProduceOutcome>>> {
        self.send_with(records, self.options, cancel).await
    }

    /// Produce `records` with explicit acks, timeout, and codec.
    pub async fn send_with(
        &self,
        records: Vec<ProduceRecord>,
        options: ProduceOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<Result<ProduceOutcome>>> {
        let mut slots = Vec::with_capacity(records.len());
        {
            let sender = self.sender.lock().expect("producer sender poisoned");
            let Some(sender) = sender.as_ref() else {
                return Err(Error::ProducerStopped);
            };
            self.sending.fetch_add(records.len(), Ordering::SeqCst);
            for record in records {
                let (slot, receiver) = oneshot::channel();
                let task = ProduceTask {
                    record,
                    options,
                    cancel: cancel.clone(),
                    slot,
                };
                // a dropped task resolves its receiver as stopped below
                let _ = sender.send(task);
                slots.push(receiver);
            }
        }

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let result = match slot.await {
                Ok(result) => result,
                Err(_) => Err(Error::ProducerStopped),
            };
            self.sending.fetch_sub(1, Ordering::SeqCst);
            results.push(result);
        }
        Ok(results)
    }

    /// Records enqueued whose completion slots have not resolved yet.
    pub fn sending_count(&self) -> usize {
        self.sending.load(Ordering::SeqCst)
    }

    /// Produce requests currently on the wire.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Close the input queue and wait for the worker to drain, up to
    /// the configured stop timeout. A second call is a no-op.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let sender = self.sender.lock().expect("producer sender poisoned").take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            tokio::select! {
                _ = worker => {}
                _ = tokio::time::sleep(self.stop_timeout) => {
                    tracing::warn!("Producer worker did not drain within {:?}", self.stop_timeout);
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }
}

async fn run_batcher<T: BrokerChannel>(
    router: Router<T>,
    receiver: mpsc::UnboundedReceiver<ProduceTask>,
    config: ProducerConfig,
    in_flight: Arc<AtomicUsize>,
) {
    let semaphore = Arc::new(Semaphore::new(config.request_parallelization));
    // requests on the wire outlive any one caller; the batcher owns
    // their cancellation
    let worker_cancel = CancellationToken::new();

    let stream = UnboundedReceiverStream::new(receiver)
        .chunks_timeout(config.batch_size, config.batch_max_delay);
    tokio::pin!(stream);

    let mut sends = JoinSet::new();
    while let Some(batch) = stream.next().await {
        let mut live = Vec::with_capacity(batch.len());
        for task in batch {
            if task.cancel.is_cancelled() {
                let _ = task.slot.send(Err(Error::Cancelled));
            } else {
                live.push(task);
            }
        }
        if live.is_empty() {
            continue;
        }

        flush(
            &router,
            live,
            &semaphore,
            &in_flight,
            &worker_cancel,
            &mut sends,
        )
        .await;

        // reap finished sends without blocking the next batch
        while sends.try_join_next().is_some() {}
    }

    // the input side closed; let the final requests complete
    while sends.join_next().await.is_some() {}
    tracing::debug!("Producer worker exiting");
}

/// Turn one collected batch into produce requests: split by codec,
/// route every record, group by `(acks, ack timeout, endpoint)`, and
/// put one request per group on the wire under the in-flight cap.
async fn flush<T: BrokerChannel>(
    router: &Router<T>,
    tasks: Vec<ProduceTask>,
    semaphore: &Arc<Semaphore>,
    in_flight: &Arc<AtomicUsize>,
    worker_cancel: &CancellationToken,
    sends: &mut JoinSet<()>,
) {
    tracing::info!("Producing {} records", tasks.len());

    // best effort: routes below still work off the last snapshot when
    // the refresh fails, and per-record errors surface the rest
    let topics: Vec<String> = tasks
        .iter()
        .map(|task| task.record.topic.clone())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    if let Err(err) = router.refresh_topics(&topics, worker_cancel).await {
        tracing::warn!("Metadata refresh before produce failed: {:?}", err);
    }

    let mut by_codec: Vec<(Compression, Vec<ProduceTask>)> = Vec::new();
    for task in tasks {
        let codec = task.options.compression;
        match by_codec.iter_mut().find(|(existing, _)| *existing == codec) {
            Some((_, tasks)) => tasks.push(task),
            None => by_codec.push((codec, vec![task])),
        }
    }

    for (codec, tasks) in by_codec {
        let mut groups: Vec<(GroupKey, EndpointGroup<T>)> = Vec::new();
        for task in tasks {
            let route = match task.record.partition_id {
                Some(partition_id) => router.route_to_partition(&task.record.topic, partition_id),
                None => router.route_by_key(&task.record.topic, task.record.key.as_ref()),
            };
            match route {
                Ok(route) => {
                    let key = GroupKey {
                        required_acks: task.options.required_acks,
                        ack_timeout_ms: task.options.ack_timeout_ms,
                        endpoint: route.connection.endpoint().clone(),
                    };
                    match groups.iter_mut().find(|(existing, _)| *existing == key) {
                        Some((_, group)) => group.tasks.push((task, route.partition_id)),
                        None => groups.push((
                            key,
                            EndpointGroup {
                                connection: route.connection,
                                tasks: vec![(task, route.partition_id)],
                            },
                        )),
                    }
                }
                Err(err) => {
                    let _ = task.slot.send(Err(err));
                }
            }
        }

        for (key, group) in groups {
            let mut request = ProduceRequest::new(
                key.required_acks,
                key.ack_timeout_ms,
                DEFAULT_CORRELATION_ID,
                router.client_id(),
                Attributes::new(codec),
            );
            // group by (topic, partition), preserving enqueue order
            // within each payload so offsets fan out as base + index
            let mut payloads: Vec<((String, i32), Vec<ProduceTask>)> = Vec::new();
            for (task, partition_id) in group.tasks {
                request.add(
                    &task.record.topic,
                    partition_id,
                    task.record.key.clone(),
                    task.record.value.clone(),
                    task.record.headers.clone(),
                    task.record.timestamp,
                );
                let key = (task.record.topic.clone(), partition_id);
                match payloads.iter_mut().find(|(existing, _)| *existing == key) {
                    Some((_, tasks)) => tasks.push(task),
                    None => payloads.push((key, vec![task])),
                }
            }

            // the in-flight cap is the producer's backpressure: the
            // batcher parks here when too many sends are outstanding
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("produce semaphore closed");
            in_flight.fetch_add(1, Ordering::SeqCst);

            let connection = group.connection;
            let router = router.clone();
            let in_flight = in_flight.clone();
            let cancel = worker_cancel.clone();
            sends.spawn(async move {
                let result = connection.send(&request, None, &cancel).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                complete(&router, payloads, result, connection.endpoint());
            });
        }
    }
}

#[derive(PartialEq)]
struct GroupKey {
    required_acks: i16,
    ack_timeout_ms: i32,
    endpoint: BrokerEndpoint,
}

struct EndpointGroup<T> {
    connection: T,
    tasks: Vec<(ProduceTask, i32)>,
}

/// Resolve every task of one request from the broker's response.
fn complete<T: BrokerChannel>(
    router: &Router<T>,
    payloads: Vec<((String, i32), Vec<ProduceTask>)>,
    result: Result<Option<Bytes>>,
    endpoint: &BrokerEndpoint,
) {
    let bytes = match result {
        Err(err) => {
            tracing::error!("Produce to {} failed: {:?}", endpoint, err);
            for (_, tasks) in payloads {
                for task in tasks {
                    let _ = task.slot.send(Err(err.clone()));
                }
            }
            return;
        }
        // acks=0: flushed is as done as it gets
        Ok(None) => {
            for ((topic, partition_id), tasks) in payloads {
                for task in tasks {
                    let _ = task.slot.send(Ok(Some(ProduceConfirmation {
                        topic: topic.clone(),
                        partition_id,
                        offset: -1,
                        error_code: KafkaCode::None,
                        log_append_time: -1,
                    })));
                }
            }
            return;
        }
        Ok(Some(bytes)) => bytes,
    };

    let response = match ProduceResponse::try_from(bytes) {
        Ok(response) => response,
        Err(err) => {
            for (_, tasks) in payloads {
                for task in tasks {
                    let _ = task.slot.send(Err(err.clone()));
                }
            }
            return;
        }
    };

    let mut by_partition = HashMap::new();
    for topic_response in &response.responses {
        let name = String::from_utf8_lossy(topic_response.name.as_ref()).to_string();
        for partition in &topic_response.partition_responses {
            by_partition.insert((name.clone(), partition.index), partition.clone());
        }
    }

    for ((topic, partition_id), tasks) in payloads {
        match by_partition.remove(&(topic.clone(), partition_id)) {
            Some(partition) => {
                if partition.error_code.is_stale_metadata() {
                    // force the next batch to re-resolve leadership
                    router.invalidate_topic(&topic);
                }
                for (index, task) in tasks.into_iter().enumerate() {
                    let offset = if partition.error_code == KafkaCode::None {
                        partition.base_offset + index as i64
                    } else {
                        partition.base_offset
                    };
                    let _ = task.slot.send(Ok(Some(ProduceConfirmation {
                        topic: topic.clone(),
                        partition_id,
                        offset,
                        error_code: partition.error_code,
                        log_append_time: partition.log_append_time,
                    })));
                }
            }
            None => {
                tracing::warn!(
                    "No response entry for topic {} partition {}",
                    topic,
                    partition_id
                );
                for task in tasks {
                    let _ = task.slot.send(Ok(None));
                }
            }
        }
    }

    for (topic, partition) in by_partition.keys() {
        tracing::error!(
            "ERROR: Response from {} for unrequested topic {} partition {}",
            endpoint,
            topic,
            partition
        );
    }
}
