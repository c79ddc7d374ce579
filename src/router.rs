//! Cluster topology cache & request routing.
//!
//! The router keeps the client's picture of the cluster: which brokers
//! exist, which one leads each partition, which one coordinates each
//! group, and one live connection per broker endpoint. Lookups run on
//! an immutable snapshot and never block; refreshes serialize on a
//! single lock, rebuild the snapshot, and swap it in whole.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, KafkaCode, Result},
    network::{BrokerChannel, BrokerEndpoint, ChannelConfig},
    protocol::{
        self, FindCoordinatorRequest, FindCoordinatorResponse, KafkaRequest, MetadataRequest,
        MetadataResponse,
    },
    retry::RetryPolicy,
    selector::{DefaultPartitionSelector, PartitionSelector},
    DEFAULT_CLIENT_ID, DEFAULT_CORRELATION_ID,
};

const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_millis(10);
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(200);

/// Everything the router caches about one topic.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicMetadata {
    pub name: String,
    /// Partitions ordered by id.
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    pub fn partition(&self, partition_id: i32) -> Option<&PartitionMetadata> {
        self.partitions
            .iter()
            .find(|partition| partition.id == partition_id)
    }

    fn from_wire(topic: &protocol::metadata::response::Topic) -> Result<Self> {
        let name = std::str::from_utf8(topic.name.as_ref())
            .map_err(|err| {
                tracing::error!("Error converting from UTF8 {:?}", err);
                Error::DecodingUtf8Error
            })?
            .to_string();
        let mut partitions: Vec<PartitionMetadata> = topic
            .partitions
            .iter()
            .map(|partition| PartitionMetadata {
                id: partition.partition_index,
                leader_id: partition.leader_id,
                replica_nodes: partition.replica_nodes.clone(),
                isr_nodes: partition.isr_nodes.clone(),
                error_code: partition.error_code,
            })
            .collect();
        partitions.sort_by_key(|partition| partition.id);
        Ok(TopicMetadata { name, partitions })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionMetadata {
    pub id: i32,
    /// The leading broker, or -1 while an election is in progress.
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub error_code: KafkaCode,
}

/// Which broker coordinates a consumer group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupCoordinator {
    pub group_id: String,
    pub broker_id: i32,
}

#[derive(Clone, Debug)]
struct CachedTopic {
    metadata: TopicMetadata,
    fetched_at: Instant,
}

#[derive(Clone, Debug)]
struct CachedGroup {
    coordinator: GroupCoordinator,
    fetched_at: Instant,
}

/// A resolved way to reach the leader of one partition. Transient: the
/// route itself is never cached, only the connection inside it is.
#[derive(Clone, Debug)]
pub struct Route<T> {
    pub topic: String,
    pub partition_id: i32,
    pub connection: T,
}

/// Router construction knobs; see the library docs for the full list.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub client_id: String,
    /// Freshness window of a cached metadata entry.
    pub cache_expiration: Duration,
    /// Deadline for one metadata round-trip.
    pub refresh_timeout: Duration,
    /// Backoff policy for metadata fetches.
    pub refresh_retry: RetryPolicy,
    pub channel: ChannelConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            cache_expiration: DEFAULT_CACHE_EXPIRATION,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            refresh_retry: RetryPolicy::default(),
            channel: ChannelConfig::default(),
        }
    }
}

struct RouterState<T> {
    connections_by_endpoint: HashMap<BrokerEndpoint, T>,
    connections_by_broker: HashMap<i32, T>,
    topics: HashMap<String, CachedTopic>,
    groups: HashMap<String, CachedGroup>,
}

impl<T: Clone> RouterState<T> {
    fn route_to_partition(&self, topic: &str, partition_id: i32) -> Result<Route<T>> {
        let miss = || Error::CachedMetadata {
            topic: topic.to_string(),
            partition: Some(partition_id),
        };

        let cached = self.topics.get(topic).ok_or_else(miss)?;
        let partition = cached.metadata.partition(partition_id).ok_or_else(miss)?;
        if partition.leader_id < 0 {
            return Err(miss());
        }
        let connection = self
            .connections_by_broker
            .get(&partition.leader_id)
            .ok_or_else(miss)?
            .clone();

        Ok(Route {
            topic: topic.to_string(),
            partition_id,
            connection,
        })
    }
}

struct RouterInner<T> {
    config: RouterConfig,
    selector: Box<dyn PartitionSelector>,
    state: RwLock<Arc<RouterState<T>>>,
    /// Serializes every metadata and coordinator refresh; also what
    /// keeps two concurrent cache misses from issuing two
    /// MetadataRequests.
    refresh_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

/// Maps topics, partitions, and groups to broker connections.
pub struct Router<T: BrokerChannel> {
    inner: Arc<RouterInner<T>>,
}

impl<T: BrokerChannel> Clone for Router<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: BrokerChannel> std::fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("Router")
            .field("brokers", &state.connections_by_broker.keys())
            .field("topics", &state.topics.keys())
            .field("groups", &state.groups.keys())
            .finish()
    }
}

impl<T: BrokerChannel> Router<T> {
    /// Connect to a cluster through one or more seed `host:port`
    /// addresses.
    ///
    /// Seeds that fail to resolve are dropped with a warning;
    /// construction fails only when none resolves.
    pub async fn connect(seed_addrs: Vec<String>, config: RouterConfig) -> Result<Self> {
        Self::connect_with_selector(seed_addrs, config, Box::<DefaultPartitionSelector>::default())
            .await
    }

    pub async fn connect_with_selector(
        seed_addrs: Vec<String>,
        config: RouterConfig,
        selector: Box<dyn PartitionSelector>,
    ) -> Result<Self> {
        tracing::debug!("Connecting to cluster at {}", seed_addrs.join(","));
        let mut connections_by_endpoint = HashMap::new();
        for addr in &seed_addrs {
            let endpoint = match BrokerEndpoint::parse(addr) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    tracing::warn!("Dropping seed {}: {:?}", addr, err);
                    continue;
                }
            };
            if connections_by_endpoint.contains_key(&endpoint) {
                continue;
            }
            match T::connect(endpoint.clone(), config.channel.clone()).await {
                Ok(connection) => {
                    connections_by_endpoint.insert(endpoint, connection);
                }
                Err(err) => {
                    tracing::warn!("Dropping seed {}: {:?}", addr, err);
                }
            }
        }

        if connections_by_endpoint.is_empty() {
            return Err(Error::NoBrokerReachable(seed_addrs.join(",")));
        }

        let state = RouterState {
            connections_by_endpoint,
            connections_by_broker: HashMap::new(),
            topics: HashMap::new(),
            groups: HashMap::new(),
        };

        Ok(Self {
            inner: Arc::new(RouterInner {
                config,
                selector,
                state: RwLock::new(Arc::new(state)),
                refresh_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    fn snapshot(&self) -> Arc<RouterState<T>> {
        self.inner.state.read().expect("router state poisoned").clone()
    }

    fn swap_state(&self, state: RouterState<T>) {
        *self.inner.state.write().expect("router state poisoned") = Arc::new(state);
    }

    /// Route to the leader of a known `(topic, partition)` pair.
    pub fn route_to_partition(&self, topic: &str, partition_id: i32) -> Result<Route<T>> {
        self.snapshot().route_to_partition(topic, partition_id)
    }

    /// Route to the leader of the partition the selector picks for
    /// `key`.
    pub fn route_by_key(&self, topic: &str, key: Option<&Bytes>) -> Result<Route<T>> {
        let state = self.snapshot();
        let cached = state.topics.get(topic).ok_or_else(|| Error::CachedMetadata {
            topic: topic.to_string(),
            partition: None,
        })?;
        let partition_id = self.inner.selector.select(&cached.metadata, key)?;
        state.route_to_partition(topic, partition_id)
    }

    /// Connection to the coordinator of a consumer group.
    pub fn route_to_group(&self, group_id: &str) -> Result<T> {
        let miss = || Error::CachedMetadata {
            topic: group_id.to_string(),
            partition: None,
        };
        let state = self.snapshot();
        let cached = state.groups.get(group_id).ok_or_else(miss)?;
        state
            .connections_by_broker
            .get(&cached.coordinator.broker_id)
            .cloned()
            .ok_or_else(miss)
    }

    /// Cached topic metadata, if present.
    pub fn topic_metadata(&self, topic: &str) -> Option<TopicMetadata> {
        self.snapshot()
            .topics
            .get(topic)
            .map(|cached| cached.metadata.clone())
    }

    /// Cache-miss variant of [`route_to_partition`](Self::route_to_partition):
    /// refresh the topic's metadata, then retry the lookup once.
    pub async fn route_to_partition_refreshing(
        &self,
        topic: &str,
        partition_id: i32,
        cancel: &CancellationToken,
    ) -> Result<Route<T>> {
        match self.route_to_partition(topic, partition_id) {
            Ok(route) => Ok(route),
            Err(_) => {
                self.refresh_topics(&[topic.to_string()], cancel).await?;
                self.route_to_partition(topic, partition_id)
            }
        }
    }

    /// Cache-miss variant of [`route_by_key`](Self::route_by_key).
    pub async fn route_by_key_refreshing(
        &self,
        topic: &str,
        key: Option<&Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Route<T>> {
        match self.route_by_key(topic, key) {
            Ok(route) => Ok(route),
            Err(_) => {
                self.refresh_topics(&[topic.to_string()], cancel).await?;
                self.route_by_key(topic, key)
            }
        }
    }

    /// Cache-miss variant of [`route_to_group`](Self::route_to_group).
    pub async fn route_to_group_refreshing(
        &self,
        group_id: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        match self.route_to_group(group_id) {
            Ok(connection) => Ok(connection),
            Err(_) => {
                self.refresh_group(group_id, cancel).await?;
                self.route_to_group(group_id)
            }
        }
    }

    /// Fetch fresh metadata for `topics` (all topics when empty) and
    /// fold it into the cache.
    ///
    /// At most one refresh runs at a time; a caller that lost the race
    /// finds the entries already fresh and returns without touching
    /// the wire.
    pub async fn refresh_topics(&self, topics: &[String], cancel: &CancellationToken) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;

        {
            let state = self.snapshot();
            let all_fresh = !topics.is_empty()
                && topics.iter().all(|topic| {
                    state
                        .topics
                        .get(topic)
                        .map(|cached| cached.fetched_at.elapsed() < self.inner.config.cache_expiration)
                        .unwrap_or(false)
                });
            if all_fresh {
                tracing::debug!("Metadata for {:?} still fresh, skipping refresh", topics);
                return Ok(());
            }
        }

        let mut attempt = 0;
        loop {
            match self.try_refresh_topics(topics, cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => match self.inner.config.refresh_retry.backoff(attempt) {
                    Some(delay) if refreshable(&err) => {
                        tracing::warn!(
                            "Metadata refresh attempt {} failed, backing off {:?}: {:?}",
                            attempt,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    async fn try_refresh_topics(&self, topics: &[String], cancel: &CancellationToken) -> Result<()> {
        tracing::debug!("Fetching metadata for {:?}", topics);
        let request =
            MetadataRequest::new(DEFAULT_CORRELATION_ID, &self.inner.config.client_id, topics);
        let response: MetadataResponse = self.send_to_any(&request, cancel).await?;

        for broker in &response.brokers {
            if broker.host.is_empty() || broker.port <= 0 {
                tracing::error!("ERROR: Metadata reported unusable broker {:?}", broker);
                return Err(Error::KafkaError(KafkaCode::Unknown));
            }
        }

        if let Some(code) = response
            .topics
            .iter()
            .map(|topic| topic.error_code)
            .find(|code| *code != KafkaCode::None)
        {
            return Err(Error::KafkaError(code));
        }

        // Topics with a partition mid-election keep their previously
        // cached entries; the refresh after the election settles
        // writes the new leadership in one piece. The broker list and
        // topics seen for the first time still apply, so the healthy
        // partitions of a half-elected topic stay routable.
        let electing: Vec<(String, i32)> = response
            .topics
            .iter()
            .flat_map(|topic| {
                topic
                    .partitions
                    .iter()
                    .filter(|partition| partition.leader_id == -1)
                    .map(|partition| {
                        (
                            String::from_utf8_lossy(topic.name.as_ref()).to_string(),
                            partition.partition_index,
                        )
                    })
            })
            .collect();

        if let Some((topic, partition)) = electing.first().cloned() {
            for (topic, partition) in &electing {
                tracing::warn!(
                    "Leader election in progress for topic {} partition {}",
                    topic,
                    partition
                );
            }
            self.apply_metadata(&response, false).await?;
            return Err(Error::CachedMetadata {
                topic,
                partition: Some(partition),
            });
        }

        self.apply_metadata(&response, true).await
    }

    /// Rebuild the connection pool and topic cache from a validated
    /// metadata response, then swap the snapshot in one step. With
    /// `overwrite_topics` unset, topics already cached are left as
    /// they were.
    async fn apply_metadata(
        &self,
        response: &MetadataResponse,
        overwrite_topics: bool,
    ) -> Result<()> {
        let current = self.snapshot();
        let topics = fold_topics(&current.topics, response, overwrite_topics)?;

        // a response naming no brokers cannot replace the pool; keep
        // the current connections and only fold in the topics
        if response.brokers.is_empty() {
            self.swap_state(RouterState {
                connections_by_endpoint: current.connections_by_endpoint.clone(),
                connections_by_broker: current.connections_by_broker.clone(),
                topics,
                groups: current.groups.clone(),
            });
            return Ok(());
        }

        let mut connections_by_endpoint = HashMap::new();
        let mut connections_by_broker = HashMap::new();

        for broker in &response.brokers {
            let endpoint = BrokerEndpoint::resolve(broker.host_str()?, broker.port as u16)?;

            let reusable = current
                .connections_by_broker
                .get(&broker.node_id)
                .filter(|connection| {
                    *connection.endpoint() == endpoint && !connection.is_closed()
                })
                .or_else(|| {
                    current
                        .connections_by_endpoint
                        .get(&endpoint)
                        .filter(|connection| !connection.is_closed())
                })
                .cloned();

            let connection = match reusable {
                Some(connection) => connection,
                None => {
                    tracing::debug!(
                        "Opening connection to broker {} at {}",
                        broker.node_id,
                        endpoint
                    );
                    T::connect(endpoint.clone(), self.inner.config.channel.clone()).await?
                }
            };

            connections_by_endpoint.insert(endpoint, connection.clone());
            connections_by_broker.insert(broker.node_id, connection);
        }

        self.swap_state(RouterState {
            connections_by_endpoint: connections_by_endpoint.clone(),
            connections_by_broker,
            topics,
            groups: current.groups.clone(),
        });

        // dispose replaced connections only after the maps are swapped
        for (endpoint, connection) in current.connections_by_endpoint.iter() {
            if !connections_by_endpoint.contains_key(endpoint) {
                tracing::info!("Closing connection to superseded endpoint {}", endpoint);
                connection.close();
            }
        }

        Ok(())
    }

    /// Look up and cache the coordinator broker of a consumer group.
    pub async fn refresh_group(&self, group_id: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;

        {
            let state = self.snapshot();
            if let Some(cached) = state.groups.get(group_id) {
                if cached.fetched_at.elapsed() < self.inner.config.cache_expiration {
                    return Ok(());
                }
            }
        }

        let mut attempt = 0;
        loop {
            match self.try_refresh_group(group_id, cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => match self.inner.config.refresh_retry.backoff(attempt) {
                    Some(delay) if refreshable(&err) => {
                        tracing::warn!(
                            "Coordinator refresh attempt {} failed, backing off {:?}: {:?}",
                            attempt,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    async fn try_refresh_group(&self, group_id: &str, cancel: &CancellationToken) -> Result<()> {
        let request = FindCoordinatorRequest::new(
            DEFAULT_CORRELATION_ID,
            &self.inner.config.client_id,
            group_id,
        );
        let response: FindCoordinatorResponse = self.send_to_any(&request, cancel).await?;

        if response.error_code != KafkaCode::None {
            return Err(Error::KafkaError(response.error_code));
        }

        let endpoint = BrokerEndpoint::resolve(response.host_str()?, response.port as u16)?;

        let current = self.snapshot();
        let mut connections_by_endpoint = current.connections_by_endpoint.clone();
        let mut connections_by_broker = current.connections_by_broker.clone();

        let reusable = connections_by_broker
            .get(&response.node_id)
            .filter(|connection| *connection.endpoint() == endpoint && !connection.is_closed())
            .or_else(|| {
                connections_by_endpoint
                    .get(&endpoint)
                    .filter(|connection| !connection.is_closed())
            })
            .cloned();
        let connection = match reusable {
            Some(connection) => connection,
            None => T::connect(endpoint.clone(), self.inner.config.channel.clone()).await?,
        };
        connections_by_endpoint.insert(endpoint, connection.clone());
        connections_by_broker.insert(response.node_id, connection);

        let mut groups = current.groups.clone();
        groups.insert(
            group_id.to_string(),
            CachedGroup {
                coordinator: GroupCoordinator {
                    group_id: group_id.to_string(),
                    broker_id: response.node_id,
                },
                fetched_at: Instant::now(),
            },
        );

        self.swap_state(RouterState {
            connections_by_endpoint,
            connections_by_broker,
            topics: current.topics.clone(),
            groups,
        });

        Ok(())
    }

    /// Try a request against every pooled connection in turn; the
    /// first decodable response wins.
    async fn send_to_any<R, P>(&self, request: &R, cancel: &CancellationToken) -> Result<P>
    where
        R: KafkaRequest,
        P: TryFrom<Bytes, Error = Error>,
    {
        let state = self.snapshot();
        let mut connections: Vec<(&BrokerEndpoint, &T)> =
            state.connections_by_endpoint.iter().collect();
        connections.sort_by_key(|(endpoint, _)| endpoint.addr);

        let mut failures = Vec::new();
        for (endpoint, connection) in connections {
            if connection.is_closed() {
                failures.push(format!("{endpoint}: connection closed"));
                continue;
            }
            match connection
                .send(request, Some(self.inner.config.refresh_timeout), cancel)
                .await
            {
                Ok(Some(bytes)) => match P::try_from(bytes) {
                    Ok(response) => return Ok(response),
                    Err(err) => failures.push(format!("{endpoint}: {err}")),
                },
                Ok(None) => failures.push(format!("{endpoint}: no response expected")),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => failures.push(format!("{endpoint}: {err}")),
            }
        }

        Err(Error::NoBrokerReachable(failures.join("; ")))
    }

    /// Drop a topic's cache entry so the next lookup forces a refresh.
    pub fn invalidate_topic(&self, topic: &str) {
        let current = self.snapshot();
        if !current.topics.contains_key(topic) {
            return;
        }
        let mut topics = current.topics.clone();
        topics.remove(topic);
        self.swap_state(RouterState {
            connections_by_endpoint: current.connections_by_endpoint.clone(),
            connections_by_broker: current.connections_by_broker.clone(),
            topics,
            groups: current.groups.clone(),
        });
    }

    /// Close every pooled connection. Lookups afterwards still resolve
    /// against the last snapshot but their sends fail fast.
    pub fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Shutting down router");
        let state = self.snapshot();
        for connection in state.connections_by_endpoint.values() {
            connection.close();
        }
    }
}

fn fold_topics(
    current: &HashMap<String, CachedTopic>,
    response: &MetadataResponse,
    overwrite: bool,
) -> Result<HashMap<String, CachedTopic>> {
    let mut topics = current.clone();
    let now = Instant::now();
    for topic in &response.topics {
        let metadata = TopicMetadata::from_wire(topic)?;
        if !overwrite && topics.contains_key(&metadata.name) {
            continue;
        }
        topics.insert(
            metadata.name.clone(),
            CachedTopic {
                metadata,
                fetched_at: now,
            },
        );
    }
    Ok(topics)
}

fn refreshable(err: &Error) -> bool {
    match err {
        Error::KafkaError(code) => code.is_retryable(),
        // leader elections surface immediately; callers decide when to
        // come back
        Error::CachedMetadata { .. } => false,
        err => err.is_refresh_recoverable(),
    }
}
