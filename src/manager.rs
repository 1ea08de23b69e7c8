use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admin::{
    CLEANUP_POLICY, CLEANUP_POLICY_COMPACT, CLEANUP_POLICY_DELETE, MESSAGE_TIMESTAMP_TYPE, MIN_COMPACTION_LAG_MS,
    MIN_INSYNC_REPLICAS, LOG_APPEND_TIME, PartitionInfo, ReadOnlyAdminClient, RETENTION_MS, Retention, Topic,
    TopicConfig, TopicPartition, TopicProperties, WriteOnlyAdminClient,
};
use crate::backoff::{self, Attempt, BackoffConfig};
use crate::cache::TopicConfigCache;
use crate::error::{Result, TopicManagerError};
use crate::factory::ClientFactory;
use crate::metrics::{self, MetricsSink};
use crate::offset_fetcher::PartitionOffsetFetcher;

/// Sentinel retention meaning "never expire".
pub const ETERNAL: i64 = i64::MAX;

/// Default overall timeout for a Kafka admin round trip.
const DEFAULT_KAFKA_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Shorter timeout used by callers that opt into `CreateTopicParams::use_fast_timeout`.
const FAST_KAFKA_OPERATION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Backoff between topic-creation attempts.
const CREATE_TOPIC_BACKOFF: BackoffConfig = BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(2));
const CREATE_TOPIC_MAX_ATTEMPTS: u32 = 10;

/// Poll interval while waiting for a newly created topic's partitions to come online.
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum number of polls the delete-confirmation loop always makes before giving up, regardless
/// of how short the configured poll interval is set.
const MINIMUM_TOPIC_DELETION_STATUS_POLL_TIMES: u32 = 10;

/// Number of whole-operation retries `ensure_topic_is_deleted_and_block_with_retry` allows.
const MAX_TOPIC_DELETE_RETRIES: u32 = 3;

/// Safety margin added on top of rewind time and bootstrap time when deriving an expected
/// retention window: two days, matching the buffer-replay minimal safety margin used elsewhere in
/// pub/sub operations tooling.
const BUFFER_REPLAY_MINIMAL_SAFETY_MARGIN_MS: i64 = 2 * 24 * 60 * 60 * 1000;

/// Default topic retention floor applied when no caller-specific retention is requested and no
/// rewind/bootstrap derivation overrides it.
pub const DEFAULT_TOPIC_RETENTION_POLICY_MS: i64 = 5 * 24 * 60 * 60 * 1000;

/// Desired retention for a topic being created.
#[derive(Clone, Copy, Debug)]
pub enum RetentionPolicy {
    /// Never expire.
    Eternal,
    /// An explicit retention window, in milliseconds.
    Explicit(i64),
    /// Use this manager's configured default retention.
    Default,
}

/// Parameters for [`TopicManager::create_topic`].
#[derive(Clone, Debug)]
pub struct CreateTopicParams {
    pub name: String,
    pub partition_count: i32,
    pub replication_factor: i32,
    pub retention: RetentionPolicy,
    pub compaction: bool,
    pub min_compaction_lag_ms: Option<i64>,
    pub min_in_sync_replicas: Option<i32>,
    /// Use [`FAST_KAFKA_OPERATION_TIMEOUT`] instead of the manager's configured timeout.
    pub use_fast_timeout: bool,
}

impl CreateTopicParams {
    pub fn new(name: impl Into<String>, partition_count: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partition_count,
            replication_factor,
            retention: RetentionPolicy::Default,
            compaction: false,
            min_compaction_lag_ms: None,
            min_in_sync_replicas: None,
            use_fast_timeout: false,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_compaction(mut self, compaction: bool, min_compaction_lag_ms: i64) -> Self {
        self.compaction = compaction;
        self.min_compaction_lag_ms = Some(min_compaction_lag_ms);
        self
    }

    pub fn with_min_in_sync_replicas(mut self, min_isr: i32) -> Self {
        self.min_in_sync_replicas = Some(min_isr);
        self
    }

    pub fn with_fast_timeout(mut self) -> Self {
        self.use_fast_timeout = true;
        self
    }
}

/// Tunables that aren't per-call parameters but vary by deployment.
#[derive(Clone, Debug)]
pub struct TopicManagerOptions {
    pub kafka_operation_timeout: Duration,
    pub topic_deletion_status_poll_interval: Duration,
    pub allow_concurrent_topic_deletion: bool,
    pub default_topic_retention_ms: i64,
    pub topic_config_cache_ttl: Duration,
    /// Consumer group id used for the dedicated offset-query consumer this manager owns. Point
    /// queries never commit, so this need not be unique across manager instances.
    pub offset_fetcher_group_id: String,
}

impl Default for TopicManagerOptions {
    fn default() -> Self {
        Self {
            kafka_operation_timeout: DEFAULT_KAFKA_OPERATION_TIMEOUT,
            topic_deletion_status_poll_interval: Duration::from_millis(500),
            allow_concurrent_topic_deletion: false,
            default_topic_retention_ms: DEFAULT_TOPIC_RETENTION_POLICY_MS,
            topic_config_cache_ttl: crate::cache::DEFAULT_CACHE_TTL,
            offset_fetcher_group_id: "topic-manager-offset-fetcher".to_string(),
        }
    }
}

/// Orchestrates topic lifecycle operations over an admin client wrapper, a partition offset
/// fetcher, and a topic config cache.
///
/// The write-only admin, read-only admin, and offset fetcher are built lazily on first use via
/// `tokio::sync::OnceCell`, so a `TopicManager` that is only ever asked to read topic config never
/// pays for a write-capable client connection. A single `tokio::sync::Mutex<()>` serializes
/// exactly the operations meant to be mutually exclusive on one instance:
/// [`Self::update_topic_compaction_policy`], [`Self::list_topics`],
/// [`Self::contains_topic_and_all_partitions_are_online`], and [`Self::close`]. Every other
/// method, including [`Self::ensure_topic_is_deleted_and_block`], deliberately does not take it.
pub struct TopicManager {
    factory: Arc<dyn ClientFactory>,
    options: TopicManagerOptions,
    metrics: Option<Arc<dyn MetricsSink>>,
    cache: TopicConfigCache,
    write_admin: OnceCell<Arc<dyn WriteOnlyAdminClient>>,
    read_admin: OnceCell<Arc<dyn ReadOnlyAdminClient>>,
    offset_fetcher: OnceCell<Arc<PartitionOffsetFetcher>>,
    exclusive: Mutex<()>,
}

impl TopicManager {
    pub fn new(factory: Arc<dyn ClientFactory>, options: TopicManagerOptions) -> Self {
        let cache = TopicConfigCache::new(options.topic_config_cache_ttl);

        Self {
            factory,
            options,
            metrics: None,
            cache,
            write_admin: OnceCell::new(),
            read_admin: OnceCell::new(),
            offset_fetcher: OnceCell::new(),
            exclusive: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn emit_counter(&self, admin_class: &str, suffix: &str) {
        if let Some(sink) = &self.metrics {
            let name = metrics::metric_name(admin_class, self.factory.bootstrap_servers(), suffix);
            sink.incr_counter(&name, 1);
        }
    }

    fn emit_latency(&self, admin_class: &str, suffix: &str, duration: Duration) {
        if let Some(sink) = &self.metrics {
            let name = metrics::metric_name(admin_class, self.factory.bootstrap_servers(), suffix);
            sink.record_latency(&name, duration);
        }
    }

    async fn write_admin(&self) -> Result<Arc<dyn WriteOnlyAdminClient>> {
        Ok(self
            .write_admin
            .get_or_try_init(|| self.factory.build_write_only_admin())
            .await?
            .clone())
    }

    async fn read_admin(&self) -> Result<Arc<dyn ReadOnlyAdminClient>> {
        Ok(self
            .read_admin
            .get_or_try_init(|| self.factory.build_read_only_admin())
            .await?
            .clone())
    }

    async fn offset_fetcher(&self) -> Result<Arc<PartitionOffsetFetcher>> {
        let group_id = self.options.offset_fetcher_group_id.clone();

        Ok(self
            .offset_fetcher
            .get_or_try_init(|| async {
                let admin = self.read_admin().await?;
                let consumer = self.factory.build_raw_consumer(&group_id).await?;
                Ok::<_, TopicManagerError>(Arc::new(PartitionOffsetFetcher::new(admin, consumer)))
            })
            .await?
            .clone())
    }

    /// Read-through accessor for a topic's configuration; populates the cache on a miss.
    pub async fn get_topic_config(&self, topic: &str) -> Result<TopicConfig> {
        if let Some(cached) = self.cache.get(topic).await {
            return Ok(cached);
        }

        let admin = self.read_admin().await?;
        let config = admin
            .get_topic_config(topic)
            .await?
            .ok_or_else(|| TopicManagerError::TopicDoesNotExist { topic: topic.to_string() })?;

        self.cache.put(topic, config.clone()).await;
        Ok(config)
    }

    /// Same as [`Self::get_topic_config`], retried with backoff for up to `max_retry_time`.
    pub async fn get_topic_config_with_retry(&self, topic: &str, max_retry_time: Duration) -> Result<TopicConfig> {
        let deadline = Instant::now() + max_retry_time;

        backoff::retry_with_backoff(
            BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(5)),
            u32::MAX,
            deadline,
            || async {
                match self.get_topic_config(topic).await {
                    Ok(config) => Attempt::Done(config),
                    Err(e) => {
                        if let Ok(read_admin) = self.read_admin().await {
                            self.emit_counter(read_admin.get_class_name(), "get_topic_config.retry");
                        }
                        Attempt::Retry(e)
                    }
                }
            },
            |e| e.is_retriable(),
        )
        .await
    }

    /// Lists every topic visible to this cluster. One of the four operations serialized by
    /// `exclusive`.
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        let _guard = self.exclusive.lock().await;
        let admin = self.read_admin().await?;
        admin.list_all_topics().await
    }

    /// Creates `params.name` with the requested partition count, replication factor, retention,
    /// and compaction policy:
    ///
    /// 1. Compute the effective retention from `params.retention`.
    /// 2. Build the broker property map (`retention.ms`, `cleanup.policy`,
    ///    `min.compaction.lag.ms` when compacting, `min.insync.replicas` when requested,
    ///    `message.timestamp.type=LogAppendTime`).
    /// 3. Attempt creation with retry-with-backoff, retrying only `InvalidReplicationFactor` and
    ///    request-timeout faults.
    /// 4. If the broker reports the topic already exists, treat this as recovery: wait for the
    ///    existing topic's partitions to come online, then update its retention to the requested
    ///    value rather than failing.
    /// 5. Any other terminal failure raises `OperationTimedOut` carrying the elapsed time.
    /// 6. On success, wait for every partition to come online before returning.
    pub async fn create_topic(&self, params: CreateTopicParams) -> Result<()> {
        let retention_ms = match params.retention {
            RetentionPolicy::Eternal => ETERNAL,
            RetentionPolicy::Explicit(ms) => ms,
            RetentionPolicy::Default => self.options.default_topic_retention_ms,
        };

        let properties = self.build_create_properties(retention_ms, &params);

        let started = Instant::now();
        let overall_timeout = if params.use_fast_timeout {
            FAST_KAFKA_OPERATION_TIMEOUT
        } else {
            self.options.kafka_operation_timeout
        };
        let deadline = started + overall_timeout;

        let write_admin = self.write_admin().await?;
        let admin_class = write_admin.get_class_name();
        let name = params.name.clone();
        let partition_count = params.partition_count;
        let replication_factor = params.replication_factor;

        let create_result = backoff::retry_with_backoff(
            CREATE_TOPIC_BACKOFF,
            CREATE_TOPIC_MAX_ATTEMPTS,
            deadline,
            || async {
                match write_admin
                    .create_topic(&name, partition_count, replication_factor, &properties)
                    .await
                {
                    Ok(()) => Attempt::Done(()),
                    Err(e) => {
                        self.emit_counter(admin_class, "create_topic.retry");
                        Attempt::Retry(e)
                    }
                }
            },
            |e| e.is_retriable(),
        )
        .await;

        let outcome = match create_result {
            Ok(()) => {
                self.wait_for_readiness(&params.name, Some(params.partition_count), deadline, started)
                    .await?;
                Ok(())
            }
            Err(TopicManagerError::TopicExists { topic }) => {
                info!(topic, "create_topic raced with an existing topic; recovering");
                self.wait_for_readiness(&topic, Some(params.partition_count), deadline, started)
                    .await?;
                self.update_topic_retention(&topic, retention_ms).await?;
                Ok(())
            }
            Err(e) => Err(TopicManagerError::OperationTimedOut {
                operation: "createTopic",
                elapsed: started.elapsed(),
                source: Some(Box::new(e)),
            }),
        };

        self.emit_latency(admin_class, "create_topic", started.elapsed());
        self.emit_counter(admin_class, if outcome.is_ok() { "create_topic.success" } else { "create_topic.failure" });

        outcome
    }

    fn build_create_properties(&self, retention_ms: i64, params: &CreateTopicParams) -> TopicProperties {
        let mut properties = TopicProperties::new();
        properties.insert(RETENTION_MS.to_string(), retention_ms.to_string());

        if params.compaction {
            properties.insert(CLEANUP_POLICY.to_string(), CLEANUP_POLICY_COMPACT.to_string());
            properties.insert(
                MIN_COMPACTION_LAG_MS.to_string(),
                params.min_compaction_lag_ms.unwrap_or(0).to_string(),
            );
        } else {
            properties.insert(CLEANUP_POLICY.to_string(), CLEANUP_POLICY_DELETE.to_string());
        }

        if let Some(min_isr) = params.min_in_sync_replicas {
            properties.insert(MIN_INSYNC_REPLICAS.to_string(), min_isr.to_string());
        }

        properties.insert(MESSAGE_TIMESTAMP_TYPE.to_string(), LOG_APPEND_TIME.to_string());
        properties
    }

    async fn wait_for_readiness(
        &self,
        topic: &str,
        expected_partitions: Option<i32>,
        deadline: Instant,
        started: Instant,
    ) -> Result<()> {
        loop {
            if self
                .contains_topic_and_all_partitions_are_online(topic, expected_partitions)
                .await?
            {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(TopicManagerError::OperationTimedOut {
                    operation: "waitForTopicReadiness",
                    elapsed: started.elapsed(),
                    source: None,
                });
            }

            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// Returns true if `topic` exists and every one of its partitions has at least one in-sync
    /// replica, and, if `expected_partitions` is given, has exactly that many partitions. One of
    /// the four operations serialized by `exclusive`.
    pub async fn contains_topic_and_all_partitions_are_online(
        &self,
        topic: &str,
        expected_partitions: Option<i32>,
    ) -> Result<bool> {
        let _guard = self.exclusive.lock().await;
        self.contains_topic_and_all_partitions_are_online_locked(topic, expected_partitions)
            .await
    }

    async fn contains_topic_and_all_partitions_are_online_locked(
        &self,
        topic: &str,
        expected_partitions: Option<i32>,
    ) -> Result<bool> {
        let read_admin = self.read_admin().await?;
        if !read_admin.contains_topic(topic).await? {
            return Ok(false);
        }

        let fetcher = self.offset_fetcher().await?;
        let partitions = match fetcher.partitions_for(topic).await {
            Ok(p) => p,
            Err(TopicManagerError::TopicDoesNotExist { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        if partitions.is_empty() {
            warn!(topic, "broker reported no partition metadata; treating as not yet ready");
            return Ok(false);
        }

        if let Some(expected) = expected_partitions {
            if partitions.len() as i32 != expected {
                return Ok(false);
            }
        }

        Ok(partitions.iter().all(|p| p.has_in_sync_replica))
    }

    /// Updates `topic`'s retention to `retention_ms` if it differs from the current value,
    /// writing through to the cache on success. A no-op if the cached or fetched retention
    /// already matches.
    pub async fn update_topic_retention(&self, topic: &str, retention_ms: i64) -> Result<bool> {
        let config = self.get_topic_config(topic).await?;

        let already_matches = matches!(config.retention(), Retention::Known(ms) if ms == retention_ms);
        if already_matches {
            return Ok(false);
        }

        let mut properties = TopicProperties::new();
        properties.insert(RETENTION_MS.to_string(), retention_ms.to_string());

        let write_admin = self.write_admin().await?;
        write_admin.set_topic_config(topic, &properties).await?;

        let patched = config.with_override(RETENTION_MS, retention_ms.to_string());
        self.cache.put(topic, patched).await;

        Ok(true)
    }

    /// Updates `topic`'s cleanup policy and, when compacting, its minimum compaction lag. A no-op
    /// if both already match the requested values. One of the operations serialized by
    /// `exclusive`.
    pub async fn update_topic_compaction_policy(
        &self,
        topic: &str,
        compaction: bool,
        min_compaction_lag_ms: i64,
    ) -> Result<()> {
        let _guard = self.exclusive.lock().await;

        let config = self.get_topic_config(topic).await?;
        let desired_policy = if compaction { CLEANUP_POLICY_COMPACT } else { CLEANUP_POLICY_DELETE };
        let desired_lag = if compaction { min_compaction_lag_ms } else { 0 };

        let mut properties = TopicProperties::new();
        if config.cleanup_policy() != desired_policy {
            properties.insert(CLEANUP_POLICY.to_string(), desired_policy.to_string());
        }
        if config.min_compaction_lag_ms() != desired_lag {
            properties.insert(MIN_COMPACTION_LAG_MS.to_string(), desired_lag.to_string());
        }

        if properties.is_empty() {
            return Ok(());
        }

        let write_admin = self.write_admin().await?;
        write_admin.set_topic_config(topic, &properties).await?;

        let mut patched = config;
        for (key, value) in &properties {
            patched = patched.with_override(key, value.clone());
        }
        self.cache.put(topic, patched).await;

        Ok(())
    }

    /// Returns true if `topic`'s retention is known and at or below `threshold_ms`. A topic that
    /// no longer exists is reported as truncated, since there is nothing left to read;
    /// `Retention::Unknown` is never considered truncated.
    pub async fn is_topic_truncated(&self, topic: &str, threshold_ms: i64) -> Result<bool> {
        match self.get_topic_config(topic).await {
            Ok(config) => Ok(config.retention().is_truncated_at_or_below(threshold_ms)),
            Err(TopicManagerError::TopicDoesNotExist { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Derives a retention window long enough to cover a rewind of `rewind_time_seconds` plus
    /// `bootstrap_to_online_hours` to bring a new consumer online, padded by a two-day safety
    /// margin and floored at this manager's configured default.
    pub fn get_expected_retention_time_in_ms(&self, rewind_time_seconds: i64, bootstrap_to_online_hours: i64) -> i64 {
        let rewind_ms = rewind_time_seconds.saturating_mul(1000);
        let bootstrap_ms = bootstrap_to_online_hours.saturating_mul(60 * 60 * 1000);
        let candidate = rewind_ms
            .saturating_add(bootstrap_ms)
            .saturating_add(BUFFER_REPLAY_MINIMAL_SAFETY_MARGIN_MS);

        candidate.max(self.options.default_topic_retention_ms)
    }

    /// Deletes `topic` and blocks until the broker confirms it is gone. Deliberately does not take
    /// `exclusive`: concurrent deletions of different topics must not serialize behind this one,
    /// and deleting the topic this manager's own offset fetcher is mid-query against is a caller
    /// error, not something this method can prevent.
    ///
    /// A no-op if the topic is already gone. If `allow_concurrent_topic_deletion` is false and the
    /// broker reports a deletion already underway, returns `DeletionUnderway` rather than racing
    /// it. `rdkafka`'s admin client always resolves `delete_topic`'s future once the broker
    /// confirms, so this method never actually needs to wait on the confirmation poll below; it
    /// exists anyway, to cover a [`crate::factory::ClientFactory`] implementation whose
    /// `delete_topic` only *initiates* deletion without waiting.
    pub async fn ensure_topic_is_deleted_and_block(&self, topic: &str) -> Result<()> {
        let started = Instant::now();
        let admin_class = self.write_admin().await?.get_class_name();

        let outcome = self.do_delete_topic_and_block(topic, started).await;

        self.emit_latency(admin_class, "delete_topic", started.elapsed());
        self.emit_counter(admin_class, if outcome.is_ok() { "delete_topic.success" } else { "delete_topic.failure" });

        outcome
    }

    async fn do_delete_topic_and_block(&self, topic: &str, started: Instant) -> Result<()> {
        let deadline = started + self.options.kafka_operation_timeout;

        if !self
            .contains_topic_and_all_partitions_are_online(topic, None)
            .await
            .unwrap_or(true)
        {
            return Ok(());
        }

        if !self.options.allow_concurrent_topic_deletion {
            let read_admin = self.read_admin().await?;
            if read_admin.is_topic_deletion_underway(topic).await? {
                return Err(TopicManagerError::DeletionUnderway { topic: topic.to_string() });
            }
        }

        let write_admin = self.write_admin().await?;

        match tokio::time::timeout_at(deadline, write_admin.delete_topic(topic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_unknown_topic_or_partition() => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                return Err(TopicManagerError::OperationTimedOut {
                    operation: "deleteTopic",
                    elapsed: started.elapsed(),
                    source: None,
                });
            }
        }

        self.poll_until_deleted(topic, started, deadline).await
    }

    /// Confirms `topic` has disappeared from cluster metadata, polling at
    /// `topic_deletion_status_poll_interval` and periodically rebuilding its observing admin
    /// client ([`backoff::next_recreation_cadence`]) to shake off any client-side metadata
    /// caching that would otherwise make a deleted topic appear to linger.
    async fn poll_until_deleted(&self, topic: &str, started: Instant, deadline: Instant) -> Result<()> {
        let poll_interval = self.options.topic_deletion_status_poll_interval;
        let budget = deadline.saturating_duration_since(Instant::now());
        let max_iterations = ((budget.as_millis() / poll_interval.as_millis().max(1)) as u32)
            .max(MINIMUM_TOPIC_DELETION_STATUS_POLL_TIMES);

        let mut observer = self.read_admin().await?;
        let mut cadence = 5u32;
        let mut since_recreate = 0u32;

        for _ in 0..max_iterations {
            if Instant::now() >= deadline {
                break;
            }

            if !observer.contains_topic(topic).await? {
                return Ok(());
            }

            tokio::time::sleep(poll_interval).await;

            since_recreate += 1;
            if since_recreate >= cadence {
                debug!(topic, cadence, "recreating observation admin client to shake off stale metadata");
                observer = self.factory.build_read_only_admin().await?;
                since_recreate = 0;
                cadence = backoff::next_recreation_cadence(cadence);
            }
        }

        Err(TopicManagerError::OperationTimedOut {
            operation: "ensureTopicIsDeletedAndBlock",
            elapsed: started.elapsed(),
            source: None,
        })
    }

    /// Retries [`Self::ensure_topic_is_deleted_and_block`] up to [`MAX_TOPIC_DELETE_RETRIES`]
    /// times.
    pub async fn ensure_topic_is_deleted_and_block_with_retry(&self, topic: &str) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..MAX_TOPIC_DELETE_RETRIES {
            match self.ensure_topic_is_deleted_and_block(topic).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(topic, attempt, error = %e, "delete attempt failed, retrying");
                    if let Ok(write_admin) = self.write_admin().await {
                        self.emit_counter(write_admin.get_class_name(), "delete_topic_with_retry.retry");
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.expect("at least one delete attempt is always made"))
    }

    /// Partition readiness info for every partition of `topic`.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>> {
        self.offset_fetcher().await?.partitions_for(topic).await
    }

    /// Mapping of partition index to latest offset for every partition of `topic`. Returns an
    /// empty map on error rather than propagating it.
    pub async fn get_topic_latest_offsets(&self, topic: &str) -> HashMap<i32, i64> {
        match self.offset_fetcher().await {
            Ok(fetcher) => fetcher.get_topic_latest_offsets(topic).await,
            Err(e) => {
                warn!(topic, error = %e, "failed to build offset fetcher while fetching latest offsets");
                HashMap::new()
            }
        }
    }

    /// Latest offset for a single partition, retried up to `retries` times on transient broker
    /// faults.
    pub async fn get_partition_latest_offset_and_retry(&self, tp: &TopicPartition, retries: u32) -> Result<i64> {
        self.offset_fetcher().await?.get_partition_latest_offset_and_retry(tp, retries).await
    }

    /// Earliest offset for a single partition, retried up to `retries` times on transient broker
    /// faults.
    pub async fn get_partition_earliest_offset_and_retry(&self, tp: &TopicPartition, retries: u32) -> Result<i64> {
        self.offset_fetcher().await?.get_partition_earliest_offset_and_retry(tp, retries).await
    }

    /// Resolves the earliest offset at or after `timestamp_ms` for `tp`, or `None` if the broker
    /// has no such offset.
    pub async fn get_partition_offset_by_time(&self, tp: &TopicPartition, timestamp_ms: i64) -> Result<Option<i64>> {
        self.offset_fetcher().await?.get_partition_offset_by_time(tp, timestamp_ms).await
    }

    /// Reads the tail record's embedded producer timestamp, skipping control messages. Retried up
    /// to `retries` times on transient broker faults.
    pub async fn get_producer_timestamp_of_last_data_record(
        &self,
        tp: &TopicPartition,
        retries: u32,
    ) -> Result<Option<i64>> {
        self.offset_fetcher()
            .await?
            .get_producer_timestamp_of_last_data_record(tp, retries)
            .await
    }

    /// Bootstrap servers this manager's collaborators are built against.
    pub fn get_kafka_bootstrap_servers(&self) -> &str {
        self.factory.bootstrap_servers()
    }

    /// Releases, in order, the offset fetcher, the read-only admin client, and the write-only
    /// admin client, swallowing errors from each with a warning. One of the four operations
    /// serialized by `exclusive`.
    pub async fn close(&self) {
        let _guard = self.exclusive.lock().await;

        if self.offset_fetcher.initialized() {
            debug!("releasing partition offset fetcher");
        }

        if let Some(read_admin) = self.read_admin.get() {
            read_admin.close().await;
        }

        if let Some(write_admin) = self.write_admin.get() {
            write_admin.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{PartitionInfo, TopicConfigEntry, TopicPartition};
    use crate::consumer::RawConsumer;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeBroker {
        topics: StdMutex<Vec<Topic>>,
        configs: StdMutex<HashMap<String, TopicConfig>>,
        creates: AtomicU32,
        deletion_underway: AtomicBool,
        delete_raises_unknown_topic: AtomicBool,
    }

    struct FakeReadAdmin(Arc<FakeBroker>);
    struct FakeWriteAdmin(Arc<FakeBroker>);

    #[async_trait]
    impl ReadOnlyAdminClient for FakeReadAdmin {
        fn get_class_name(&self) -> &'static str {
            "FakeReadAdmin"
        }

        async fn get_topic_config(&self, topic: &str) -> Result<Option<TopicConfig>> {
            Ok(self.0.configs.lock().unwrap().get(topic).cloned())
        }

        async fn get_some_topic_configs(&self, _topics: &HashSet<String>) -> Result<HashMap<String, TopicConfig>> {
            Ok(HashMap::new())
        }

        async fn get_all_topic_retentions(&self) -> Result<HashMap<String, Retention>> {
            Ok(HashMap::new())
        }

        async fn contains_topic(&self, topic: &str) -> Result<bool> {
            Ok(self.0.topics.lock().unwrap().iter().any(|t| t.name == topic))
        }

        async fn list_all_topics(&self) -> Result<Vec<Topic>> {
            Ok(self.0.topics.lock().unwrap().clone())
        }

        async fn is_topic_deletion_underway(&self, _topic: &str) -> Result<bool> {
            Ok(self.0.deletion_underway.load(Ordering::SeqCst))
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl WriteOnlyAdminClient for FakeWriteAdmin {
        fn get_class_name(&self) -> &'static str {
            "FakeWriteAdmin"
        }

        async fn create_topic(
            &self,
            name: &str,
            partitions: i32,
            _replication_factor: i32,
            properties: &TopicProperties,
        ) -> Result<()> {
            self.0.creates.fetch_add(1, Ordering::SeqCst);

            let mut topics = self.0.topics.lock().unwrap();
            if topics.iter().any(|t| t.name == name) {
                return Err(TopicManagerError::TopicExists { topic: name.to_string() });
            }

            let partitions = (0..partitions)
                .map(|i| PartitionInfo {
                    tp: TopicPartition::new(name, i),
                    has_in_sync_replica: true,
                })
                .collect();
            topics.push(Topic { name: name.to_string(), partitions });

            let entries = properties
                .iter()
                .map(|(k, v)| TopicConfigEntry {
                    key: k.clone(),
                    value: Some(v.clone()),
                    default: false,
                })
                .collect();
            self.0.configs.lock().unwrap().insert(name.to_string(), TopicConfig::new(entries));

            Ok(())
        }

        async fn delete_topic(&self, name: &str) -> Result<()> {
            if self.0.delete_raises_unknown_topic.load(Ordering::SeqCst) {
                return Err(TopicManagerError::translate_unknown_topic(
                    name,
                    rdkafka::error::KafkaError::AdminOp(rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition),
                ));
            }

            let mut topics = self.0.topics.lock().unwrap();
            let before = topics.len();
            topics.retain(|t| t.name != name);
            if topics.len() == before {
                return Err(TopicManagerError::translate_unknown_topic(
                    name,
                    rdkafka::error::KafkaError::AdminOp(rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition),
                ));
            }
            Ok(())
        }

        async fn set_topic_config(&self, name: &str, properties: &TopicProperties) -> Result<()> {
            let mut configs = self.0.configs.lock().unwrap();
            let config = configs.entry(name.to_string()).or_insert_with(|| TopicConfig::new(vec![]));
            let mut patched = config.clone();
            for (k, v) in properties {
                patched = patched.with_override(k, v.clone());
            }
            *config = patched;
            Ok(())
        }

        async fn close(&self) {}
    }

    struct FakeFactory(Arc<FakeBroker>);

    #[async_trait]
    impl ClientFactory for FakeFactory {
        async fn build_read_only_admin(&self) -> Result<Arc<dyn ReadOnlyAdminClient>> {
            Ok(Arc::new(FakeReadAdmin(self.0.clone())))
        }

        async fn build_write_only_admin(&self) -> Result<Arc<dyn WriteOnlyAdminClient>> {
            Ok(Arc::new(FakeWriteAdmin(self.0.clone())))
        }

        async fn build_raw_consumer(&self, _group_id: &str) -> Result<RawConsumer> {
            let mut config = HashMap::new();
            config.insert("bootstrap.servers".to_string(), "localhost:9092".to_string());
            RawConsumer::new(config)
        }

        fn bootstrap_servers(&self) -> &str {
            "localhost:9092"
        }

        fn with_bootstrap_servers(&self, _bootstrap_servers: String) -> Arc<dyn ClientFactory> {
            Arc::new(FakeFactory(self.0.clone()))
        }
    }

    fn manager() -> (TopicManager, Arc<FakeBroker>) {
        let broker = Arc::new(FakeBroker::default());
        let factory: Arc<dyn ClientFactory> = Arc::new(FakeFactory(broker.clone()));
        let mut options = TopicManagerOptions::default();
        options.topic_deletion_status_poll_interval = Duration::from_millis(1);
        options.kafka_operation_timeout = Duration::from_secs(5);
        (TopicManager::new(factory, options), broker)
    }

    #[tokio::test]
    async fn create_topic_then_is_ready() {
        let (manager, _broker) = manager();
        let params = CreateTopicParams::new("orders_v3", 2, 1).with_retention(RetentionPolicy::Explicit(86_400_000));

        manager.create_topic(params).await.unwrap();

        let config = manager.get_topic_config("orders_v3").await.unwrap();
        assert_eq!(config.retention(), Retention::Known(86_400_000));

        let ready = manager
            .contains_topic_and_all_partitions_are_online("orders_v3", Some(2))
            .await
            .unwrap();
        assert!(ready);
    }

    #[tokio::test]
    async fn create_topic_recovers_when_topic_already_exists() {
        let (manager, broker) = manager();

        broker.topics.lock().unwrap().push(Topic {
            name: "orders_v3".to_string(),
            partitions: vec![PartitionInfo {
                tp: TopicPartition::new("orders_v3", 0),
                has_in_sync_replica: true,
            }],
        });
        broker.configs.lock().unwrap().insert(
            "orders_v3".to_string(),
            TopicConfig::new(vec![TopicConfigEntry {
                key: RETENTION_MS.to_string(),
                value: Some("1000".to_string()),
                default: false,
            }]),
        );

        let params = CreateTopicParams::new("orders_v3", 1, 1).with_retention(RetentionPolicy::Explicit(86_400_000));
        manager.create_topic(params).await.unwrap();

        let config = manager.get_topic_config("orders_v3").await.unwrap();
        assert_eq!(config.retention(), Retention::Known(86_400_000));
    }

    #[tokio::test]
    async fn update_topic_retention_is_a_noop_when_already_matching() {
        let (manager, _broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1).with_retention(RetentionPolicy::Explicit(1_000)))
            .await
            .unwrap();

        let changed = manager.update_topic_retention("orders_v3", 1_000).await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn update_topic_compaction_policy_sets_cleanup_policy_and_lag() {
        let (manager, _broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1))
            .await
            .unwrap();

        manager.update_topic_compaction_policy("orders_v3", true, 5_000).await.unwrap();

        let config = manager.get_topic_config("orders_v3").await.unwrap();
        assert_eq!(config.cleanup_policy(), CLEANUP_POLICY_COMPACT);
        assert_eq!(config.min_compaction_lag_ms(), 5_000);
    }

    #[tokio::test]
    async fn is_topic_truncated_reports_true_for_missing_topic() {
        let (manager, _broker) = manager();
        assert!(manager.is_topic_truncated("missing", 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn is_topic_truncated_reports_false_for_eternal_retention() {
        let (manager, _broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1).with_retention(RetentionPolicy::Eternal))
            .await
            .unwrap();

        assert!(!manager.is_topic_truncated("orders_v3", 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_topic_is_deleted_and_block_is_a_noop_for_missing_topic() {
        let (manager, _broker) = manager();
        manager.ensure_topic_is_deleted_and_block("missing").await.unwrap();
    }

    #[tokio::test]
    async fn ensure_topic_is_deleted_and_block_removes_existing_topic() {
        let (manager, _broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1))
            .await
            .unwrap();

        manager.ensure_topic_is_deleted_and_block("orders_v3").await.unwrap();

        let exists = manager.read_admin().await.unwrap().contains_topic("orders_v3").await.unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    async fn ensure_topic_is_deleted_and_block_treats_unknown_topic_on_delete_as_success() {
        let (manager, broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1))
            .await
            .unwrap();
        broker.delete_raises_unknown_topic.store(true, Ordering::SeqCst);

        manager.ensure_topic_is_deleted_and_block("orders_v3").await.unwrap();
    }

    #[tokio::test]
    async fn ensure_topic_is_deleted_and_block_refuses_when_deletion_already_underway() {
        let (manager, broker) = manager();
        manager
            .create_topic(CreateTopicParams::new("orders_v3", 1, 1))
            .await
            .unwrap();
        broker.deletion_underway.store(true, Ordering::SeqCst);

        let err = manager.ensure_topic_is_deleted_and_block("orders_v3").await.unwrap_err();
        assert!(matches!(err, TopicManagerError::DeletionUnderway { .. }));
    }

    #[test]
    fn get_expected_retention_time_floors_at_configured_default() {
        let (manager, _broker) = manager();
        let derived = manager.get_expected_retention_time_in_ms(60, 1);
        assert_eq!(derived, DEFAULT_TOPIC_RETENTION_POLICY_MS);
    }

    #[test]
    fn get_expected_retention_time_uses_derived_value_when_larger() {
        let (manager, _broker) = manager();
        let rewind_seconds = 10 * 24 * 60 * 60;
        let derived = manager.get_expected_retention_time_in_ms(rewind_seconds, 1);
        assert!(derived > DEFAULT_TOPIC_RETENTION_POLICY_MS);
    }

    #[test]
    fn get_expected_retention_time_matches_three_plus_one_plus_two_day_example() {
        let (manager, _broker) = manager();
        let three_days_seconds = 3 * 24 * 60 * 60;
        let derived = manager.get_expected_retention_time_in_ms(three_days_seconds, 24);
        assert_eq!(derived, 6 * 24 * 60 * 60 * 1000);
    }

    #[tokio::test]
    async fn create_topic_eternal_sets_max_retention_and_delete_policy() {
        let (manager, broker) = manager();

        manager
            .create_topic(
                CreateTopicParams::new("orders_v3", 12, 3)
                    .with_retention(RetentionPolicy::Eternal),
            )
            .await
            .unwrap();

        let config = broker.configs.lock().unwrap().get("orders_v3").cloned().unwrap();
        assert_eq!(config.retention(), Retention::Known(ETERNAL));
        assert_eq!(config.cleanup_policy(), CLEANUP_POLICY_DELETE);
    }

    #[tokio::test]
    async fn create_topic_compacted_sets_compaction_lag_and_min_isr() {
        let (manager, broker) = manager();

        manager
            .create_topic(
                CreateTopicParams::new("orders_v3", 1, 1)
                    .with_retention(RetentionPolicy::Explicit(86_400_000))
                    .with_compaction(true, 3_600_000)
                    .with_min_in_sync_replicas(2),
            )
            .await
            .unwrap();

        let config = broker.configs.lock().unwrap().get("orders_v3").cloned().unwrap();
        assert_eq!(config.cleanup_policy(), CLEANUP_POLICY_COMPACT);
        assert_eq!(config.min_compaction_lag_ms(), 3_600_000);
        assert_eq!(config.min_insync_replicas(), Some(2));
    }
}
