use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, ClientContext,
    admin::{AdminClient as RDAdminClient, AdminOptions, ConfigEntry, NewTopic, ResourceSpecifier, TopicReplication},
    config::{FromClientConfigAndContext, RDKafkaLogLevel},
    error::KafkaError,
    metadata::{MetadataPartition, MetadataTopic},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::{self, Attempt, BackoffConfig};
use crate::error::{Result, TopicManagerError};

/// Identifies a single partition of a topic. Equality and hashing are pairwise over
/// `(topic, partition)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A partition of a Kafka topic, including whether it currently has at least one in-sync
/// replica. The Topic Manager treats this as the readiness predicate for the partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionInfo {
    pub tp: TopicPartition,
    pub has_in_sync_replica: bool,
}

impl From<(&str, &MetadataPartition)> for PartitionInfo {
    fn from((topic, value): (&str, &MetadataPartition)) -> Self {
        Self {
            tp: TopicPartition::new(topic, value.id()),
            has_in_sync_replica: !value.isr().is_empty(),
        }
    }
}

/// A Kafka topic, including the readiness of each of its partitions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

impl From<&MetadataTopic> for Topic {
    fn from(value: &MetadataTopic) -> Self {
        let name = String::from(value.name());
        let partitions = value
            .partitions()
            .iter()
            .map(|p| PartitionInfo::from((name.as_str(), p)))
            .collect();

        Self { name, partitions }
    }
}

/// A single configuration entry as reported by the broker for a topic.
#[derive(Clone, Debug)]
pub struct TopicConfigEntry {
    pub key: String,
    pub value: Option<String>,
    pub default: bool,
}

impl From<ConfigEntry> for TopicConfigEntry {
    fn from(value: ConfigEntry) -> Self {
        Self {
            key: value.name,
            value: value.value,
            default: value.is_default,
        }
    }
}

/// Retention as reported by the broker. Missing `retention.ms` is modeled as an explicit
/// "unknown retention" variant rather than a raw integer sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retention {
    Known(i64),
    Unknown,
}

impl Retention {
    /// Returns true if this retention is a known value less than or equal to `threshold_ms`.
    /// Unknown retention is never considered truncated.
    pub fn is_truncated_at_or_below(&self, threshold_ms: i64) -> bool {
        matches!(self, Self::Known(ms) if *ms <= threshold_ms)
    }
}

/// Recognized keys in a topic's configuration.
pub const RETENTION_MS: &str = "retention.ms";
pub const CLEANUP_POLICY: &str = "cleanup.policy";
pub const MIN_COMPACTION_LAG_MS: &str = "min.compaction.lag.ms";
pub const MIN_INSYNC_REPLICAS: &str = "min.insync.replicas";
pub const MESSAGE_TIMESTAMP_TYPE: &str = "message.timestamp.type";

pub const CLEANUP_POLICY_DELETE: &str = "delete";
pub const CLEANUP_POLICY_COMPACT: &str = "compact";
pub const LOG_APPEND_TIME: &str = "LogAppendTime";

/// The full set of configuration entries the broker reports for a topic. A thin, typed view over
/// the raw entries with per-key "missing means X" defaults applied.
#[derive(Clone, Debug, Default)]
pub struct TopicConfig(Vec<TopicConfigEntry>);

impl TopicConfig {
    pub fn new(entries: Vec<TopicConfigEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[TopicConfigEntry] {
        &self.0
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.value.as_deref())
    }

    /// Retention, or `Retention::Unknown` if `retention.ms` is missing.
    pub fn retention(&self) -> Retention {
        self.value(RETENTION_MS)
            .and_then(|v| v.parse::<i64>().ok())
            .map(Retention::Known)
            .unwrap_or(Retention::Unknown)
    }

    /// Cleanup policy, defaulting to `delete` when missing.
    pub fn cleanup_policy(&self) -> &str {
        self.value(CLEANUP_POLICY).unwrap_or(CLEANUP_POLICY_DELETE)
    }

    /// Minimum compaction lag, defaulting to 0 when missing.
    pub fn min_compaction_lag_ms(&self) -> i64 {
        self.value(MIN_COMPACTION_LAG_MS)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    }

    /// Minimum in-sync replicas, if the caller ever supplied one.
    pub fn min_insync_replicas(&self) -> Option<i32> {
        self.value(MIN_INSYNC_REPLICAS).and_then(|v| v.parse().ok())
    }

    /// Returns a copy with `key` set to `value`, replacing any existing entry for that key. Used
    /// to patch the cached config after a successful config write-through, without re-fetching
    /// from the broker.
    pub fn with_override(&self, key: &str, value: impl Into<String>) -> Self {
        let mut entries = self.0.clone();
        let value = value.into();

        if let Some(existing) = entries.iter_mut().find(|e| e.key == key) {
            existing.value = Some(value);
            existing.default = false;
        } else {
            entries.push(TopicConfigEntry {
                key: key.to_string(),
                value: Some(value),
                default: false,
            });
        }

        Self(entries)
    }
}

impl IntoIterator for TopicConfig {
    type Item = TopicConfigEntry;
    type IntoIter = std::vec::IntoIter<TopicConfigEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Properties supplied by a caller of `createTopic`/`setTopicConfig`. Always a plain string map;
/// the broker protocol has no richer type for this.
pub type TopicProperties = HashMap<String, String>;

/// Custom client context for the admin client, forwarding librdkafka's internal log lines through
/// `tracing`.
pub(crate) struct AdminClientContext;

impl ClientContext for AdminClientContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                tracing::error!("{} {}", fac, log_message);
            }
            RDKafkaLogLevel::Warning => tracing::warn!("{} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                tracing::info!("{} {}", fac, log_message);
            }
            RDKafkaLogLevel::Debug => tracing::debug!("{} {}", fac, log_message),
        }
    }
}

/// The subset of the admin client wrapper contract that only reads cluster metadata. Split from
/// [`WriteOnlyAdminClient`] since the read-only and write-only clients may be different
/// implementations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadOnlyAdminClient: Send + Sync {
    /// Name of the concrete implementation, for observability.
    fn get_class_name(&self) -> &'static str;

    async fn get_topic_config(&self, topic: &str) -> Result<Option<TopicConfig>>;

    async fn get_some_topic_configs(&self, topics: &HashSet<String>) -> Result<HashMap<String, TopicConfig>>;

    async fn get_all_topic_retentions(&self) -> Result<HashMap<String, Retention>>;

    async fn contains_topic(&self, topic: &str) -> Result<bool>;

    async fn list_all_topics(&self) -> Result<Vec<Topic>>;

    async fn is_topic_deletion_underway(&self, topic: &str) -> Result<bool>;

    async fn close(&self);

    /// Polls [`Self::contains_topic`] until it reports `expected`, backing off exponentially
    /// between `initial_backoff` and `max_backoff`. Gives up and returns `false` once
    /// `max_attempts` attempts have been made or `max_duration` has elapsed; a broker error on any
    /// individual poll counts as a non-match rather than aborting the loop.
    async fn contains_topic_with_expectation_and_retry(
        &self,
        topic: &str,
        max_attempts: u32,
        expected: bool,
        initial_backoff: Duration,
        max_backoff: Duration,
        max_duration: Duration,
    ) -> bool {
        let deadline = Instant::now() + max_duration;
        let config = BackoffConfig::new(initial_backoff, max_backoff);

        let outcome: std::result::Result<(), ()> = backoff::retry_with_backoff(
            config,
            max_attempts,
            deadline,
            || async {
                match self.contains_topic(topic).await {
                    Ok(value) if value == expected => Attempt::Done(()),
                    _ => Attempt::Retry(()),
                }
            },
            |_| true,
        )
        .await;

        outcome.is_ok()
    }
}

/// The subset of the Admin Client Wrapper contract that mutates cluster state.
#[async_trait]
pub trait WriteOnlyAdminClient: Send + Sync {
    fn get_class_name(&self) -> &'static str;

    async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i32,
        properties: &TopicProperties,
    ) -> Result<()>;

    /// Initiates deletion and returns once the broker confirms. `rdkafka`'s admin client always
    /// returns a completable future, so callers never see a "deletion in flight, no future"
    /// branch, but [`crate::manager::TopicManager`] still polls for confirmation in case a
    /// different implementation initiates deletion without waiting.
    async fn delete_topic(&self, name: &str) -> Result<()>;

    async fn set_topic_config(&self, name: &str, properties: &TopicProperties) -> Result<()>;

    async fn close(&self);
}

/// Configuration for constructing an [`RdKafkaAdminClient`]. Properties are layered the same way
/// consumer properties are layered elsewhere in this crate: caller-supplied values win over
/// `receive_buffer_bytes`, which comes from `TopicManagerConfig` rather than being fixed here.
#[derive(Clone, Debug)]
pub struct AdminClientConfig {
    pub properties: HashMap<String, String>,
    pub request_timeout: Option<Duration>,
    pub operation_timeout: Option<Duration>,
    pub receive_buffer_bytes: u64,
}

/// Concrete, `rdkafka`-backed implementation of both admin traits. A single instance may be used
/// for the read-only role, the write-only role, or both, depending on how the caller's
/// [`crate::factory::ClientFactory`] is configured.
pub struct RdKafkaAdminClient {
    client: RDAdminClient<AdminClientContext>,
    admin_options: AdminOptions,
}

impl RdKafkaAdminClient {
    pub fn new(config: AdminClientConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set("receive.buffer.bytes", config.receive_buffer_bytes.to_string());
        client_config.extend(config.properties);

        let client = RDAdminClient::from_config_and_context(&client_config, AdminClientContext)
            .map_err(TopicManagerError::Fatal)?;

        let admin_options = AdminOptions::new()
            .request_timeout(config.request_timeout)
            .operation_timeout(config.operation_timeout);

        Ok(Self {
            client,
            admin_options,
        })
    }

    async fn describe_topic_config(&self, topic: &str) -> Result<Option<TopicConfig>> {
        let resource = ResourceSpecifier::Topic(topic);

        let result = self
            .client
            .describe_configs(&[resource], &self.admin_options)
            .await
            .map_err(TopicManagerError::Fatal)?
            .into_iter()
            .next();

        match result {
            None => Ok(None),
            Some(Err(e)) => Err(TopicManagerError::translate_unknown_topic(topic, e)),
            Some(Ok(config)) => {
                let entries = config
                    .entries
                    .into_iter()
                    .map(TopicConfigEntry::from)
                    .collect();

                Ok(Some(TopicConfig::new(entries)))
            }
        }
    }
}

#[async_trait]
impl ReadOnlyAdminClient for RdKafkaAdminClient {
    fn get_class_name(&self) -> &'static str {
        "RdKafkaAdminClient"
    }

    async fn get_topic_config(&self, topic: &str) -> Result<Option<TopicConfig>> {
        self.describe_topic_config(topic).await
    }

    async fn get_some_topic_configs(&self, topics: &HashSet<String>) -> Result<HashMap<String, TopicConfig>> {
        let mut out = HashMap::with_capacity(topics.len());

        for topic in topics {
            if let Some(config) = self.describe_topic_config(topic).await? {
                out.insert(topic.clone(), config);
            }
        }

        Ok(out)
    }

    async fn get_all_topic_retentions(&self) -> Result<HashMap<String, Retention>> {
        let topics = self.list_all_topics().await?;
        let mut out = HashMap::with_capacity(topics.len());

        for topic in topics {
            let retention = match self.describe_topic_config(&topic.name).await? {
                Some(config) => config.retention(),
                None => Retention::Unknown,
            };

            out.insert(topic.name, retention);
        }

        Ok(out)
    }

    async fn contains_topic(&self, topic: &str) -> Result<bool> {
        let topics = self.list_all_topics().await?;
        Ok(topics.iter().any(|t| t.name == topic))
    }

    async fn list_all_topics(&self) -> Result<Vec<Topic>> {
        let metadata = self
            .client
            .inner()
            .fetch_metadata(None, Duration::from_secs(30))
            .map_err(TopicManagerError::Fatal)?;

        Ok(metadata.topics().iter().map(Topic::from).collect())
    }

    async fn is_topic_deletion_underway(&self, topic: &str) -> Result<bool> {
        // librdkafka's metadata protocol carries no explicit "deletion in progress" flag (unlike
        // the Java admin client, which can see the controller's pending-deletion set); a topic
        // simply stops resolving once deletion completes. We cannot distinguish "never existed"
        // from "deletion underway" at this layer, so we conservatively report `false` and rely on
        // `ensureTopicIsDeletedAndBlock`'s existence/readiness check to short-circuit instead.
        let _ = topic;
        Ok(false)
    }

    async fn close(&self) {
        debug!("closing read-only admin client");
    }
}

#[async_trait]
impl WriteOnlyAdminClient for RdKafkaAdminClient {
    fn get_class_name(&self) -> &'static str {
        "RdKafkaAdminClient"
    }

    async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i32,
        properties: &TopicProperties,
    ) -> Result<()> {
        let config_pairs: Vec<(&str, &str)> = properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut new_topic = NewTopic::new(name, partitions, TopicReplication::Fixed(replication_factor));
        for (k, v) in &config_pairs {
            new_topic = new_topic.set(k, v);
        }

        let results = self
            .client
            .create_topics(&[new_topic], &self.admin_options)
            .await
            .map_err(TopicManagerError::Fatal)?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, code))
                    if code == rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists =>
                {
                    return Err(TopicManagerError::TopicExists { topic });
                }
                Err((topic, code)) => {
                    warn!(topic, ?code, "create_topic failed");
                    return Err(TopicManagerError::translate_unknown_topic(
                        topic,
                        KafkaError::AdminOp(code),
                    ));
                }
            }
        }

        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        let results = self
            .client
            .delete_topics(&[name], &self.admin_options)
            .await
            .map_err(TopicManagerError::Fatal)?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, code)) => {
                    let source = KafkaError::AdminOp(code);
                    return Err(TopicManagerError::translate_unknown_topic(topic, source));
                }
            }
        }

        Ok(())
    }

    async fn set_topic_config(&self, name: &str, properties: &TopicProperties) -> Result<()> {
        use rdkafka::admin::AlterConfig;

        let mut alter = AlterConfig::new(ResourceSpecifier::Topic(name));
        for (k, v) in properties {
            alter = alter.set(k, v);
        }

        let results = self
            .client
            .alter_configs(&[alter], &self.admin_options)
            .await
            .map_err(TopicManagerError::Fatal)?;

        for result in results {
            result.map_err(|(topic, code)| {
                TopicManagerError::translate_unknown_topic(topic, KafkaError::AdminOp(code))
            })?;
        }

        Ok(())
    }

    async fn close(&self) {
        debug!("closing write-only admin client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: Option<&str>) -> TopicConfigEntry {
        TopicConfigEntry {
            key: key.to_string(),
            value: value.map(str::to_string),
            default: false,
        }
    }

    #[test]
    fn retention_known_when_present() {
        let config = TopicConfig::new(vec![entry(RETENTION_MS, Some("86400000"))]);
        assert_eq!(config.retention(), Retention::Known(86_400_000));
    }

    #[test]
    fn retention_unknown_when_missing() {
        let config = TopicConfig::new(vec![entry(CLEANUP_POLICY, Some("delete"))]);
        assert_eq!(config.retention(), Retention::Unknown);
    }

    #[test]
    fn cleanup_policy_defaults_to_delete() {
        let config = TopicConfig::new(vec![]);
        assert_eq!(config.cleanup_policy(), CLEANUP_POLICY_DELETE);
    }

    #[test]
    fn min_compaction_lag_defaults_to_zero() {
        let config = TopicConfig::new(vec![]);
        assert_eq!(config.min_compaction_lag_ms(), 0);
    }

    #[test]
    fn min_insync_replicas_absent_unless_set() {
        let config = TopicConfig::new(vec![]);
        assert_eq!(config.min_insync_replicas(), None);

        let config = TopicConfig::new(vec![entry(MIN_INSYNC_REPLICAS, Some("2"))]);
        assert_eq!(config.min_insync_replicas(), Some(2));
    }

    #[test]
    fn unknown_retention_is_never_truncated() {
        assert!(!Retention::Unknown.is_truncated_at_or_below(0));
    }

    #[test]
    fn known_retention_truncated_iff_at_or_below_threshold() {
        assert!(Retention::Known(1_000).is_truncated_at_or_below(1_000));
        assert!(Retention::Known(999).is_truncated_at_or_below(1_000));
        assert!(!Retention::Known(1_001).is_truncated_at_or_below(1_000));
    }

    #[test]
    fn topic_partition_display() {
        let tp = TopicPartition::new("orders_v3", 4);
        assert_eq!(tp.to_string(), "orders_v3-4");
    }

    #[tokio::test]
    async fn mock_read_only_admin_satisfies_trait_object_contract() {
        use std::sync::Arc;

        let mut mock = MockReadOnlyAdminClient::new();
        mock.expect_get_class_name().return_const("MockAdmin");
        mock.expect_contains_topic()
            .withf(|topic: &str| topic == "orders_v3")
            .returning(|_| Ok(true));

        let admin: Arc<dyn ReadOnlyAdminClient> = Arc::new(mock);

        assert_eq!(admin.get_class_name(), "MockAdmin");
        assert!(admin.contains_topic("orders_v3").await.unwrap());
    }

    /// Hand-rolled rather than `MockReadOnlyAdminClient`: `#[automock]` mocks every trait method,
    /// including `contains_topic_with_expectation_and_retry`'s default body, so exercising the
    /// real retry loop needs a fake that doesn't override it.
    struct FakeFlakyAdmin {
        calls: std::sync::atomic::AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl ReadOnlyAdminClient for FakeFlakyAdmin {
        fn get_class_name(&self) -> &'static str {
            "FakeFlakyAdmin"
        }

        async fn get_topic_config(&self, _topic: &str) -> Result<Option<TopicConfig>> {
            Ok(None)
        }

        async fn get_some_topic_configs(&self, _topics: &HashSet<String>) -> Result<HashMap<String, TopicConfig>> {
            Ok(HashMap::new())
        }

        async fn get_all_topic_retentions(&self) -> Result<HashMap<String, Retention>> {
            Ok(HashMap::new())
        }

        async fn contains_topic(&self, _topic: &str) -> Result<bool> {
            let seen = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(seen >= self.ready_after)
        }

        async fn list_all_topics(&self) -> Result<Vec<Topic>> {
            Ok(vec![])
        }

        async fn is_topic_deletion_underway(&self, _topic: &str) -> Result<bool> {
            Ok(false)
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn contains_topic_with_expectation_and_retry_waits_for_expected_value() {
        let admin = FakeFlakyAdmin {
            calls: std::sync::atomic::AtomicU32::new(0),
            ready_after: 3,
        };

        let found = admin
            .contains_topic_with_expectation_and_retry(
                "orders_v3",
                5,
                true,
                Duration::from_millis(1),
                Duration::from_millis(5),
                Duration::from_secs(10),
            )
            .await;

        assert!(found);
    }

    #[tokio::test(start_paused = true)]
    async fn contains_topic_with_expectation_and_retry_gives_up_after_max_attempts() {
        let admin = FakeFlakyAdmin {
            calls: std::sync::atomic::AtomicU32::new(0),
            ready_after: u32::MAX,
        };

        let found = admin
            .contains_topic_with_expectation_and_retry(
                "orders_v3",
                3,
                true,
                Duration::from_millis(1),
                Duration::from_millis(5),
                Duration::from_secs(10),
            )
            .await;

        assert!(!found);
    }
}
