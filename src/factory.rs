use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::admin::{AdminClientConfig, ReadOnlyAdminClient, RdKafkaAdminClient, WriteOnlyAdminClient};
use crate::config::{
    DEFAULT_ADMIN_GET_TOPIC_CONFIG_MAX_RETRY_TIME_SEC, DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS,
    DEFAULT_CONSUMER_POLL_RETRY_TIMES, DEFAULT_RECEIVE_BUFFER_BYTES, TopicManagerConfig,
};
use crate::consumer::RawConsumer;
use crate::error::Result;

/// Builds the broker-facing collaborators a [`crate::manager::TopicManager`] composes, so the
/// manager itself never names a concrete `rdkafka` type. The manager depends only on this trait;
/// a factory implementation decides how instances get built and against which cluster.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build_read_only_admin(&self) -> Result<Arc<dyn ReadOnlyAdminClient>>;

    async fn build_write_only_admin(&self) -> Result<Arc<dyn WriteOnlyAdminClient>>;

    /// Builds a dedicated raw consumer for internal, non-subscription use (offset queries).
    /// `group_id` need not be unique across calls; point queries never commit offsets.
    async fn build_raw_consumer(&self, group_id: &str) -> Result<RawConsumer>;

    fn bootstrap_servers(&self) -> &str;

    /// Returns a new factory pointed at a different cluster, carrying over every other setting.
    /// Takes an owned `String` rather than `impl Into<String>` so the method stays object-safe.
    fn with_bootstrap_servers(&self, bootstrap_servers: String) -> Arc<dyn ClientFactory>;
}

/// Default, `rdkafka`-backed [`ClientFactory`]. Properties layer a base property map supplied at
/// construction, with `bootstrap.servers` always pinned from this factory's own field so a caller
/// can't accidentally point one collaborator at a different cluster. The consumer poll-retry
/// policy and admin receive-buffer size come from `config` rather than being hardcoded, so a
/// caller that loads [`TopicManagerConfig`] from its environment sees those values actually take
/// effect.
#[derive(Clone)]
pub struct RdKafkaClientFactory {
    bootstrap_servers: String,
    base_properties: HashMap<String, String>,
    config: TopicManagerConfig,
}

impl RdKafkaClientFactory {
    /// Builds a factory with compiled-in defaults for everything `TopicManagerConfig` would
    /// otherwise supply. Use [`Self::from_config`] to thread a loaded configuration through
    /// instead.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        let bootstrap_servers = bootstrap_servers.into();
        let config = TopicManagerConfig {
            bootstrap_servers: bootstrap_servers.clone(),
            consumer_poll_retry_times: DEFAULT_CONSUMER_POLL_RETRY_TIMES,
            consumer_poll_retry_backoff_ms: DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS,
            kafka_admin_get_topic_config_max_retry_time_sec: DEFAULT_ADMIN_GET_TOPIC_CONFIG_MAX_RETRY_TIME_SEC,
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER_BYTES,
        };

        Self {
            bootstrap_servers,
            base_properties: HashMap::new(),
            config,
        }
    }

    /// Builds a factory from a fully loaded configuration, pinning `bootstrap_servers` from
    /// `config.bootstrap_servers`.
    pub fn from_config(config: TopicManagerConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            base_properties: HashMap::new(),
            config,
        }
    }

    /// Layers additional client properties (SASL, SSL, timeouts, ...) on top of the defaults.
    /// Later calls override earlier ones for keys in common.
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.base_properties.extend(properties);
        self
    }

    fn client_properties(&self) -> HashMap<String, String> {
        let mut props = self.base_properties.clone();
        props.insert("bootstrap.servers".to_string(), self.bootstrap_servers.clone());
        props
    }
}

#[async_trait]
impl ClientFactory for RdKafkaClientFactory {
    async fn build_read_only_admin(&self) -> Result<Arc<dyn ReadOnlyAdminClient>> {
        let config = AdminClientConfig {
            properties: self.client_properties(),
            request_timeout: None,
            operation_timeout: None,
            receive_buffer_bytes: self.config.receive_buffer_bytes,
        };

        Ok(Arc::new(RdKafkaAdminClient::new(config)?))
    }

    async fn build_write_only_admin(&self) -> Result<Arc<dyn WriteOnlyAdminClient>> {
        let config = AdminClientConfig {
            properties: self.client_properties(),
            request_timeout: None,
            operation_timeout: None,
            receive_buffer_bytes: self.config.receive_buffer_bytes,
        };

        Ok(Arc::new(RdKafkaAdminClient::new(config)?))
    }

    async fn build_raw_consumer(&self, group_id: &str) -> Result<RawConsumer> {
        let mut props = self.client_properties();
        props
            .entry("group.id".to_string())
            .or_insert_with(|| group_id.to_string());
        props
            .entry("auto.offset.reset".to_string())
            .or_insert_with(|| "earliest".to_string());

        RawConsumer::with_retry_policy(
            props,
            self.config.consumer_poll_retry_backoff(),
            self.config.consumer_poll_retry_times,
        )
    }

    fn bootstrap_servers(&self) -> &str {
        &self.bootstrap_servers
    }

    fn with_bootstrap_servers(&self, bootstrap_servers: String) -> Arc<dyn ClientFactory> {
        let mut config = self.config.clone();
        config.bootstrap_servers = bootstrap_servers.clone();

        Arc::new(Self {
            bootstrap_servers,
            base_properties: self.base_properties.clone(),
            config,
        })
    }
}
