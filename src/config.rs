use std::time::Duration;

use config::{Config as ConfigRs, ConfigError, Environment, Map, Source, Value};
use serde::Deserialize;

/// Prefix used for every environment variable the Topic Manager recognizes, e.g.
/// `TOPIC_MANAGER_CONSUMER_POLL_RETRY_TIMES`.
pub const ENV_PREFIX: &str = "TOPIC_MANAGER";

pub const DEFAULT_CONSUMER_POLL_RETRY_TIMES: u32 = 3;
pub const DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS: u64 = 0;
pub const DEFAULT_ADMIN_GET_TOPIC_CONFIG_MAX_RETRY_TIME_SEC: u64 = 60;
pub const DEFAULT_RECEIVE_BUFFER_BYTES: u64 = 1_048_576;

/// Process-wide tunables for the Topic Manager.
#[derive(Clone, Debug, Deserialize)]
pub struct TopicManagerConfig {
    pub bootstrap_servers: String,
    pub consumer_poll_retry_times: u32,
    pub consumer_poll_retry_backoff_ms: u64,
    pub kafka_admin_get_topic_config_max_retry_time_sec: u64,
    pub receive_buffer_bytes: u64,
}

impl TopicManagerConfig {
    /// Loads configuration with environment variables taking precedence over the compiled-in
    /// [`Defaults`] source. A caller embedding this crate in its own CLI can `add_source` a
    /// higher-precedence source (CLI args, a profile file) on top of this builder.
    pub fn load(bootstrap_servers: impl Into<String>) -> anyhow::Result<Self> {
        let config = ConfigRs::builder()
            .add_source(Defaults)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .set_override("bootstrap_servers", bootstrap_servers.into())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn consumer_poll_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_retry_backoff_ms)
    }

    pub fn admin_get_topic_config_max_retry_time(&self) -> Duration {
        Duration::from_secs(self.kafka_admin_get_topic_config_max_retry_time_sec)
    }
}

/// Compiled-in defaults for every [`TopicManagerConfig`] field except `bootstrap_servers`, which
/// has no sensible default and is always supplied by the caller.
#[derive(Debug)]
struct Defaults;

impl Source for Defaults {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(Defaults)
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        cfg.insert(
            "consumer_poll_retry_times".to_string(),
            Value::from(DEFAULT_CONSUMER_POLL_RETRY_TIMES),
        );
        cfg.insert(
            "consumer_poll_retry_backoff_ms".to_string(),
            Value::from(DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS),
        );
        cfg.insert(
            "kafka_admin_get_topic_config_max_retry_time_sec".to_string(),
            Value::from(DEFAULT_ADMIN_GET_TOPIC_CONFIG_MAX_RETRY_TIME_SEC),
        );
        cfg.insert(
            "receive_buffer_bytes".to_string(),
            Value::from(DEFAULT_RECEIVE_BUFFER_BYTES),
        );

        Ok(cfg)
    }
}
