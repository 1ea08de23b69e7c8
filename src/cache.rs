use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::admin::TopicConfig;

/// Default cache TTL of 5 minutes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// A cached value paired with the time it was inserted, used to determine expiration.
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Bounded, time-expiring mapping from topic name to its last-seen [`TopicConfig`].
///
/// Entries are advisory: they are never returned once older than `ttl`, and there is no negative
/// caching: a cache miss always means "fetch from the broker", never "topic does not exist".
/// Writes write-through: a mutation inserts the new config under the same key rather than
/// invalidating it.
pub struct TopicConfigCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry<TopicConfig>>>>,
    ttl: Duration,
}

impl TopicConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }

    /// Returns the cached config for `topic`, if any entry exists and has not expired.
    pub async fn get(&self, topic: &str) -> Option<TopicConfig> {
        let entries = self.entries.read().await;
        entries
            .get(topic)
            .filter(|e| !e.is_expired(self.ttl))
            .map(|e| e.value.clone())
    }

    /// Inserts or replaces the cached config for `topic`. Called on every successful config read
    /// and on every config write, so reads populate the cache and writes go through it.
    pub async fn put(&self, topic: impl Into<String>, config: TopicConfig) {
        let mut entries = self.entries.write().await;
        entries.insert(topic.into(), CacheEntry::new(config));
    }
}

impl Clone for TopicConfigCache {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            ttl: self.ttl,
        }
    }
}
