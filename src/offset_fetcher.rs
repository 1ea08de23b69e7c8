use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::Message;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::admin::{PartitionInfo, ReadOnlyAdminClient, TopicPartition};
use crate::backoff::{Attempt, BackoffConfig};
use crate::consumer::RawConsumer;
use crate::error::{Result, TopicManagerError};

/// Default timeout applied to individual broker-facing queries made by this component.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff used between retry attempts for the `*AndRetry` queries.
const RETRY_BACKOFF: BackoffConfig = BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(1));

/// How many records to walk backward from the tail when looking for the last non-control record.
const MAX_TAIL_SCAN_DEPTH: i64 = 10;

/// Metadata and offset queries used by producers, consumers, and orchestration code.
///
/// Wraps a read-only admin client and a dedicated, non-thread-safe raw consumer. Because the
/// wrapped consumer is not thread-safe, every query serializes through `consumer`'s mutex and
/// holds it for the duration of an entire retry cycle rather than releasing it between attempts.
pub struct PartitionOffsetFetcher {
    admin: Arc<dyn ReadOnlyAdminClient>,
    consumer: Mutex<RawConsumer>,
}

impl PartitionOffsetFetcher {
    pub fn new(admin: Arc<dyn ReadOnlyAdminClient>, consumer: RawConsumer) -> Self {
        Self {
            admin,
            consumer: Mutex::new(consumer),
        }
    }

    /// Mapping of partition index to latest offset for every partition of `topic`. Returns an
    /// empty map on error rather than propagating it.
    pub async fn get_topic_latest_offsets(&self, topic: &str) -> HashMap<i32, i64> {
        let partitions = match self.partitions_for(topic).await {
            Ok(p) => p,
            Err(e) => {
                warn!(topic, error = %e, "failed to list partitions while fetching latest offsets");
                return HashMap::new();
            }
        };

        let consumer = self.consumer.lock().await;
        let mut out = HashMap::with_capacity(partitions.len());

        for p in partitions {
            match consumer.fetch_watermarks(&p.tp, DEFAULT_QUERY_TIMEOUT).await {
                Ok((_, high)) => {
                    out.insert(p.tp.partition, high);
                }
                Err(e) => {
                    warn!(topic, partition = p.tp.partition, error = %e, "failed to fetch watermark");
                }
            }
        }

        out
    }

    /// Latest offset for a single partition, retried up to `retries` times on transient broker
    /// faults.
    pub async fn get_partition_latest_offset_and_retry(
        &self,
        tp: &TopicPartition,
        retries: u32,
    ) -> Result<i64> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let consumer = self.consumer.lock().await;

        crate::backoff::retry_with_backoff(
            RETRY_BACKOFF,
            retries.max(1),
            deadline,
            || async {
                match consumer.fetch_watermarks(tp, DEFAULT_QUERY_TIMEOUT).await {
                    Ok((_, high)) => Attempt::Done(high),
                    Err(e) => Attempt::Retry(e),
                }
            },
            |e| e.is_retriable(),
        )
        .await
    }

    /// Earliest offset for a single partition, retried up to `retries` times on transient broker
    /// faults.
    pub async fn get_partition_earliest_offset_and_retry(
        &self,
        tp: &TopicPartition,
        retries: u32,
    ) -> Result<i64> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let consumer = self.consumer.lock().await;

        crate::backoff::retry_with_backoff(
            RETRY_BACKOFF,
            retries.max(1),
            deadline,
            || async {
                match consumer.fetch_watermarks(tp, DEFAULT_QUERY_TIMEOUT).await {
                    Ok((low, _)) => Attempt::Done(low),
                    Err(e) => Attempt::Retry(e),
                }
            },
            |e| e.is_retriable(),
        )
        .await
    }

    /// Resolves the earliest offset at or after `timestamp_ms` for `tp`, or `None` if the broker
    /// has no such offset.
    pub async fn get_partition_offset_by_time(
        &self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>> {
        let consumer = self.consumer.lock().await;
        consumer.offset_for_time(tp, timestamp_ms, DEFAULT_QUERY_TIMEOUT).await
    }

    /// Reads the tail record's embedded producer timestamp, skipping control messages. Retried up
    /// to `retries` times on transient broker faults.
    ///
    /// Control messages (non-data records carrying stream metadata such as transaction markers)
    /// carry no key or value; this is the only signal available on an `OwnedMessage` to
    /// distinguish them from data records at this layer, so the scan treats an empty
    /// key-and-value record as control and walks backward, bounded by [`MAX_TAIL_SCAN_DEPTH`].
    pub async fn get_producer_timestamp_of_last_data_record(
        &self,
        tp: &TopicPartition,
        retries: u32,
    ) -> Result<Option<i64>> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut consumer = self.consumer.lock().await;

        let (_, high) = crate::backoff::retry_with_backoff(
            RETRY_BACKOFF,
            retries.max(1),
            deadline,
            || async {
                match consumer.fetch_watermarks(tp, DEFAULT_QUERY_TIMEOUT).await {
                    Ok(w) => Attempt::Done(w),
                    Err(e) => Attempt::Retry(e),
                }
            },
            |e| e.is_retriable(),
        )
        .await?;

        if high == 0 {
            return Ok(None);
        }

        let mut offset = high - 1;
        let floor = (high - MAX_TAIL_SCAN_DEPTH).max(0);

        while offset >= floor {
            let msg = consumer.read_one_at(tp, offset, DEFAULT_QUERY_TIMEOUT).await?;

            match msg {
                Some(m) if m.key().is_some() || m.payload().is_some() => {
                    return Ok(m.timestamp().to_millis());
                }
                _ => {
                    offset -= 1;
                }
            }
        }

        Ok(None)
    }

    /// Partition readiness info for every partition of `topic`.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>> {
        let topics = self.admin.list_all_topics().await?;

        topics
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .ok_or_else(|| TopicManagerError::TopicDoesNotExist {
                topic: topic.to_string(),
            })
    }
}
