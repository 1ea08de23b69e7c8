use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, ClientContext, Offset, TopicPartitionList,
    config::RDKafkaLogLevel,
    consumer::{BaseConsumer, Consumer as RDConsumer, ConsumerContext as RDConsumerContext, Rebalance},
    error::KafkaResult,
    message::OwnedMessage,
};
use tracing::{debug, error, info, warn};

use crate::admin::TopicPartition;
use crate::error::{Result, TopicManagerError};

/// Sentinel offset meaning "start from the earliest available record".
pub const LOWEST_OFFSET: i64 = -1;

/// Default number of times `poll` retries a classified-transient error.
pub const DEFAULT_CONSUMER_POLL_RETRY_TIMES: u32 = 3;

/// Default backoff between poll retries.
pub const DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS: u64 = 0;

/// Forwards librdkafka's internal log lines and rebalance/commit callbacks through `tracing`.
pub(crate) struct ConsumerContext;

impl ClientContext for ConsumerContext {
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

impl RDConsumerContext for ConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        debug!("rebalance initiated: {:?}", rebalance);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                tpl.elements()
                    .iter()
                    .for_each(|e| info!("assigned partition {} on {}", e.partition(), e.topic()));
            }
            Rebalance::Revoke(tpl) => {
                tpl.elements()
                    .iter()
                    .for_each(|e| info!("revoked partition {} on {}", e.partition(), e.topic()));
            }
            Rebalance::Error(err) => error!("error during rebalance: {}", err),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            error!("error committing consumer offsets: {}", e);
        }
    }
}

/// A single, blocking poll attempt against the broker. Split out from [`RawConsumer`] so
/// [`RawConsumer::poll`]'s retry loop can be exercised with a fake source in tests, without a live
/// broker.
#[async_trait]
trait PollSource: Send + Sync {
    async fn poll_once(&self, timeout: Duration) -> Result<Option<KafkaResult<OwnedMessage>>>;
}

/// Runs [`BaseConsumer::poll`] on a blocking-task thread, since it is a synchronous call that can
/// block for the full poll timeout waiting on the broker.
struct BrokerPollSource(Arc<BaseConsumer<ConsumerContext>>);

#[async_trait]
impl PollSource for BrokerPollSource {
    async fn poll_once(&self, timeout: Duration) -> Result<Option<KafkaResult<OwnedMessage>>> {
        let consumer = Arc::clone(&self.0);

        // `BorrowedMessage` carries the consumer's own lifetime, so it must be detached into an
        // owned message inside the blocking closure before it can cross back over the
        // `spawn_blocking` boundary.
        tokio::task::spawn_blocking(move || consumer.poll(timeout).map(|r| r.map(|msg| msg.detach())))
            .await
            .map_err(|e| TopicManagerError::BlockingTaskFailed(e.to_string()))
    }
}

/// Non-thread-safe wrapper over a raw, byte-level Kafka consumer.
///
/// The wrapper is not internally synchronized: its mutating methods take `&mut self`, so the
/// compiler enforces exclusive access instead of an internal lock. Exactly one owner holds it at
/// a time, either [`crate::offset_fetcher::PartitionOffsetFetcher`] (behind its own
/// `tokio::sync::Mutex`) or an external subscription engine.
pub struct RawConsumer {
    /// `librdkafka` consumer handles are thread-safe, so this is shared through an `Arc` rather
    /// than held behind `&mut` access: every blocking broker round trip (`fetch_watermarks`,
    /// `offsets_for_times`) is dispatched to `tokio::task::spawn_blocking`, which needs its own
    /// owned handle to the consumer rather than a borrow tied to `&self`.
    consumer: Arc<BaseConsumer<ConsumerContext>>,
    poll_source: Box<dyn PollSource>,
    /// Tracks the position each assigned partition should resume at if the assignment is
    /// rebuilt. `BaseConsumer::assign` replaces the entire assignment on every call, so every
    /// mutation of the assignment set re-supplies positions for partitions that were already
    /// assigned, not just the newly added ones; otherwise a `subscribe` for partition 2 would
    /// silently rewind partition 1 back to its original seek target.
    assignment: HashMap<TopicPartition, Offset>,
    poll_retry_backoff: Duration,
    poll_retry_times: u32,
}

impl RawConsumer {
    pub fn new(config: HashMap<String, String>) -> Result<Self> {
        Self::with_retry_policy(
            config,
            Duration::from_millis(DEFAULT_CONSUMER_POLL_RETRY_BACKOFF_MS),
            DEFAULT_CONSUMER_POLL_RETRY_TIMES,
        )
    }

    pub fn with_retry_policy(
        config: HashMap<String, String>,
        poll_retry_backoff: Duration,
        poll_retry_times: u32,
    ) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        // defaults
        client_config.set("enable.auto.commit", "false");
        client_config.set("enable.partition.eof", "false");

        // caller-supplied values
        client_config.extend(config);

        let consumer: BaseConsumer<ConsumerContext> = client_config
            .set_log_level(RDKafkaLogLevel::Debug)
            .create_with_context(ConsumerContext)
            .map_err(TopicManagerError::Fatal)?;

        let consumer = Arc::new(consumer);
        let poll_source: Box<dyn PollSource> = Box::new(BrokerPollSource(Arc::clone(&consumer)));

        Ok(Self {
            consumer,
            poll_source,
            assignment: HashMap::new(),
            poll_retry_backoff,
            poll_retry_times,
        })
    }

    /// Swaps in a fake poll source, for exercising the retry loop in [`Self::poll`] without a live
    /// broker.
    #[cfg(test)]
    fn with_poll_source(mut self, poll_source: Box<dyn PollSource>) -> Self {
        self.poll_source = poll_source;
        self
    }

    fn apply_assignment(&self) -> Result<()> {
        let mut tpl = TopicPartitionList::with_capacity(self.assignment.len());

        for (tp, offset) in &self.assignment {
            tpl.add_partition_offset(&tp.topic, tp.partition, *offset)
                .map_err(TopicManagerError::Fatal)?;
        }

        self.consumer.assign(&tpl).map_err(TopicManagerError::Fatal)
    }

    /// Adds `tp` to the assignment if not already present, then positions it: seeks to
    /// `last_read_offset + 1` if `last_read_offset > LOWEST_OFFSET`, else seeks to earliest. A
    /// no-op (with a warning) if `tp` is already subscribed.
    pub fn subscribe(&mut self, tp: TopicPartition, last_read_offset: i64) -> Result<()> {
        if self.assignment.contains_key(&tp) {
            warn!(%tp, "already subscribed to topic-partition; ignoring");
            return Ok(());
        }

        let offset = if last_read_offset > LOWEST_OFFSET {
            Offset::Offset(last_read_offset + 1)
        } else {
            Offset::Beginning
        };

        self.assignment.insert(tp, offset);
        self.apply_assignment()
    }

    /// Removes `tp` from the assignment.
    pub fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<()> {
        self.assignment.remove(tp);
        self.apply_assignment()
    }

    /// Removes every `tp` in `tps` from the assignment with a single assignment update.
    pub fn batch_unsubscribe(&mut self, tps: &HashSet<TopicPartition>) -> Result<()> {
        for tp in tps {
            self.assignment.remove(tp);
        }
        self.apply_assignment()
    }

    /// Seeks `tp` back to the earliest available offset. Requires `tp` to already be subscribed.
    pub fn reset_offset(&mut self, tp: &TopicPartition) -> Result<()> {
        if !self.assignment.contains_key(tp) {
            return Err(TopicManagerError::UnsubscribedTopicPartition { tp: tp.clone() });
        }

        self.assignment.insert(tp.clone(), Offset::Beginning);
        self.apply_assignment()
    }

    /// Pauses consumption on `tp`. A no-op if `tp` is not subscribed.
    pub fn pause(&self, tp: &TopicPartition) -> Result<()> {
        if !self.assignment.contains_key(tp) {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&tp.topic, tp.partition);
        self.consumer.pause(&tpl).map_err(TopicManagerError::Fatal)
    }

    /// Resumes consumption on `tp`. A no-op if `tp` is not subscribed.
    pub fn resume(&self, tp: &TopicPartition) -> Result<()> {
        if !self.assignment.contains_key(tp) {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&tp.topic, tp.partition);
        self.consumer.resume(&tpl).map_err(TopicManagerError::Fatal)
    }

    pub fn has_any_subscription(&self) -> bool {
        !self.assignment.is_empty()
    }

    pub fn has_subscription(&self, tp: &TopicPartition) -> bool {
        self.assignment.contains_key(tp)
    }

    pub fn get_assignment(&self) -> Vec<TopicPartition> {
        self.assignment.keys().cloned().collect()
    }

    /// Fetches one batch of records, retrying classified-transient errors with backoff.
    ///
    /// `BaseConsumer::poll` returns at most one message per call, unlike the batch-oriented
    /// high-level consumer APIs this wrapper's contract is modeled on; this method polls
    /// repeatedly (non-blocking after the first call) until either the timeout elapses or the
    /// broker stops returning messages, collecting everything received into one batch. This is the
    /// natural rendering of "fetch one batch" over `BaseConsumer`.
    ///
    /// Each individual poll runs on `spawn_blocking`, since `BaseConsumer::poll` is a synchronous
    /// call that can block for the full poll timeout; running it inline would tie up a tokio
    /// worker thread for the duration.
    ///
    /// Retries up to `poll_retry_times` on a transient error, sleeping `poll_retry_backoff`
    /// between attempts; the final attempt's error is returned unchanged. Progress already made
    /// (messages collected before the failing poll) is returned alongside the error via
    /// [`PollOutcome::Partial`] so callers don't lose already-fetched records.
    pub async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() && !batch.is_empty() {
                return Ok(PollOutcome::Batch(batch));
            }

            match self.poll_once(remaining.min(Duration::from_millis(100))).await? {
                None => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(PollOutcome::Batch(batch));
                    }
                    if batch.is_empty() {
                        continue;
                    }
                    return Ok(PollOutcome::Batch(batch));
                }
                Some(Ok(owned)) => {
                    self.record_position(&owned);
                    batch.push(owned);
                    attempt = 0;
                }
                Some(Err(e)) => {
                    let err = TopicManagerError::Fatal(e);

                    if !err.is_retriable() || attempt + 1 >= self.poll_retry_times {
                        if batch.is_empty() {
                            return Err(err);
                        }
                        return Ok(PollOutcome::Partial(batch, Box::new(err)));
                    }

                    attempt += 1;
                    if !self.poll_retry_backoff.is_zero() {
                        tokio::time::sleep(self.poll_retry_backoff).await;
                    }
                }
            }
        }
    }

    async fn poll_once(&self, timeout: Duration) -> Result<Option<KafkaResult<OwnedMessage>>> {
        self.poll_source.poll_once(timeout).await
    }

    /// Updates the tracked position for the partition the message was read from, so that a later
    /// assignment rebuild resumes from just past this message rather than rewinding.
    fn record_position(&mut self, msg: &OwnedMessage) {
        use rdkafka::Message;

        let tp = TopicPartition::new(msg.topic(), msg.partition());
        if let Some(offset) = self.assignment.get_mut(&tp) {
            *offset = Offset::Offset(msg.offset() + 1);
        }
    }

    /// Best-effort close; errors are logged and swallowed.
    pub fn close(self) {
        debug!("closing raw consumer");
    }

    /// Low-level watermark query used by [`crate::offset_fetcher::PartitionOffsetFetcher`]. Does
    /// not touch the tracked assignment. Dispatched to `spawn_blocking` since the underlying
    /// `BaseConsumer::fetch_watermarks` call blocks for up to `timeout` waiting on the broker.
    pub async fn fetch_watermarks(&self, tp: &TopicPartition, timeout: Duration) -> Result<(i64, i64)> {
        let consumer = Arc::clone(&self.consumer);
        let topic = tp.topic.clone();
        let partition = tp.partition;

        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(TopicManagerError::Fatal)
        })
        .await
        .map_err(|e| TopicManagerError::BlockingTaskFailed(e.to_string()))?
    }

    /// Resolves the earliest offset whose record timestamp is `>= timestamp_ms`, or `None` if the
    /// broker reports no such offset. Dispatched to `spawn_blocking` for the same reason as
    /// [`Self::fetch_watermarks`].
    pub async fn offset_for_time(
        &self,
        tp: &TopicPartition,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<Option<i64>> {
        let consumer = Arc::clone(&self.consumer);
        let tp = tp.clone();

        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(timestamp_ms))
                .map_err(TopicManagerError::Fatal)?;

            let resolved = consumer.offsets_for_times(tpl, timeout).map_err(TopicManagerError::Fatal)?;

            Ok(resolved
                .elements()
                .iter()
                .find(|e| e.partition() == tp.partition)
                .and_then(|e| match e.offset() {
                    Offset::Offset(o) => Some(o),
                    _ => None,
                }))
        })
        .await
        .map_err(|e| TopicManagerError::BlockingTaskFailed(e.to_string()))?
    }

    /// Replaces the entire assignment with a single partition at an exact offset and reads one
    /// record, for point queries (offset-by-time lookups, tail-record reads) that this dedicated
    /// consumer instance is solely responsible for. Unlike [`Self::subscribe`], this bypasses the
    /// "+1 from last read offset" convention: the caller supplies the exact offset to position at.
    pub async fn read_one_at(
        &mut self,
        tp: &TopicPartition,
        offset: i64,
        timeout: Duration,
    ) -> Result<Option<OwnedMessage>> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset))
            .map_err(TopicManagerError::Fatal)?;
        self.consumer.assign(&tpl).map_err(TopicManagerError::Fatal)?;

        self.assignment.clear();
        self.assignment.insert(tp.clone(), Offset::Offset(offset));

        match self.poll(timeout).await? {
            PollOutcome::Batch(msgs) => Ok(msgs.into_iter().next()),
            PollOutcome::Partial(mut msgs, err) => {
                if msgs.is_empty() {
                    Err(*err)
                } else {
                    Ok(Some(msgs.remove(0)))
                }
            }
        }
    }
}

/// Result of a [`RawConsumer::poll`] call.
pub enum PollOutcome {
    /// The full batch collected within the timeout.
    Batch(Vec<OwnedMessage>),
    /// A partial batch collected before a non-retriable or retry-exhausted error occurred. The
    /// caller is responsible for deciding whether to process the partial batch before
    /// propagating the error.
    Partial(Vec<OwnedMessage>, Box<TopicManagerError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer() -> RawConsumer {
        let mut config = HashMap::new();
        config.insert("bootstrap.servers".to_string(), "localhost:9092".to_string());
        RawConsumer::new(config).expect("consumer created without contacting a broker")
    }

    #[test]
    fn subscribe_tracks_seek_target_for_positive_offset() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        consumer.subscribe(tp.clone(), 41).unwrap();

        assert_eq!(consumer.assignment.get(&tp), Some(&Offset::Offset(42)));
    }

    #[test]
    fn subscribe_seeks_to_beginning_for_lowest_sentinel() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        consumer.subscribe(tp.clone(), LOWEST_OFFSET).unwrap();

        assert_eq!(consumer.assignment.get(&tp), Some(&Offset::Beginning));
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        consumer.subscribe(tp.clone(), 41).unwrap();
        consumer.subscribe(tp.clone(), 999).unwrap();

        assert_eq!(consumer.assignment.get(&tp), Some(&Offset::Offset(42)));
    }

    #[test]
    fn unsubscribe_removes_from_assignment() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        consumer.subscribe(tp.clone(), LOWEST_OFFSET).unwrap();
        consumer.unsubscribe(&tp).unwrap();

        assert!(!consumer.has_subscription(&tp));
    }

    #[test]
    fn reset_offset_requires_existing_subscription() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        let err = consumer.reset_offset(&tp).unwrap_err();
        assert!(matches!(err, TopicManagerError::UnsubscribedTopicPartition { .. }));
    }

    #[test]
    fn reset_offset_seeks_subscribed_partition_to_beginning() {
        let mut consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        consumer.subscribe(tp.clone(), 41).unwrap();
        consumer.reset_offset(&tp).unwrap();

        assert_eq!(consumer.assignment.get(&tp), Some(&Offset::Beginning));
    }

    #[test]
    fn batch_unsubscribe_removes_every_partition_at_once() {
        let mut consumer = consumer();
        let tp0 = TopicPartition::new("orders_v3", 0);
        let tp1 = TopicPartition::new("orders_v3", 1);

        consumer.subscribe(tp0.clone(), LOWEST_OFFSET).unwrap();
        consumer.subscribe(tp1.clone(), LOWEST_OFFSET).unwrap();

        let mut to_remove = HashSet::new();
        to_remove.insert(tp0.clone());
        to_remove.insert(tp1.clone());

        consumer.batch_unsubscribe(&to_remove).unwrap();

        assert!(!consumer.has_any_subscription());
    }

    #[test]
    fn pause_is_a_noop_when_not_subscribed() {
        let consumer = consumer();
        let tp = TopicPartition::new("orders_v3", 0);

        assert!(consumer.pause(&tp).is_ok());
    }

    /// A poll source that fails with a retriable error a fixed number of times before returning
    /// `None` (no message, batch complete), counting every attempt made in a shared counter the
    /// test can inspect after the fake has been moved into the consumer.
    struct FlakyPollSource {
        attempts: Arc<std::sync::atomic::AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl PollSource for FlakyPollSource {
        async fn poll_once(&self, _timeout: Duration) -> Result<Option<KafkaResult<OwnedMessage>>> {
            let attempt = self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            if attempt < self.fail_times {
                let source = rdkafka::error::KafkaError::Global(rdkafka::types::RDKafkaErrorCode::RequestTimedOut);
                Ok(Some(Err(source)))
            } else {
                Ok(None)
            }
        }
    }

    fn flaky_consumer(fail_times: u32, poll_retry_times: u32) -> (RawConsumer, Arc<std::sync::atomic::AtomicU32>) {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fake = FlakyPollSource {
            attempts: Arc::clone(&attempts),
            fail_times,
        };
        let mut config = HashMap::new();
        config.insert("bootstrap.servers".to_string(), "localhost:9092".to_string());

        let consumer = RawConsumer::with_retry_policy(config, Duration::ZERO, poll_retry_times)
            .unwrap()
            .with_poll_source(Box::new(fake));

        (consumer, attempts)
    }

    #[tokio::test]
    async fn poll_retries_transient_errors_then_returns_once_they_stop() {
        let (mut consumer, attempts) = flaky_consumer(2, 3);

        let outcome = consumer.poll(Duration::from_millis(50)).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Batch(batch) if batch.is_empty()));
        assert!(attempts.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn poll_retries_at_most_poll_retry_times_and_surfaces_original_error() {
        let (mut consumer, attempts) = flaky_consumer(u32::MAX, 3);

        let err = consumer.poll(Duration::from_millis(50)).await.unwrap_err();

        assert!(matches!(
            err,
            TopicManagerError::Fatal(rdkafka::error::KafkaError::Global(
                rdkafka::types::RDKafkaErrorCode::RequestTimedOut
            ))
        ));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
