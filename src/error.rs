use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::admin::TopicPartition;

/// Error taxonomy for the Topic Manager and the components it composes.
///
/// Variants are grouped by semantic, not by the underlying broker error type, so that callers can
/// branch on what happened ("does this topic exist") rather than on a transport-level error code.
#[derive(Debug, Error)]
pub enum TopicManagerError {
    /// A config or metadata read targeted a topic that does not exist on the broker.
    #[error("topic '{topic}' does not exist")]
    TopicDoesNotExist { topic: String },

    /// `createTopic` raced with another creator and lost.
    #[error("topic '{topic}' already exists")]
    TopicExists { topic: String },

    /// A classified-transient broker fault (replication factor not yet settled, admin call
    /// timeout) that is safe to retry within a bounded window.
    #[error("transient broker fault during {operation}: {source}")]
    TransientBrokerFault {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    /// A deadline (per-call or overall retry-cycle) was exhausted.
    #[error("operation {operation} timed out against Kafka after {elapsed:?}")]
    OperationTimedOut {
        operation: &'static str,
        elapsed: Duration,
        #[source]
        source: Option<Box<TopicManagerError>>,
    },

    /// Caller asked the raw consumer to act on a partition it has not subscribed to.
    #[error("topic-partition {tp} is not subscribed")]
    UnsubscribedTopicPartition { tp: TopicPartition },

    /// A busy error raised by `ensureTopicIsDeletedAndBlock` when concurrent deletion is disabled
    /// and the broker reports a deletion already underway.
    #[error("deletion of topic '{topic}' is already underway")]
    DeletionUnderway { topic: String },

    /// The calling task observed a cancellation while waiting on a retry sleep or a future wait.
    /// Preserves the last error seen before the cancellation was observed.
    #[error("operation was interrupted: {source}")]
    Interrupted {
        #[source]
        source: Box<TopicManagerError>,
    },

    /// Anything else surfaced by the broker layer, propagated unchanged.
    #[error(transparent)]
    Fatal(#[from] KafkaError),

    /// The blocking-thread task a consumer poll was dispatched to panicked or was cancelled
    /// before it could report back.
    #[error("blocking consumer task failed: {0}")]
    BlockingTaskFailed(String),
}

impl TopicManagerError {
    /// Short, stable tag suitable for log fields and metrics dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TopicDoesNotExist { .. } => "topic_does_not_exist",
            Self::TopicExists { .. } => "topic_exists",
            Self::TransientBrokerFault { .. } => "transient_broker_fault",
            Self::OperationTimedOut { .. } => "operation_timed_out",
            Self::UnsubscribedTopicPartition { .. } => "unsubscribed_topic_partition",
            Self::DeletionUnderway { .. } => "deletion_underway",
            Self::Interrupted { .. } => "interrupted",
            Self::Fatal(_) => "fatal",
            Self::BlockingTaskFailed(_) => "blocking_task_failed",
        }
    }

    /// Returns true if this error is safe to retry with backoff: a transient broker fault, or an
    /// underlying `InvalidReplicationFactor`/`Timeout` from the broker.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientBrokerFault { .. } => true,
            Self::Fatal(e) => is_retriable_kafka_error(e),
            _ => false,
        }
    }

    /// Returns true if the broker reported `UnknownTopicOrPartition` somewhere in this error.
    pub fn is_unknown_topic_or_partition(&self) -> bool {
        match self {
            Self::Fatal(e) => matches!(
                e,
                KafkaError::Global(RDKafkaErrorCode::UnknownTopicOrPartition)
                    | KafkaError::AdminOp(RDKafkaErrorCode::UnknownTopicOrPartition)
                    | KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopicOrPartition)
            ),
            _ => false,
        }
    }

    /// Classifies the broker's response as `TopicDoesNotExist` when it reports
    /// `UnknownTopicOrPartition`, otherwise passes the error through unchanged. Every admin
    /// operation funnels its error results through this function.
    pub fn translate_unknown_topic(topic: impl Into<String>, source: KafkaError) -> Self {
        if is_unknown_topic_or_partition_code(&source) {
            Self::TopicDoesNotExist { topic: topic.into() }
        } else {
            Self::Fatal(source)
        }
    }
}

fn is_retriable_kafka_error(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::Global(
            RDKafkaErrorCode::InvalidReplicationFactor | RDKafkaErrorCode::RequestTimedOut
        ) | KafkaError::AdminOp(
            RDKafkaErrorCode::InvalidReplicationFactor | RDKafkaErrorCode::RequestTimedOut
        ) | KafkaError::AdminOpCreation(_)
    )
}

fn is_unknown_topic_or_partition_code(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::Global(RDKafkaErrorCode::UnknownTopicOrPartition)
            | KafkaError::AdminOp(RDKafkaErrorCode::UnknownTopicOrPartition)
            | KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopicOrPartition)
    )
}

pub type Result<T> = std::result::Result<T, TopicManagerError>;
