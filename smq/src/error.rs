#[derive(thiserror::Error, Debug)]
pub enum SmqError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("JSON Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    #[error("Worker panic: {0}")]
    WorkerPanic(String),

    /// The owning component left its expected lifecycle state before the operation finished
    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Lock {0} could not be acquired")]
    LockNotAcquired(String),

    /// The script moved a different number of messages than the caller expected.
    /// Indicates concurrent corruption of the processing list; never retried.
    #[error("Processed count mismatch: expected {expected}, processed {processed}")]
    ProcessedCountMismatch { expected: usize, processed: usize },

    #[error("Unexpected script reply: {0}")]
    UnexpectedScriptReply(String),

    #[error("Invalid queue parameters: {0}")]
    InvalidQueueParameters(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid queue state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("A consumer group id is required for pub/sub queue {0}")]
    ConsumerGroupIdRequired(String),

    #[error("Consumer group ids are not supported by point-to-point queue {0}")]
    ConsumerGroupIdNotSupported(String),

    #[error("Consumer group {group_id} does not exist on queue {queue}")]
    ConsumerGroupNotFound { queue: String, group_id: String },

    #[error("Priority queue {0} requires a message priority")]
    PriorityRequired(String),

    #[error("Queue {0} does not support message priorities")]
    PriorityNotSupported(String),

    #[error("Queue {0} not found")]
    QueueNotFound(String),

    #[error("Queue {0} already exists with different settings")]
    QueueAlreadyExists(String),

    #[error("Queue {0} has no consumer groups")]
    QueueHasNoConsumerGroups(String),

    #[error("Queue {0} is locked")]
    QueueLocked(String),

    #[error("A message handler for {0} already exists")]
    MessageHandlerAlreadyExists(String),

    #[error("Message {0} not found")]
    MessageNotFound(String),
}

impl SmqError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Whether the error is a protocol level invariant violation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SmqError::ProcessedCountMismatch { .. } | SmqError::UnexpectedScriptReply(_)
        )
    }
}
