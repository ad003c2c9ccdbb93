use thiserror::Error;

/// Failures of the broker-facing operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare queue '{queue}': {reason}")]
    Declaration { queue: String, reason: String },

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to '{queue}': {reason}")]
    Publish { queue: String, reason: String },

    #[error("Failed to consume from '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    #[error("Failed to settle delivery: {0}")]
    Acknowledge(String),

    #[error("Queue client is closed")]
    Closed,
}

impl QueueError {
    /// Serialization failures drop the message; everything else may succeed on a later call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, QueueError::Serialization(_) | QueueError::Closed)
    }
}

/// Handler failures. These stay inside the consumer loop and drive retry/dead-letter.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("Handler timed out after {0} ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, QueueError>;
