use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to serialize message of type '{type_tag}': {source}")]
    Serialize {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to publish message of type '{type_tag}': {message}")]
    Publish { type_tag: String, message: String },
    #[error("queue has no writer configured")]
    WriterNotConfigured,
    #[error("failed to connect to {backend}: {message}")]
    Connect {
        backend: &'static str,
        message: String,
    },
    #[error("invalid queue configuration: {0}")]
    Config(String),
    #[error("reader loops already started")]
    AlreadyStarted,
    #[error("queue is closed")]
    Closed,
    #[error("failed to fetch message: {0}")]
    Fetch(String),
    #[error("failed to settle message at {position}: {message}")]
    Settle { position: String, message: String },
    #[error("failed to dead-letter message at {position}: {message}")]
    DeadLetter { position: String, message: String },
    #[error("failed to close {backend}: {message}")]
    Close {
        backend: &'static str,
        message: String,
    },
}

impl QueueError {
    /// Errors after which a reader loop must stop instead of fetching again.
    pub fn halts_reader(&self) -> bool {
        matches!(self, QueueError::DeadLetter { .. } | QueueError::Closed)
    }
}
