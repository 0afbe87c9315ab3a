//! Batch engine error types.

use thiserror::Error;

use batchpoint_core::ConfigError;
use batchpoint_queue::{HandlingErrorKind, MessageId, QueueError};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("malformed batch document: {0}")]
    Document(String),

    #[error("body of message {id} is not valid UTF-8: {source}")]
    Encoding {
        id: MessageId,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("hand-off of batch for class '{class_id}' failed: {source}")]
    HandOff {
        class_id: String,
        #[source]
        source: QueueError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for BatchError {
    fn from(e: serde_json::Error) -> Self {
        BatchError::Document(e.to_string())
    }
}

impl BatchError {
    /// Whether the worker loop cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            BatchError::Queue(e) => e.is_fatal(),
            BatchError::Config(_) => true,
            _ => false,
        }
    }

    /// Reason code used when a message is dead-lettered because of this error.
    pub fn handling_kind(&self) -> HandlingErrorKind {
        match self {
            BatchError::Encoding { .. } => HandlingErrorKind::InvalidBody,
            _ => HandlingErrorKind::Unknown,
        }
    }
}
