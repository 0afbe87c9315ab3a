//! Message source trait: the peek-lock protocol the batch engine consumes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::message::{InboundMessage, MessageId};

/// Reason code attached to a message acknowledged as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlingErrorKind {
    Unknown,
    /// The message body could not be folded into a batch.
    InvalidBody,
    /// The batch was delivered but completing the message's lock failed.
    AckFailed,
}

impl fmt::Display for HandlingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandlingErrorKind::Unknown => "Unknown",
            HandlingErrorKind::InvalidBody => "InvalidBody",
            HandlingErrorKind::AckFailed => "AckFailed",
        };
        f.write_str(s)
    }
}

/// Trait for queue backends that hand out messages under a lock.
///
/// A peek-locked message stays in the queue until it is completed
/// (removed), completed with an error (dead-lettered) or abandoned
/// (released for redelivery). Nothing is ever deleted outside this protocol.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Lock the next available message, waiting up to `timeout`.
    ///
    /// Returns `None` when nothing arrived within the timeout.
    async fn peek_lock(&self, timeout: Duration) -> Result<Option<InboundMessage>, QueueError>;

    /// Acknowledge successful processing; removes the message.
    async fn complete(&self, id: MessageId) -> Result<(), QueueError>;

    /// Acknowledge as failed; routes the message to the dead-letter path.
    async fn complete_with_error(
        &self,
        id: MessageId,
        kind: HandlingErrorKind,
        detail: &str,
    ) -> Result<(), QueueError>;

    /// Release the lock so the message is redelivered.
    async fn abandon(&self, id: MessageId) -> Result<(), QueueError>;
}

/// Blanket implementation so `Arc<dyn MessageSource>` can be used directly.
#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for Arc<T> {
    async fn peek_lock(&self, timeout: Duration) -> Result<Option<InboundMessage>, QueueError> {
        (**self).peek_lock(timeout).await
    }

    async fn complete(&self, id: MessageId) -> Result<(), QueueError> {
        (**self).complete(id).await
    }

    async fn complete_with_error(
        &self,
        id: MessageId,
        kind: HandlingErrorKind,
        detail: &str,
    ) -> Result<(), QueueError> {
        (**self).complete_with_error(id, kind, detail).await
    }

    async fn abandon(&self, id: MessageId) -> Result<(), QueueError> {
        (**self).abandon(id).await
    }
}
