use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::message::OutboundMessage;

/// Downstream receiver of emitted batches.
///
/// An `Err` means the batch was not accepted; the caller keeps the batch
/// and all of its pending acknowledgments for a later attempt.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn handle_reply(&self, batch: &OutboundMessage) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: ReplySink + ?Sized> ReplySink for Arc<T> {
    async fn handle_reply(&self, batch: &OutboundMessage) -> Result<(), QueueError> {
        (**self).handle_reply(batch).await
    }
}
