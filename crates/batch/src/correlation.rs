//! Correlation between inbound messages and the batch that holds them.
//!
//! Keeps the forward map (message → batch) together with an inverse index
//! (batch → messages, in fold order) so resolving a flushed batch never
//! scans unrelated entries.

use std::collections::HashMap;

use indexmap::IndexSet;

use batchpoint_queue::MessageId;

/// Identifier of a batch document.
pub type BatchId = uuid::Uuid;

#[derive(Debug, Default)]
pub struct CorrelationTracker {
    forward: HashMap<MessageId, BatchId>,
    inverse: HashMap<BatchId, IndexSet<MessageId>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `message` was folded into `batch`.
    pub fn record(&mut self, message: MessageId, batch: BatchId) {
        if let Some(previous) = self.forward.insert(message, batch) {
            if previous != batch {
                self.detach(message, previous);
            }
        }
        self.inverse.entry(batch).or_default().insert(message);
    }

    pub fn batch_of(&self, message: &MessageId) -> Option<BatchId> {
        self.forward.get(message).copied()
    }

    /// Messages still waiting on `batch`, in fold order.
    pub fn pending(&self, batch: &BatchId) -> Vec<MessageId> {
        self.inverse
            .get(batch)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, batch: &BatchId) -> usize {
        self.inverse.get(batch).map_or(0, |ids| ids.len())
    }

    /// Drop the entry of a message whose acknowledgment has been resolved.
    pub fn resolve(&mut self, message: &MessageId) -> Option<BatchId> {
        let batch = self.forward.remove(message)?;
        self.detach(*message, batch);
        Some(batch)
    }

    fn detach(&mut self, message: MessageId, batch: BatchId) {
        if let Some(ids) = self.inverse.get_mut(&batch) {
            ids.shift_remove(&message);
            if ids.is_empty() {
                self.inverse.remove(&batch);
            }
        }
    }

    /// Number of open batches with at least one pending message.
    pub fn batch_count(&self) -> usize {
        self.inverse.len()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.inverse.clear();
    }
}
