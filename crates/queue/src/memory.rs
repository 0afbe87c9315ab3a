//! In-process queue and sink.
//!
//! [`MemoryQueue`] implements the full peek-lock protocol over in-memory
//! collections and [`MemorySink`] records every batch it accepts. Both can
//! be told to fail on purpose, which makes them the backends of choice for
//! local runs and for exercising the engine's failure paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::QueueError;
use crate::message::{InboundMessage, MessageId, OutboundMessage};
use crate::sink::ReplySink;
use crate::source::{HandlingErrorKind, MessageSource};

/// A message acknowledged as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: MessageId,
    pub kind: HandlingErrorKind,
    pub detail: String,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<InboundMessage>,
    locked: HashMap<MessageId, InboundMessage>,
    completed: Vec<MessageId>,
    dead_lettered: Vec<DeadLetter>,
    failing_completions: HashSet<MessageId>,
    closed: bool,
}

/// In-memory peek-lock queue.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message and wake a waiting `peek_lock`.
    pub async fn push(&self, message: InboundMessage) {
        self.state.lock().await.visible.push_back(message);
        self.arrivals.notify_one();
    }

    /// Make every subsequent `complete` of `id` fail with [`QueueError::Ack`].
    pub async fn fail_completion_of(&self, id: MessageId) {
        self.state.lock().await.failing_completions.insert(id);
    }

    /// Close the queue: `peek_lock` returns [`QueueError::Closed`] from now on.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.arrivals.notify_one();
    }

    /// Ids completed successfully, in completion order.
    pub async fn completed(&self) -> Vec<MessageId> {
        self.state.lock().await.completed.clone()
    }

    pub async fn dead_lettered(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_lettered.clone()
    }

    pub async fn visible_len(&self) -> usize {
        self.state.lock().await.visible.len()
    }

    pub async fn locked_len(&self) -> usize {
        self.state.lock().await.locked.len()
    }

    async fn try_take(&self) -> Result<Option<InboundMessage>, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let Some(message) = state.visible.pop_front() else {
            return Ok(None);
        };
        state.locked.insert(message.id, message.clone());
        Ok(Some(message))
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn peek_lock(&self, timeout: Duration) -> Result<Option<InboundMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_take().await? {
                return Ok(Some(message));
            }
            // A wake-up may be stale (a permit left by an earlier push), so
            // keep waiting until the deadline.
            if tokio::time::timeout_at(deadline, self.arrivals.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, id: MessageId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.failing_completions.contains(&id) {
            return Err(QueueError::Ack(format!("completion of {id} refused")));
        }
        if state.locked.remove(&id).is_none() {
            return Err(QueueError::Ack(format!("message {id} is not locked")));
        }
        state.completed.push(id);
        debug!(message_id = %id, "memory queue: completed");
        Ok(())
    }

    async fn complete_with_error(
        &self,
        id: MessageId,
        kind: HandlingErrorKind,
        detail: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.locked.remove(&id).is_none() {
            return Err(QueueError::Ack(format!("message {id} is not locked")));
        }
        state.dead_lettered.push(DeadLetter {
            id,
            kind,
            detail: detail.to_string(),
        });
        debug!(message_id = %id, %kind, "memory queue: dead-lettered");
        Ok(())
    }

    async fn abandon(&self, id: MessageId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let message = state
            .locked
            .remove(&id)
            .ok_or_else(|| QueueError::Ack(format!("message {id} is not locked")))?;
        state.visible.push_front(message);
        drop(state);
        self.arrivals.notify_one();
        Ok(())
    }
}

/// Sink that records accepted batches.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<OutboundMessage>>,
    rejections_left: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` hand-offs with [`QueueError::Rejected`].
    pub async fn reject_next(&self, n: usize) {
        *self.rejections_left.lock().await = n;
    }

    /// Batches accepted so far, in hand-off order.
    pub async fn batches(&self) -> Vec<OutboundMessage> {
        self.batches.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.batches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batches.lock().await.is_empty()
    }
}

#[async_trait]
impl ReplySink for MemorySink {
    async fn handle_reply(&self, batch: &OutboundMessage) -> Result<(), QueueError> {
        {
            let mut left = self.rejections_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err(QueueError::Rejected(format!("batch {} refused", batch.id)));
            }
        }
        self.batches.lock().await.push(batch.clone());
        Ok(())
    }
}
