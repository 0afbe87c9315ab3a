//! Batch emission and acknowledgment resolution.
//!
//! Emitting a class hands its document to the sink and, only if the sink
//! accepted it, completes every message folded into that batch. A message
//! whose completion fails is dead-lettered on its own; its siblings are
//! still completed. When the sink rejects the batch nothing is acknowledged
//! and the class keeps its document, counter and correlation entries.

use tracing::{debug, error, info, warn};

use batchpoint_queue::{HandlingErrorKind, MessageSource, ReplySink};

use crate::correlation::BatchId;
use crate::engine::BatchEngine;
use crate::error::BatchError;

/// Outcome of emitting one class's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub class_id: String,
    pub batch_id: BatchId,
    /// Messages folded into the emitted document.
    pub messages: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
}

/// Outcome of emitting every open batch.
#[derive(Debug, Default)]
pub struct FlushAllReport {
    pub flushed: Vec<FlushReport>,
    /// Hand-off failures; those classes are still open.
    pub failed: Vec<BatchError>,
}

impl FlushAllReport {
    pub fn acknowledged(&self) -> usize {
        self.flushed.iter().map(|r| r.acknowledged).sum()
    }
}

impl BatchEngine {
    /// Emit the batch of one class and resolve its acknowledgments.
    ///
    /// Returns `Ok(None)` when the class has nothing accumulated.
    pub async fn flush_one<S, K>(
        &mut self,
        class_id: &str,
        source: &S,
        sink: &K,
    ) -> Result<Option<FlushReport>, BatchError>
    where
        S: MessageSource + ?Sized,
        K: ReplySink + ?Sized,
    {
        let Some(doc) = self.store.get(class_id) else {
            return Ok(None);
        };
        let batch_id = doc.id;
        let messages = doc.count;
        let outbound = doc.to_outbound(&self.settings);

        if let Err(e) = sink.handle_reply(&outbound).await {
            self.stats.handoff_failures += 1;
            warn!(
                class_id,
                batch_id = %batch_id,
                count = messages,
                error = %e,
                "sink rejected batch"
            );
            return Err(BatchError::HandOff {
                class_id: class_id.to_string(),
                source: e,
            });
        }

        let mut report = FlushReport {
            class_id: class_id.to_string(),
            batch_id,
            messages,
            acknowledged: 0,
            dead_lettered: 0,
        };

        for id in self.tracker.pending(&batch_id) {
            match source.complete(id).await {
                Ok(()) => {
                    report.acknowledged += 1;
                    if self.settings.debug_mode {
                        debug!(message_id = %id, batch_id = %batch_id, "message acknowledged");
                    }
                }
                Err(e) => {
                    report.dead_lettered += 1;
                    warn!(message_id = %id, batch_id = %batch_id, error = %e, "acknowledgment failed");
                    let detail = format!("failed to acknowledge message {id}: {e}");
                    if let Err(e) = source
                        .complete_with_error(id, HandlingErrorKind::AckFailed, &detail)
                        .await
                    {
                        // Lock is left to expire; the message will be redelivered.
                        error!(message_id = %id, error = %e, "could not dead-letter message");
                    }
                }
            }
            self.tracker.resolve(&id);
        }

        self.store.remove(class_id);
        self.stats.batches_emitted += 1;
        self.stats.acknowledged += report.acknowledged as u64;
        self.stats.ack_failures += report.dead_lettered as u64;

        info!(
            class_id,
            batch_id = %batch_id,
            count = messages,
            acknowledged = report.acknowledged,
            dead_lettered = report.dead_lettered,
            "batch emitted"
        );
        Ok(Some(report))
    }

    /// Emit every open batch. Order across classes is not significant.
    ///
    /// A hand-off failure of one class does not stop the others.
    pub async fn flush_all<S, K>(&mut self, source: &S, sink: &K) -> FlushAllReport
    where
        S: MessageSource + ?Sized,
        K: ReplySink + ?Sized,
    {
        let mut report = FlushAllReport::default();
        // Snapshot: messages folded after this point wait for the next flush.
        for class_id in self.store.classes() {
            match self.flush_one(&class_id, source, sink).await {
                Ok(Some(flushed)) => report.flushed.push(flushed),
                Ok(None) => {}
                Err(e) => report.failed.push(e),
            }
        }
        report
    }
}
