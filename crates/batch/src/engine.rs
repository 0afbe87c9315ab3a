//! Accumulation engine.
//!
//! [`BatchEngine`] owns all mutable batching state: the [`BatchStore`]
//! (documents and pool counters), the [`CorrelationTracker`] and the
//! [`FlushScheduler`]. It is driven by exactly one loop and is never shared,
//! so none of it is locked.
//!
//! Per message the engine either drains a discard marker, folds the message
//! into its class's batch (flushing that class once its pool counter reaches
//! the configured threshold), or dead-letters it when the fold fails.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use batchpoint_core::BatchSettings;
use batchpoint_queue::{InboundMessage, MessageId, MessageSource, ReplySink};

use crate::correlation::{BatchId, CorrelationTracker};
use crate::document::AggregateDocument;
use crate::emitter::{FlushAllReport, FlushReport};
use crate::error::BatchError;
use crate::scheduler::FlushScheduler;
use crate::stats::WorkerStats;
use crate::store::BatchStore;

/// Result of folding one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Folded {
    pub batch_id: BatchId,
    /// Pool counter of the class after this fold.
    pub count: usize,
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Discard marker, completed without touching any batch.
    Discarded(MessageId),
    /// Folded; the class is still below its threshold.
    Folded { class_id: String, folded: Folded },
    /// Folded and the class's batch was emitted right away.
    Emitted(FlushReport),
    /// Could not be folded and was dead-lettered.
    Rejected { id: MessageId, reason: String },
}

pub struct BatchEngine {
    pub(crate) settings: BatchSettings,
    pub(crate) store: BatchStore,
    pub(crate) tracker: CorrelationTracker,
    pub(crate) scheduler: FlushScheduler,
    pub(crate) stats: WorkerStats,
}

impl BatchEngine {
    pub fn new(settings: BatchSettings) -> Self {
        Self::starting_at(settings, Instant::now())
    }

    /// Engine whose flush clock starts at `started`.
    pub fn starting_at(settings: BatchSettings, started: Instant) -> Self {
        let scheduler = FlushScheduler::new(settings.wait_interval(), started);
        Self {
            settings,
            store: BatchStore::new(),
            tracker: CorrelationTracker::new(),
            scheduler,
            stats: WorkerStats::default(),
        }
    }

    /// Drop all accumulated state and restart the flush clock.
    ///
    /// Anything accumulated is lost; its messages were never acknowledged
    /// and will be redelivered by the source.
    pub fn initialize(&mut self, now: Instant) {
        self.store.clear();
        self.tracker.clear();
        self.scheduler.reset(now);
        if self.settings.debug_mode {
            self.settings.log_summary();
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Fold one message into the batch of its class.
    ///
    /// On error nothing has been mutated.
    pub fn fold(&mut self, message: &InboundMessage) -> Result<Folded, BatchError> {
        // A redelivery of a message already in an open batch (its lock ran
        // out) is not folded twice; the first fold is acknowledged on flush.
        if let Some(batch_id) = self.tracker.batch_of(&message.id) {
            warn!(
                message_id = %message.id,
                class_id = %message.class_id,
                batch_id = %batch_id,
                "message redelivered while its batch is open, keeping the first fold"
            );
            return Ok(Folded {
                batch_id,
                count: self.store.pool_count(&message.class_id),
            });
        }

        let fragment = std::str::from_utf8(&message.body).map_err(|source| {
            BatchError::Encoding {
                id: message.id,
                source,
            }
        })?;

        let mut doc = match self.store.get(&message.class_id) {
            Some(open) => AggregateDocument::parse(&open.body)?,
            None => AggregateDocument::new(message.properties.object_type.as_deref()),
        };
        let count = doc.append(fragment)?;
        let body = doc.to_json()?;

        let (batch_id, pool) = self.store.commit_fold(&message.class_id, body, count);
        self.tracker.record(message.id, batch_id);
        self.stats.folded += 1;

        if self.settings.debug_mode {
            debug!(
                message_id = %message.id,
                class_id = %message.class_id,
                batch_id = %batch_id,
                count = pool,
                "message folded"
            );
        }
        Ok(Folded {
            batch_id,
            count: pool,
        })
    }

    /// Whether the class has reached the count threshold.
    pub fn threshold_reached(&self, class_id: &str) -> bool {
        self.store.pool_count(class_id) >= self.settings.messages_per_batch as usize
    }

    /// Process one peek-locked message end to end.
    ///
    /// Errors returned here come from the source or sink; fold failures are
    /// resolved by dead-lettering the message and reported as
    /// [`MessageOutcome::Rejected`].
    pub async fn handle_message<S, K>(
        &mut self,
        message: InboundMessage,
        source: &S,
        sink: &K,
    ) -> Result<MessageOutcome, BatchError>
    where
        S: MessageSource + ?Sized,
        K: ReplySink + ?Sized,
    {
        self.stats.received += 1;

        if message.is_discard() {
            source.complete(message.id).await?;
            self.stats.discarded += 1;
            if self.settings.debug_mode {
                debug!(message_id = %message.id, "discard marker drained");
            }
            return Ok(MessageOutcome::Discarded(message.id));
        }

        let folded = match self.fold(&message) {
            Ok(folded) => folded,
            Err(e) => {
                self.stats.fold_failures += 1;
                let reason = e.to_string();
                error!(
                    message_id = %message.id,
                    class_id = %message.class_id,
                    error = %reason,
                    "message not folded, dead-lettering"
                );
                source
                    .complete_with_error(message.id, e.handling_kind(), &reason)
                    .await?;
                return Ok(MessageOutcome::Rejected {
                    id: message.id,
                    reason,
                });
            }
        };

        if self.threshold_reached(&message.class_id) {
            if let Some(report) = self.flush_one(&message.class_id, source, sink).await? {
                return Ok(MessageOutcome::Emitted(report));
            }
        }

        Ok(MessageOutcome::Folded {
            class_id: message.class_id,
            folded,
        })
    }

    /// Flush everything if the wait interval has elapsed at `now`.
    ///
    /// The clock restarts even when some hand-offs failed; those classes
    /// keep their state and are retried on the next trigger.
    pub async fn flush_if_due<S, K>(
        &mut self,
        now: Instant,
        source: &S,
        sink: &K,
    ) -> Option<FlushAllReport>
    where
        S: MessageSource + ?Sized,
        K: ReplySink + ?Sized,
    {
        if !self.scheduler.is_due_at(now) {
            return None;
        }
        let report = self.flush_all(source, sink).await;
        self.scheduler.reset(now);
        self.stats.time_flushes += 1;

        if !report.flushed.is_empty() || !report.failed.is_empty() {
            info!(
                batches = report.flushed.len(),
                failed = report.failed.len(),
                "time-triggered flush"
            );
        }
        for e in &report.failed {
            warn!(error = %e, "batch kept for retry");
        }
        Some(report)
    }

    /// Check that every open batch agrees with its counter and correlation entries.
    pub fn is_consistent(&self) -> bool {
        let mut open_entries = 0;
        for class_id in self.store.classes() {
            let Some(doc) = self.store.get(&class_id) else {
                return false;
            };
            let pending = self.tracker.pending_count(&doc.id);
            if doc.count != self.store.pool_count(&class_id) || doc.count != pending {
                return false;
            }
            match AggregateDocument::parse(&doc.body).and_then(|d| d.message_count()) {
                Ok(n) if n == doc.count => {}
                _ => return false,
            }
            open_entries += pending;
        }
        open_entries == self.tracker.len()
    }
}
