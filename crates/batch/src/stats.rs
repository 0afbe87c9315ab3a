use serde::Serialize;

/// Counters of one engine instance since it was initialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub folded: u64,
    pub discarded: u64,
    pub fold_failures: u64,
    pub batches_emitted: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
    pub handoff_failures: u64,
    pub time_flushes: u64,
}

impl WorkerStats {
    pub fn log_summary(&self) {
        tracing::info!(
            received = self.received,
            folded = self.folded,
            discarded = self.discarded,
            fold_failures = self.fold_failures,
            batches_emitted = self.batches_emitted,
            acknowledged = self.acknowledged,
            ack_failures = self.ack_failures,
            handoff_failures = self.handoff_failures,
            time_flushes = self.time_flushes,
            "batch worker stats"
        );
    }
}
