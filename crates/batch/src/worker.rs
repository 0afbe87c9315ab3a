//! The polling loop that drives a [`BatchEngine`].
//!
//! Each iteration, strictly in this order:
//! 1. stop if shutdown was requested,
//! 2. flush everything if the wait interval elapsed,
//! 3. peek-lock one message (bounded wait) and hand it to the engine,
//! 4. sleep the idle delay, or back off after a transient error.
//!
//! All engine state is touched from this loop only. Transient errors are
//! logged and retried with exponential backoff; fatal ones (the source is
//! gone for good) end the loop.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use batchpoint_core::WorkerConfig;
use batchpoint_queue::{MessageId, MessageSource, ReplySink};

use crate::emitter::FlushReport;
use crate::engine::{BatchEngine, Folded, MessageOutcome};
use crate::error::BatchError;
use crate::stats::WorkerStats;

/// Default wait for one peek-lock call.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default self-throttle between iterations.
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(10);

/// Cap of the transient-error backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Loop timing.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub peek_timeout: Duration,
    pub idle_delay: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            idle_delay: DEFAULT_IDLE_DELAY,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            peek_timeout: config.peek_timeout(),
            idle_delay: config.idle_delay(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// What one successful iteration did.
#[derive(Debug)]
pub enum Step {
    /// Shutdown was requested; nothing was done.
    Stopped,
    /// No message arrived within the peek timeout.
    Idle,
    Discarded(MessageId),
    Folded { class_id: String, folded: Folded },
    Emitted(FlushReport),
    Rejected(MessageId),
    /// Shutdown arrived while a message was locked; it was released.
    Abandoned(MessageId),
}

/// Why an iteration failed.
#[derive(Debug, Error)]
pub enum IterationError {
    /// Worth retrying on the next iteration.
    #[error("transient: {0}")]
    Transient(#[source] BatchError),

    /// The loop cannot continue.
    #[error("fatal: {0}")]
    Fatal(#[source] BatchError),
}

impl From<BatchError> for IterationError {
    fn from(e: BatchError) -> Self {
        if e.is_fatal() {
            IterationError::Fatal(e)
        } else {
            IterationError::Transient(e)
        }
    }
}

/// Exponential backoff over consecutive transient failures.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            max,
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

pub struct BatchWorker<S, K> {
    engine: BatchEngine,
    source: S,
    sink: K,
    options: WorkerOptions,
    backoff: Backoff,
}

impl<S, K> BatchWorker<S, K>
where
    S: MessageSource,
    K: ReplySink,
{
    pub fn new(engine: BatchEngine, source: S, sink: K, options: WorkerOptions) -> Self {
        let backoff = Backoff::new(options.idle_delay, options.backoff_max);
        Self {
            engine,
            source,
            sink,
            options,
            backoff,
        }
    }

    pub fn engine(&self) -> &BatchEngine {
        &self.engine
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn stats(&self) -> &WorkerStats {
        self.engine.stats()
    }

    /// Run one iteration of the loop.
    pub async fn step(&mut self, shutdown: &watch::Receiver<bool>) -> Result<Step, IterationError> {
        if stop_requested(shutdown) {
            return Ok(Step::Stopped);
        }

        if let Some(report) = self
            .engine
            .flush_if_due(Instant::now(), &self.source, &self.sink)
            .await
        {
            debug!(
                batches = report.flushed.len(),
                acknowledged = report.acknowledged(),
                kept_for_retry = report.failed.len(),
                "time flush finished"
            );
        }

        let message = match self.source.peek_lock(self.options.peek_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(Step::Idle),
            Err(e) => return Err(BatchError::Queue(e).into()),
        };

        if stop_requested(shutdown) {
            let id = message.id;
            self.source.abandon(id).await.map_err(BatchError::Queue)?;
            info!(message_id = %id, "shutdown requested, message released");
            return Ok(Step::Abandoned(id));
        }

        let step = match self
            .engine
            .handle_message(message, &self.source, &self.sink)
            .await?
        {
            MessageOutcome::Discarded(id) => Step::Discarded(id),
            MessageOutcome::Folded { class_id, folded } => Step::Folded { class_id, folded },
            MessageOutcome::Emitted(report) => Step::Emitted(report),
            MessageOutcome::Rejected { id, .. } => Step::Rejected(id),
        };
        Ok(step)
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    ///
    /// Whatever is still accumulated when the loop ends is dropped; those
    /// messages were never completed and stay in the source.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BatchError> {
        self.engine.initialize(Instant::now());
        info!(
            messages_per_batch = self.engine.settings().messages_per_batch,
            wait_minutes = self.engine.settings().wait_minutes,
            "batch worker started"
        );

        loop {
            let delay = match self.step(&shutdown).await {
                Ok(Step::Stopped) | Ok(Step::Abandoned(_)) => break,
                Ok(_) => {
                    self.backoff.reset();
                    self.options.idle_delay
                }
                Err(IterationError::Transient(e)) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "iteration failed");
                    delay
                }
                Err(IterationError::Fatal(e)) => {
                    error!(error = %e, "batch worker stopping on fatal error");
                    self.finish();
                    return Err(e);
                }
            };
            pause(delay, &mut shutdown).await;
        }

        self.finish();
        Ok(())
    }

    fn finish(&self) {
        let open = self.engine.store().len();
        if open > 0 {
            warn!(
                open_batches = open,
                pending_messages = self.engine.tracker().len(),
                "dropping unflushed batches; their messages stay locked in the source"
            );
        }
        self.engine.stats().log_summary();
        info!("batch worker stopped");
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay`, waking early when the shutdown flag flips.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown.changed() => {
            // Sender gone: nobody can request shutdown any more, keep pacing.
            if changed.is_err() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
