//! Message batching: fold peek-locked queue messages into per-class batch
//! documents, hand each batch to a reply sink when it is full or when the
//! wait interval elapses, and only then acknowledge the folded messages.

pub mod correlation;
pub mod document;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod worker;

pub use correlation::{BatchId, CorrelationTracker};
pub use document::AggregateDocument;
pub use emitter::{FlushAllReport, FlushReport};
pub use engine::{BatchEngine, Folded, MessageOutcome};
pub use error::BatchError;
pub use scheduler::FlushScheduler;
pub use stats::WorkerStats;
pub use store::{BatchDocument, BatchStore};
pub use worker::{BatchWorker, IterationError, Step, WorkerOptions};
