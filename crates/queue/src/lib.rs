pub mod error;
pub mod memory;
pub mod message;
pub mod sink;
pub mod source;
pub mod sqs;

pub use error::QueueError;
pub use memory::{DeadLetter, MemoryQueue, MemorySink};
pub use message::{
    InboundMessage, MessageId, MessageProperties, OutboundMessage, DISCARD_MESSAGE_TYPE,
};
pub use sink::ReplySink;
pub use source::{HandlingErrorKind, MessageSource};
pub use sqs::{SqsMessageSource, SqsReplySink};
