//! Inbound and outbound message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a message, unique per message instance.
pub type MessageId = Uuid;

/// Type tag of control messages that are drained without being batched.
pub const DISCARD_MESSAGE_TYPE: &str = "blackhole";

/// Optional typed properties a message may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Object type of the source record; copied into the batch header.
    pub object_type: Option<String>,
}

/// A message peek-locked from the source queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    /// Grouping key: messages with the same class end up in the same batch.
    pub class_id: String,
    pub message_type: String,
    /// Opaque payload. Must be UTF-8 to be folded into a batch.
    pub body: Vec<u8>,
    #[serde(default)]
    pub properties: MessageProperties,
}

impl InboundMessage {
    /// Create a message with a fresh id.
    pub fn new(
        class_id: impl Into<String>,
        message_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            class_id: class_id.into(),
            message_type: message_type.into(),
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_object_type(mut self, object_type: impl Into<String>) -> Self {
        self.properties.object_type = Some(object_type.into());
        self
    }

    /// Whether this is a discard marker that bypasses batching.
    pub fn is_discard(&self) -> bool {
        self.message_type == DISCARD_MESSAGE_TYPE
    }
}

/// A batch handed to the reply sink as one outbound unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Batch id, generated when the batch was opened.
    pub id: MessageId,
    /// Configured class id of emitted batches.
    pub class_id: String,
    /// Configured type tag of emitted batches.
    pub message_type: String,
    /// Serialized aggregated document.
    pub body: String,
    /// Class of the inbound messages folded into this batch.
    pub batch_class: String,
    pub created_at: DateTime<Utc>,
}
