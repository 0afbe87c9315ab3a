//! Per-class batch documents and their pool counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use batchpoint_core::BatchSettings;
use batchpoint_queue::OutboundMessage;

use crate::correlation::BatchId;

/// The batch currently accumulating messages of one class.
#[derive(Debug, Clone)]
pub struct BatchDocument {
    pub id: BatchId,
    pub class_id: String,
    /// Serialized [`AggregateDocument`](crate::document::AggregateDocument).
    pub body: String,
    /// Messages folded so far; equals the document's `messageCount`.
    pub count: usize,
    pub created_at: DateTime<Utc>,
}

impl BatchDocument {
    fn open(class_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            class_id: class_id.to_string(),
            body: String::new(),
            count: 0,
            created_at: Utc::now(),
        }
    }

    /// Wrap the document as the outbound message handed to the sink.
    pub fn to_outbound(&self, settings: &BatchSettings) -> OutboundMessage {
        OutboundMessage {
            id: self.id,
            class_id: settings.class_id.clone(),
            message_type: settings.message_type.clone(),
            body: self.body.clone(),
            batch_class: self.class_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// Batch documents keyed by class, plus the pool counter of each class.
///
/// A class is present in both maps or in neither.
#[derive(Debug, Default)]
pub struct BatchStore {
    documents: HashMap<String, BatchDocument>,
    pool: HashMap<String, usize>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class_id: &str) -> Option<&BatchDocument> {
        self.documents.get(class_id)
    }

    #[cfg(test)]
    pub(crate) fn document_mut(&mut self, class_id: &str) -> Option<&mut BatchDocument> {
        self.documents.get_mut(class_id)
    }

    /// Id the next fold into `class_id` will use, if a batch is open.
    pub fn batch_id(&self, class_id: &str) -> Option<BatchId> {
        self.documents.get(class_id).map(|d| d.id)
    }

    /// Pool counter of a class (0 when nothing is accumulated).
    pub fn pool_count(&self, class_id: &str) -> usize {
        self.pool.get(class_id).copied().unwrap_or(0)
    }

    /// Store the result of one fold: the new serialized body and count.
    ///
    /// Opens a batch with a fresh id when the class has none. Returns the
    /// batch id and the updated pool counter.
    pub fn commit_fold(&mut self, class_id: &str, body: String, count: usize) -> (BatchId, usize) {
        let doc = self
            .documents
            .entry(class_id.to_string())
            .or_insert_with(|| BatchDocument::open(class_id));
        doc.body = body;
        doc.count = count;
        let id = doc.id;

        let pool = self.pool.entry(class_id.to_string()).or_insert(0);
        *pool += 1;
        debug_assert_eq!(*pool, count, "pool counter out of sync for class {class_id}");
        (id, *pool)
    }

    /// Drop a class's batch and pool counter.
    pub fn remove(&mut self, class_id: &str) -> Option<BatchDocument> {
        self.pool.remove(class_id);
        self.documents.remove(class_id)
    }

    /// Classes with an open batch, sorted for stable iteration.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.documents.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Drop every batch and counter at once.
    pub fn clear(&mut self) {
        self.documents.clear();
        self.pool.clear();
    }
}
