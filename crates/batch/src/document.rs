//! Aggregated batch document.
//!
//! Layout of a serialized document:
//!
//! ```json
//! {
//!   "classData": {
//!     "objectType": "Invoice",
//!     "messageCount": "2",
//!     "messages": [
//!       { "row": { "message": "<body of first message>" } },
//!       { "row": { "message": "<body of second message>" } }
//!     ]
//!   }
//! }
//! ```
//!
//! `objectType` is copied from the first folded message (empty if it had
//! none) and `messageCount` is a string-encoded integer. Documents are
//! stored serialized between folds, so every fold parses the stored text,
//! appends one row and re-serializes; prior rows are preserved as-is.
//!
//! The aggregate is JSON. Receivers that parse the XML form of this batch
//! (same `classData`/`row` nesting, localized element names for object
//! type, message count, messages and message) must be switched to read
//! these JSON keys before they can consume batches from this worker.

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDocument {
    #[serde(rename = "classData")]
    class_data: ClassData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ClassData {
    #[serde(rename = "objectType")]
    object_type: String,
    #[serde(rename = "messageCount")]
    message_count: String,
    messages: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Row {
    row: Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Fragment {
    message: String,
}

impl AggregateDocument {
    /// Empty document with the given object-type header.
    pub fn new(object_type: Option<&str>) -> Self {
        Self {
            class_data: ClassData {
                object_type: object_type.unwrap_or_default().to_string(),
                message_count: "0".to_string(),
                messages: Vec::new(),
            },
        }
    }

    /// Parse a stored document, rejecting one whose count disagrees with its rows.
    pub fn parse(text: &str) -> Result<Self, BatchError> {
        let doc: Self = serde_json::from_str(text)?;
        let count = doc.message_count()?;
        if count != doc.class_data.messages.len() {
            return Err(BatchError::Document(format!(
                "messageCount is {count} but document holds {} messages",
                doc.class_data.messages.len()
            )));
        }
        Ok(doc)
    }

    /// Append one message body and bump the count. Returns the new count.
    pub fn append(&mut self, body: &str) -> Result<usize, BatchError> {
        let count = self.message_count()? + 1;
        self.class_data.messages.push(Row {
            row: Fragment {
                message: body.to_string(),
            },
        });
        self.class_data.message_count = count.to_string();
        Ok(count)
    }

    pub fn message_count(&self) -> Result<usize, BatchError> {
        self.class_data.message_count.parse().map_err(|_| {
            BatchError::Document(format!(
                "messageCount '{}' is not an integer",
                self.class_data.message_count
            ))
        })
    }

    pub fn object_type(&self) -> &str {
        &self.class_data.object_type
    }

    /// Message bodies in fold order.
    pub fn fragments(&self) -> impl Iterator<Item = &str> {
        self.class_data.messages.iter().map(|r| r.row.message.as_str())
    }

    pub fn to_json(&self) -> Result<String, BatchError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_is_empty() {
        let doc = AggregateDocument::new(None);
        assert_eq!(doc.message_count().unwrap(), 0);
        assert_eq!(doc.object_type(), "");
        assert_eq!(doc.fragments().count(), 0);
    }

    #[test]
    fn append_grows_count_and_keeps_order() {
        let mut doc = AggregateDocument::new(Some("Invoice"));
        assert_eq!(doc.append("first").unwrap(), 1);
        assert_eq!(doc.append("second").unwrap(), 2);

        let fragments: Vec<_> = doc.fragments().collect();
        assert_eq!(fragments, vec!["first", "second"]);
        assert_eq!(doc.object_type(), "Invoice");
    }

    #[test]
    fn serialized_layout() {
        let mut doc = AggregateDocument::new(Some("Invoice"));
        doc.append(r#"{"n":1}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_eq!(value["classData"]["objectType"], "Invoice");
        assert_eq!(value["classData"]["messageCount"], "1");
        assert_eq!(value["classData"]["messages"][0]["row"]["message"], r#"{"n":1}"#);
    }

    #[test]
    fn reparse_then_append_preserves_prior_rows() {
        let mut doc = AggregateDocument::new(None);
        doc.append("a").unwrap();
        doc.append("b").unwrap();
        let stored = doc.to_json().unwrap();

        let mut reloaded = AggregateDocument::parse(&stored).unwrap();
        assert_eq!(reloaded, doc);
        assert_eq!(reloaded.append("c").unwrap(), 3);

        let fragments: Vec<_> = reloaded.fragments().collect();
        assert_eq!(fragments, vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = AggregateDocument::parse("<classData/>").unwrap_err();
        assert!(matches!(err, BatchError::Document(_)));
    }

    #[test]
    fn parse_rejects_non_numeric_count() {
        let text = r#"{"classData":{"objectType":"","messageCount":"many","messages":[]}}"#;
        let err = AggregateDocument::parse(text).unwrap_err();
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn parse_rejects_count_mismatch() {
        let text = r#"{"classData":{"objectType":"","messageCount":"2","messages":[{"row":{"message":"x"}}]}}"#;
        let err = AggregateDocument::parse(text).unwrap_err();
        assert!(err.to_string().contains("holds 1 messages"));
    }
}
