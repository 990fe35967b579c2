//! Change-event payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change notification posted by the origin when a record mutates.
///
/// Every field is optional on the wire; absent fields deserialize to
/// their empty value so a sparse notification still dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Mutation kind, e.g. `"create"`, `"update"`, `"delete"`.
    #[serde(default)]
    pub event: String,
    /// Opaque mutation payload, forwarded to observers untouched.
    #[serde(default)]
    pub payload: Value,
    /// Primary key of the mutated record.
    #[serde(default)]
    pub key: String,
    /// Collection the mutated record belongs to.
    #[serde(default)]
    pub collection: String,
}

impl ChangeEvent {
    /// Coalescing identity for the debounce window. Two events with the
    /// same identity collapse to one dispatch, keeping the later event.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.collection, self.event, self.key)
    }
}
