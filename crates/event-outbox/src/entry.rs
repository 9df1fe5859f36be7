//! Queue entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque event payload carried by the queue.
pub type Payload = serde_json::Value;

/// Identifier assigned to an entry at enqueue time.
///
/// Ids are random v4 UUIDs and are never reused; they are the only handle
/// accepted by [`DurableQueue::remove_by_ids`](crate::DurableQueue::remove_by_ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single record held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Instant after which any queue instance may reclaim this entry from
    /// durable storage.
    #[serde(rename = "flush_after", with = "chrono::serde::ts_milliseconds")]
    pub flush_eligible_at: DateTime<Utc>,
    /// Event payload.
    pub payload: Payload,
    /// Payload has already been through the transform hook and was written
    /// back by an unloading flush.
    #[serde(default, skip_serializing_if = "is_false")]
    pub transformed: bool,
    /// Entry was reclaimed from durable storage rather than the in-memory
    /// mirror. Never persisted.
    #[serde(skip)]
    pub orphaned: bool,
}

impl QueueEntry {
    /// Create a new entry eligible for orphan reclaim at `flush_eligible_at`.
    pub fn new(payload: Payload, flush_eligible_at: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::generate(),
            flush_eligible_at,
            payload,
            transformed: false,
            orphaned: false,
        }
    }

    /// Whether the transform hook must run before this entry is sent.
    pub fn needs_transform(&self) -> bool {
        !self.orphaned && !self.transformed
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn generated_ids_are_distinct() {
        let ids: std::collections::HashSet<EntryId> =
            (0..1000).map(|_| EntryId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn serialized_form_uses_epoch_millis_and_omits_transient_flags() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut entry = QueueEntry::new(json!({"event": "click"}), at);
        entry.id = EntryId::from_string("entry-1");
        entry.orphaned = true;

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "entry-1",
                "flush_after": 1_700_000_000_123i64,
                "payload": {"event": "click"}
            })
        );
    }

    #[test]
    fn deserialized_entries_are_never_orphaned() {
        let entry: QueueEntry = serde_json::from_value(json!({
            "id": "entry-1",
            "flush_after": 10,
            "payload": 42,
            "transformed": true
        }))
        .unwrap();

        assert!(!entry.orphaned);
        assert!(entry.transformed);
        assert!(!entry.needs_transform());
    }

    #[test]
    fn entry_without_id_does_not_decode() {
        let result: Result<QueueEntry, _> =
            serde_json::from_value(json!({"flush_after": 10, "payload": 1}));
        assert!(result.is_err());
    }
}
