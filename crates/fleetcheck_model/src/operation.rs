//! Pending offline operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key holding a human-readable label for logs.
const DISPLAY_NAME_KEY: &str = "name";

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// Upload a driver record.
    RecordUpsert,
    /// Delete a driver record's remote folder.
    RecordDelete,
    /// Upload a checklist definition.
    ChecklistUpsert,
}

impl OperationKind {
    /// Stable label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::RecordUpsert => "record_upsert",
            OperationKind::RecordDelete => "record_delete",
            OperationKind::ChecklistUpsert => "checklist_upsert",
        }
    }
}

/// A mutation that failed to reach the remote store and waits for replay.
///
/// The payload is opaque to the queue: a serialized record for
/// [`OperationKind::RecordUpsert`], a serialized checklist for
/// [`OperationKind::ChecklistUpsert`], the record id bytes for
/// [`OperationKind::RecordDelete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Queue item id.
    pub id: Uuid,
    /// What to replay.
    pub kind: OperationKind,
    /// Serialized operation input.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// When the operation was queued.
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PendingOperation {
    /// Creates a fresh operation with no retries.
    pub fn new(kind: OperationKind, payload: Vec<u8>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            metadata,
        }
    }

    /// Builds the metadata map carrying a display name.
    pub fn named(name: impl Into<String>) -> BTreeMap<String, String> {
        BTreeMap::from([(DISPLAY_NAME_KEY.to_string(), name.into())])
    }

    /// Human-readable label: the `name` metadata entry, or the id.
    pub fn display_name(&self) -> String {
        self.metadata
            .get(DISPLAY_NAME_KEY)
            .cloned()
            .unwrap_or_else(|| self.id.to_string())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("base64 decode error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_id() {
        let op = PendingOperation::new(OperationKind::RecordDelete, vec![1, 2], BTreeMap::new());
        assert_eq!(op.display_name(), op.id.to_string());

        let named = PendingOperation::new(
            OperationKind::RecordUpsert,
            vec![],
            PendingOperation::named("Ada"),
        );
        assert_eq!(named.display_name(), "Ada");
        assert_eq!(named.retry_count, 0);
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let op = PendingOperation::new(
            OperationKind::ChecklistUpsert,
            b"{\"title\":\"x\"}".to_vec(),
            BTreeMap::new(),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "checklistUpsert");
        assert_eq!(json["payload"], "eyJ0aXRsZSI6IngifQ==");
        assert_eq!(json["retryCount"], 0);

        let back: PendingOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "kind": "recordDelete",
            "payload": "",
            "createdAt": "2024-05-01T08:30:00Z",
        });
        let op: PendingOperation = serde_json::from_value(json).unwrap();
        assert_eq!(op.retry_count, 0);
        assert!(op.metadata.is_empty());
        assert_eq!(op.kind.as_str(), "record_delete");
    }
}
