use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use weft_core::error::{Result, WeftError};

/// One immutable record in the event log.
///
/// Serialized as a single JSON line in a partition segment. Field names are
/// camelCase on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: String,
    /// Global sequence number, monotonic across all partitions.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub producer_id: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub partition: usize,
    /// Position within the partition, monotonic and gap-free.
    pub offset: u64,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    pub checksum: String,
}

fn default_replication_factor() -> u32 {
    1
}

impl EventLogEntry {
    /// SHA-256 hex digest over the canonical fields.
    ///
    /// The canonical form is a JSON object with sorted keys, so the digest is
    /// independent of struct field order.
    pub fn compute_checksum(&self) -> String {
        let canonical = serde_json::json!({
            "id": self.id,
            "sequenceNumber": self.sequence_number,
            "timestamp": self.timestamp,
            "topic": self.topic,
            "eventType": self.event_type,
            "producerId": self.producer_id,
            "data": self.data,
            "metadata": self.metadata,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Recompute the checksum and compare it with the stored one.
    pub fn verify_checksum(&self) -> Result<()> {
        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(WeftError::Integrity {
                id: self.id.clone(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Key used by the index sidecar.
    pub fn index_key(&self) -> String {
        format!("{}:{}", self.topic, self.partition)
    }
}

/// An event that has not been assigned a position yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub topic: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EventDraft {
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            data,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Materialize into a log entry at the given position, computing the checksum.
    pub fn into_entry(
        self,
        producer_id: &str,
        sequence_number: u64,
        partition: usize,
        offset: u64,
        replication_factor: u32,
    ) -> EventLogEntry {
        let mut entry = EventLogEntry {
            id: weft_core::types::new_id(),
            sequence_number,
            timestamp: Utc::now(),
            topic: self.topic,
            event_type: self.event_type,
            producer_id: producer_id.to_string(),
            data: self.data,
            metadata: self.metadata,
            partition,
            offset,
            replication_factor,
            checksum: String::new(),
        };
        entry.checksum = entry.compute_checksum();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventLogEntry {
        EventDraft::new("orders", "created", serde_json::json!({"id": 1}))
            .with_metadata("source", "test")
            .into_entry("producer-a", 7, 2, 3, 1)
    }

    #[test]
    fn test_checksum_verifies_after_json_roundtrip() {
        let entry = sample();
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: EventLogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
        assert!(parsed.verify_checksum().is_ok());
    }

    #[test]
    fn test_tampered_data_fails_verification() {
        let mut entry = sample();
        entry.data = serde_json::json!({"id": 2});
        match entry.verify_checksum() {
            Err(WeftError::Integrity { id, .. }) => assert_eq!(id, entry.id),
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_position_fields_are_not_checksummed() {
        let mut entry = sample();
        entry.offset = 99;
        entry.partition = 0;
        assert!(entry.verify_checksum().is_ok());
    }

    #[test]
    fn test_camel_case_on_disk() {
        let line = serde_json::to_string(&sample()).unwrap();
        assert!(line.contains("\"sequenceNumber\":7"));
        assert!(line.contains("\"eventType\":\"created\""));
        assert!(line.contains("\"producerId\":\"producer-a\""));
        assert_eq!(sample().index_key(), "orders:2");
    }
}
