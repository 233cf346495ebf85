use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weft_core::error::Result;

use crate::entry::EventLogEntry;

/// File name of the index sidecar inside the log directory.
pub const INDEX_FILE: &str = "event-index.json";

/// Per `topic:partition` summary kept in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub min_offset: u64,
    pub max_offset: u64,
    pub event_count: u64,
    pub size_bytes: u64,
    pub oldest_timestamp: DateTime<Utc>,
    pub newest_timestamp: DateTime<Utc>,
}

/// The `event-index.json` sidecar: `{ "topic:partition": IndexStats }`.
///
/// Advisory only. The segments stay the source of truth, so a missing or
/// corrupt sidecar is replaced by an empty index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIndex {
    entries: BTreeMap<String, IndexStats>,
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one written entry into the summary.
    pub fn record(&mut self, entry: &EventLogEntry, size_bytes: u64) {
        self.entries
            .entry(entry.index_key())
            .and_modify(|s| {
                s.min_offset = s.min_offset.min(entry.offset);
                s.max_offset = s.max_offset.max(entry.offset);
                s.event_count += 1;
                s.size_bytes += size_bytes;
                s.oldest_timestamp = s.oldest_timestamp.min(entry.timestamp);
                s.newest_timestamp = s.newest_timestamp.max(entry.timestamp);
            })
            .or_insert(IndexStats {
                min_offset: entry.offset,
                max_offset: entry.offset,
                event_count: 1,
                size_bytes,
                oldest_timestamp: entry.timestamp,
                newest_timestamp: entry.timestamp,
            });
    }

    pub fn get(&self, topic: &str, partition: usize) -> Option<&IndexStats> {
        self.entries.get(&format!("{}:{}", topic, partition))
    }

    pub fn entries(&self) -> &BTreeMap<String, IndexStats> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry of `partition` and take those of `fresh` instead.
    pub fn replace_partition(&mut self, partition: usize, fresh: EventIndex) {
        let suffix = partition.to_string();
        self.entries
            .retain(|key, _| key.rsplit_once(':').map(|(_, p)| p) != Some(suffix.as_str()));
        self.entries.extend(fresh.entries);
    }

    /// Load the sidecar from `dir`, falling back to an empty index.
    pub async fn load(dir: &Path) -> Self {
        let path = dir.join(INDEX_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(index) => {
                    debug!(path = %path.display(), "Loaded event index");
                    index
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt event index, starting empty");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read event index, starting empty");
                Self::default()
            }
        }
    }

    /// Save the sidecar to `dir` via a temp file and rename.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(INDEX_FILE);
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EventDraft;

    fn entry(topic: &str, offset: u64) -> EventLogEntry {
        EventDraft::new(topic, "t", serde_json::json!(null)).into_entry("p", offset, 1, offset, 1)
    }

    #[test]
    fn test_record_accumulates() {
        let mut index = EventIndex::new();
        index.record(&entry("orders", 0), 100);
        index.record(&entry("orders", 1), 50);
        index.record(&entry("billing", 2), 10);

        let stats = index.get("orders", 1).unwrap();
        assert_eq!(stats.min_offset, 0);
        assert_eq!(stats.max_offset, 1);
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.size_bytes, 150);
        assert!(stats.oldest_timestamp <= stats.newest_timestamp);
        assert_eq!(index.get("billing", 1).unwrap().event_count, 1);
        assert!(index.get("orders", 0).is_none());
    }

    #[test]
    fn test_replace_partition_keeps_other_partitions() {
        let mut index = EventIndex::new();
        index.record(&entry("orders", 0), 10);
        index.record(&entry("orders", 1), 10);
        index.record(&entry("billing", 2), 10);
        let mut other = entry("orders", 7);
        other.partition = 2;
        index.record(&other, 10);

        let mut fresh = EventIndex::new();
        fresh.record(&entry("orders", 1), 10);
        index.replace_partition(1, fresh);

        let stats = index.get("orders", 1).unwrap();
        assert_eq!((stats.min_offset, stats.event_count), (1, 1));
        assert!(index.get("billing", 1).is_none());
        assert_eq!(index.get("orders", 2).unwrap().event_count, 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = EventIndex::new();
        index.record(&entry("orders", 0), 42);
        index.save(dir.path()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(raw.contains("\"orders:1\""));
        assert!(raw.contains("\"eventCount\""));

        let loaded = EventIndex::load(dir.path()).await;
        assert_eq!(loaded, index);
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();
        assert!(EventIndex::load(dir.path()).await.is_empty());
    }
}
