use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use weft_core::config::EventLogConfig;
use weft_core::error::{Result, WeftError};

use crate::entry::EventLogEntry;
use crate::index::EventIndex;
use crate::segment::{self, SegmentFile};

/// Partitioned, append-only, newline-delimited JSON event log.
///
/// Each partition is a directory of numbered segment files. Writes go to the
/// partition's active segment and rotate when it would exceed
/// `max_segment_bytes`. Entries are never rewritten; segments are only
/// removed whole by the retention sweep.
pub struct EventLog {
    base: PathBuf,
    config: EventLogConfig,
    writers: Vec<tokio::sync::Mutex<PartitionWriter>>,
    index: Mutex<EventIndex>,
}

/// Single writer state for one partition.
#[derive(Debug)]
struct PartitionWriter {
    dir: PathBuf,
    segment: u64,
    size: u64,
}

impl PartitionWriter {
    fn segment_path(&self, compressed: bool) -> PathBuf {
        self.dir.join(segment::segment_name(self.segment, compressed))
    }
}

/// Where a batch landed, so it can be undone.
#[derive(Debug, Clone)]
pub struct WriteMark {
    pub partition: usize,
    pub path: PathBuf,
    /// Length of `path` before the batch was appended.
    pub previous_len: u64,
    /// The batch opened a fresh segment.
    pub rotated: bool,
    previous_segment: u64,
    previous_size: u64,
}

/// Positions found by a full scan of the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveredPositions {
    /// Latest offset per partition, `None` for an empty partition.
    pub latest_offsets: Vec<Option<u64>>,
    /// Highest global sequence number across all partitions.
    pub max_sequence: Option<u64>,
}

impl EventLog {
    /// Open (or create) the log under `config.dir`.
    pub async fn open(config: EventLogConfig) -> Result<Self> {
        if config.partitions == 0 {
            return Err(WeftError::Config("log.partitions must be at least 1".into()));
        }
        let base = config.dir_path();
        tokio::fs::create_dir_all(&base).await?;

        let mut writers = Vec::with_capacity(config.partitions);
        for partition in 0..config.partitions {
            let dir = segment::partition_dir(&base, partition);
            tokio::fs::create_dir_all(&dir).await?;

            let segments = segment::list_segments(&dir).await?;
            let (segment, size) = match segments.last() {
                None => (0, 0),
                Some(last) if last.compressed != config.compression => (last.number + 1, 0),
                Some(last) => (last.number, tokio::fs::metadata(&last.path).await?.len()),
            };
            debug!(partition, segment, size, "Partition writer ready");
            writers.push(tokio::sync::Mutex::new(PartitionWriter { dir, segment, size }));
        }

        let index = EventIndex::load(&base).await;
        info!(dir = %base.display(), partitions = config.partitions, "Event log opened");

        Ok(Self {
            base,
            config,
            writers,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.base
    }

    pub fn partitions(&self) -> usize {
        self.writers.len()
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Append a single entry to its partition.
    pub async fn write_event(&self, entry: &EventLogEntry) -> Result<WriteMark> {
        self.write_batch(entry.partition, std::slice::from_ref(entry)).await
    }

    /// Append a batch to one partition and fold it into the index.
    pub async fn write_batch(&self, partition: usize, entries: &[EventLogEntry]) -> Result<WriteMark> {
        let mark = self.append_batch(partition, entries).await?;
        self.record_batch(entries);
        Ok(mark)
    }

    /// Append a batch without touching the index.
    ///
    /// Used by transactional commits, which record the index only once every
    /// partition write succeeded.
    pub async fn append_batch(&self, partition: usize, entries: &[EventLogEntry]) -> Result<WriteMark> {
        let writer = self.writers.get(partition).ok_or_else(|| {
            WeftError::Validation(format!("partition {} out of range", partition))
        })?;

        let mut lines = String::new();
        for entry in entries {
            if entry.partition != partition {
                return Err(WeftError::Validation(format!(
                    "entry {} belongs to partition {}, not {}",
                    entry.id, entry.partition, partition
                )));
            }
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }
        let bytes = segment::encode_batch(&lines, self.config.compression)?;

        let mut w = writer.lock().await;
        let previous_segment = w.segment;
        let previous_size = w.size;

        let rotated = w.size > 0 && w.size + bytes.len() as u64 > self.config.max_segment_bytes;
        if rotated {
            w.segment += 1;
            w.size = 0;
            info!(partition, segment = w.segment, "Rotating to new segment");
        }

        let path = w.segment_path(self.config.compression);
        let previous_len = w.size;

        if let Err(e) = self.append_bytes(&path, &bytes).await {
            // Undo a partially written batch so a retry can't duplicate lines.
            discard_tail(&path, previous_len, rotated).await;
            w.segment = previous_segment;
            w.size = previous_size;
            return Err(e);
        }
        w.size += bytes.len() as u64;

        debug!(partition, count = entries.len(), bytes = bytes.len(), "Batch appended");
        Ok(WriteMark {
            partition,
            path,
            previous_len,
            rotated,
            previous_segment,
            previous_size,
        })
    }

    async fn append_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        if self.config.fsync {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Fold successfully written entries into the index.
    pub fn record_batch(&self, entries: &[EventLogEntry]) {
        let mut index = match self.index.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in entries {
            let size = serde_json::to_string(entry).map(|s| s.len() as u64 + 1).unwrap_or(0);
            index.record(entry, size);
        }
    }

    /// Undo an appended batch: truncate the segment back, or remove the
    /// segment the batch rotated into.
    pub async fn rollback(&self, mark: &WriteMark) -> Result<()> {
        let writer = self.writers.get(mark.partition).ok_or_else(|| {
            WeftError::Validation(format!("partition {} out of range", mark.partition))
        })?;
        let mut w = writer.lock().await;

        if mark.rotated {
            tokio::fs::remove_file(&mark.path).await?;
        } else {
            let file = tokio::fs::OpenOptions::new().write(true).open(&mark.path).await?;
            file.set_len(mark.previous_len).await?;
            if self.config.fsync {
                file.sync_data().await?;
            }
        }
        w.segment = mark.previous_segment;
        w.size = mark.previous_size;
        warn!(partition = mark.partition, path = %mark.path.display(), "Rolled back batch");
        Ok(())
    }

    /// Lazily read entries with `start_offset <= offset <= end_offset`.
    ///
    /// Scans partitions in order (or only `partition`), each partition's
    /// segments in filename order, decoding one segment at a time. Malformed
    /// lines are skipped with a warning. The stream can be re-created at any
    /// time to restart from an arbitrary offset.
    pub fn read_events(
        &self,
        start_offset: u64,
        end_offset: Option<u64>,
        partition: Option<usize>,
    ) -> BoxStream<'static, Result<EventLogEntry>> {
        self.scan(start_offset, end_offset, partition, self.config.verify_checksums)
    }

    fn scan(
        &self,
        start_offset: u64,
        end_offset: Option<u64>,
        partition: Option<usize>,
        verify: bool,
    ) -> BoxStream<'static, Result<EventLogEntry>> {
        let partitions: VecDeque<usize> = match partition {
            Some(p) => VecDeque::from([p]),
            None => (0..self.partitions()).collect(),
        };
        let state = ScanState {
            base: self.base.clone(),
            partitions,
            segments: VecDeque::new(),
            buffered: VecDeque::new(),
            start_offset,
            end_offset,
            verify,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.buffered.pop_front() {
                    return Some((item, state));
                }
                if let Some(seg) = state.segments.pop_front() {
                    state.load_segment(&seg).await;
                    continue;
                }
                let partition = state.partitions.pop_front()?;
                let dir = segment::partition_dir(&state.base, partition);
                match segment::list_segments(&dir).await {
                    Ok(segments) => state.segments.extend(segments),
                    Err(e) => return Some((Err(e), state)),
                }
            }
        })
        .boxed()
    }

    /// Latest offset of a partition by full scan, `None` if it is empty.
    pub async fn get_latest_offset(&self, partition: usize) -> Result<Option<u64>> {
        let mut events = self.scan(0, None, Some(partition), false);
        let mut latest = None;
        while let Some(entry) = events.next().await {
            let entry = entry?;
            latest = Some(latest.map_or(entry.offset, |l: u64| l.max(entry.offset)));
        }
        Ok(latest)
    }

    /// One full scan for every partition's latest offset and the highest
    /// sequence number.
    pub async fn recover_positions(&self) -> Result<RecoveredPositions> {
        let mut positions = RecoveredPositions {
            latest_offsets: vec![None; self.partitions()],
            max_sequence: None,
        };
        let mut events = self.scan(0, None, None, false);
        while let Some(entry) = events.next().await {
            let entry = entry?;
            if let Some(slot) = positions.latest_offsets.get_mut(entry.partition) {
                *slot = Some(slot.map_or(entry.offset, |o| o.max(entry.offset)));
            }
            positions.max_sequence = Some(
                positions
                    .max_sequence
                    .map_or(entry.sequence_number, |s| s.max(entry.sequence_number)),
            );
        }
        Ok(positions)
    }

    /// Delete segments (never the active one) whose mtime is older than
    /// `retention`. Returns how many files were removed.
    ///
    /// Partitions that lost a segment have their index entries rebuilt from
    /// the remaining segments, and the sidecar is saved.
    pub async fn cleanup_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for (partition, writer) in self.writers.iter().enumerate() {
            let w = writer.lock().await;
            let before = removed;
            for seg in segment::list_segments(&w.dir).await? {
                if seg.number >= w.segment {
                    continue;
                }
                let modified = match tokio::fs::metadata(&seg.path).await.and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %seg.path.display(), error = %e, "Cannot stat segment");
                        continue;
                    }
                };
                if modified >= cutoff {
                    continue;
                }
                match tokio::fs::remove_file(&seg.path).await {
                    Ok(()) => {
                        info!(path = %seg.path.display(), "Deleted expired segment");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %seg.path.display(), error = %e, "Failed to delete segment"),
                }
            }
            if removed > before {
                self.reindex_partition(partition).await?;
            }
        }
        if removed > 0 {
            self.save_index().await?;
        }
        Ok(removed)
    }

    /// Replace one partition's index entries with stats of what is on disk.
    async fn reindex_partition(&self, partition: usize) -> Result<()> {
        let mut fresh = EventIndex::new();
        let mut events = self.scan(0, None, Some(partition), false);
        while let Some(entry) = events.next().await {
            let entry = entry?;
            let size = serde_json::to_string(&entry).map(|s| s.len() as u64 + 1).unwrap_or(0);
            fresh.record(&entry, size);
        }
        let mut index = match self.index.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        index.replace_partition(partition, fresh);
        debug!(partition, "Rebuilt index after retention sweep");
        Ok(())
    }

    /// Retention sweep using the configured `retention_hours`.
    pub async fn cleanup(&self) -> Result<usize> {
        self.cleanup_expired(Duration::from_secs(self.config.retention_hours * 3600))
            .await
    }

    /// Snapshot of the index sidecar.
    pub fn index(&self) -> EventIndex {
        match self.index.lock() {
            Ok(i) => i.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn save_index(&self) -> Result<()> {
        let snapshot = self.index();
        snapshot.save(&self.base).await
    }

    /// Persist the index; the log stays usable afterwards.
    pub async fn close(&self) -> Result<()> {
        self.save_index().await?;
        info!(dir = %self.base.display(), "Event log closed");
        Ok(())
    }
}

/// Best-effort removal of bytes a failed append may have left behind.
async fn discard_tail(path: &Path, previous_len: u64, rotated: bool) {
    let result = if rotated {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    } else {
        match tokio::fs::OpenOptions::new().write(true).open(path).await {
            Ok(file) => file.set_len(previous_len).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to discard partial write");
    }
}

struct ScanState {
    base: PathBuf,
    partitions: VecDeque<usize>,
    segments: VecDeque<SegmentFile>,
    buffered: VecDeque<Result<EventLogEntry>>,
    start_offset: u64,
    end_offset: Option<u64>,
    verify: bool,
}

impl ScanState {
    async fn load_segment(&mut self, seg: &SegmentFile) {
        let bytes = match tokio::fs::read(&seg.path).await {
            Ok(b) => b,
            // Removed by retention between listing and reading.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                self.buffered.push_back(Err(e.into()));
                return;
            }
        };
        let text = segment::decode_segment(&bytes, seg.compressed);

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventLogEntry = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        segment = %seg.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed log line"
                    );
                    continue;
                }
            };
            if entry.offset < self.start_offset || self.end_offset.is_some_and(|end| entry.offset > end) {
                continue;
            }
            if self.verify {
                if let Err(e) = entry.verify_checksum() {
                    self.buffered.push_back(Err(e));
                    continue;
                }
            }
            self.buffered.push_back(Ok(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EventDraft;

    fn config(dir: &Path) -> EventLogConfig {
        EventLogConfig {
            dir: dir.display().to_string(),
            partitions: 2,
            fsync: false,
            ..Default::default()
        }
    }

    fn entry(seq: u64, partition: usize, offset: u64) -> EventLogEntry {
        EventDraft::new("orders", "created", serde_json::json!({ "seq": seq }))
            .into_entry("test", seq, partition, offset, 1)
    }

    async fn collect(log: &EventLog, start: u64, end: Option<u64>, p: Option<usize>) -> Vec<EventLogEntry> {
        log.read_events(start, end, p)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(config(dir.path())).await.unwrap();

        let batch = vec![entry(0, 1, 0), entry(1, 1, 1), entry(2, 1, 2)];
        log.write_batch(1, &batch).await.unwrap();

        let read = collect(&log, 0, None, Some(1)).await;
        assert_eq!(read, batch);
        for e in &read {
            assert!(e.verify_checksum().is_ok());
        }
        assert!(collect(&log, 0, None, Some(0)).await.is_empty());
    }

    #[tokio::test]
    async fn test_offset_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(config(dir.path())).await.unwrap();
        let batch: Vec<_> = (0..5).map(|i| entry(i, 0, i)).collect();
        log.write_batch(0, &batch).await.unwrap();

        let offsets: Vec<u64> = collect(&log, 1, Some(3), None).await.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rejects_entry_for_other_partition() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(config(dir.path())).await.unwrap();
        let result = log.write_batch(0, &[entry(0, 1, 0)]).await;
        assert!(matches!(result, Err(WeftError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rotation_creates_new_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_segment_bytes = 200;
        let log = EventLog::open(cfg).await.unwrap();

        for i in 0..4 {
            log.write_event(&entry(i, 0, i)).await.unwrap();
        }
        let segments = segment::list_segments(&segment::partition_dir(dir.path(), 0)).await.unwrap();
        assert!(segments.len() >= 2, "expected rotation, got {:?}", segments);

        let offsets: Vec<u64> = collect(&log, 0, None, Some(0)).await.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_malformed_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(config(dir.path())).await.unwrap();
        log.write_event(&entry(0, 0, 0)).await.unwrap();

        let seg = segment::partition_dir(dir.path(), 0).join(segment::segment_name(0, false));
        let mut raw = std::fs::read_to_string(&seg).unwrap();
        raw.push_str("{\"id\":\"half-writ");
        std::fs::write(&seg, raw).unwrap();

        let read = collect(&log, 0, None, None).await;
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_compressed_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.compression = true;
        let log = EventLog::open(cfg).await.unwrap();

        log.write_event(&entry(0, 0, 0)).await.unwrap();
        log.write_event(&entry(1, 0, 1)).await.unwrap();

        let seg = segment::partition_dir(dir.path(), 0).join("events-000000.log.gz");
        assert!(seg.exists());
        assert_eq!(collect(&log, 0, None, Some(0)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reopen_continues_segment_and_recovers_positions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = EventLog::open(config(dir.path())).await.unwrap();
            log.write_batch(0, &[entry(0, 0, 0), entry(2, 0, 1)]).await.unwrap();
            log.write_event(&entry(1, 1, 0)).await.unwrap();
            log.close().await.unwrap();
        }

        let log = EventLog::open(config(dir.path())).await.unwrap();
        let positions = log.recover_positions().await.unwrap();
        assert_eq!(positions.latest_offsets, vec![Some(1), Some(0)]);
        assert_eq!(positions.max_sequence, Some(2));
        assert_eq!(log.get_latest_offset(0).await.unwrap(), Some(1));
        assert_eq!(log.index().get("orders", 0).unwrap().event_count, 2);
    }

    #[tokio::test]
    async fn test_rollback_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(config(dir.path())).await.unwrap();
        log.write_event(&entry(0, 0, 0)).await.unwrap();

        let mark = log.append_batch(0, &[entry(1, 0, 1), entry(2, 0, 2)]).await.unwrap();
        log.rollback(&mark).await.unwrap();

        let read = collect(&log, 0, None, Some(0)).await;
        assert_eq!(read.len(), 1);
        log.write_event(&entry(1, 0, 1)).await.unwrap();
        assert_eq!(collect(&log, 0, None, Some(0)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_verify_on_read_surfaces_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.verify_checksums = true;
        let log = EventLog::open(cfg).await.unwrap();

        let mut bad = entry(0, 0, 0);
        bad.checksum = "deadbeef".into();
        log.write_event(&bad).await.unwrap();

        let results: Vec<_> = log.read_events(0, None, Some(0)).collect().await;
        assert!(matches!(results[0], Err(WeftError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_segment_bytes = 1;
        let log = EventLog::open(cfg).await.unwrap();
        for i in 0..3 {
            log.write_event(&entry(i, 0, i)).await.unwrap();
        }

        // Zero retention: everything but the active segment is expired.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = log.cleanup_expired(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);

        let read = collect(&log, 0, None, Some(0)).await;
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].offset, 2);
    }

    #[tokio::test]
    async fn test_cleanup_rebuilds_index_of_swept_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_segment_bytes = 1;
        let log = EventLog::open(cfg).await.unwrap();
        for i in 0..3 {
            log.write_event(&entry(i, 0, i)).await.unwrap();
        }
        log.write_event(&entry(3, 1, 0)).await.unwrap();
        let untouched = log.index().get("orders", 1).cloned().unwrap();
        assert_eq!(log.index().get("orders", 0).unwrap().event_count, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.cleanup_expired(Duration::ZERO).await.unwrap(), 2);

        let index = log.index();
        let stats = index.get("orders", 0).unwrap();
        assert_eq!(stats.event_count, 1);
        assert_eq!(stats.min_offset, 2);
        assert_eq!(stats.max_offset, 2);
        let line = serde_json::to_string(&collect(&log, 0, None, Some(0)).await[0]).unwrap();
        assert_eq!(stats.size_bytes, line.len() as u64 + 1);
        assert_eq!(index.get("orders", 1), Some(&untouched));

        // The sidecar on disk reflects the sweep too.
        let saved = EventIndex::load(dir.path()).await;
        assert_eq!(saved.get("orders", 0).unwrap().event_count, 1);
    }
}
