//! The segmented durable Raft log.
//!
//! Entries append to an active segment which rolls to a new version once
//! it exceeds the configured size. Pruning drops whole sealed segments;
//! a segment stays on disk while any reader cursor still references it.
//! All writes are synced before the call returns.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use causal_raft::operation::EntryPayload;
use causal_raft::operation::LogEntry;
use causal_raft::storage::LogReader;
use causal_raft::storage::LogStore;
use causal_raft::LogId;
use tokio::sync::RwLock;

use crate::layout::ClusterStateLayout;
use crate::segments::Segment;
use crate::StoreError;

/// Tunables of the segmented log.
#[derive(Debug, Clone)]
pub struct SegmentedLogOptions {
    /// Roll to a new segment once the active one exceeds this size.
    pub max_segment_bytes: u64,
}

impl Default for SegmentedLogOptions {
    fn default() -> Self {
        Self {
            max_segment_bytes: 8 * 1024 * 1024,
        }
    }
}

struct LogInner {
    /// All segments, keyed by their first index. The highest entry is
    /// the active segment.
    segments: BTreeMap<u64, Arc<Segment>>,
    active: Arc<Segment>,
    writer: tokio::fs::File,
    next_version: u64,
}

/// See the module docs.
pub struct SegmentedLog {
    layout: ClusterStateLayout,
    options: SegmentedLogOptions,
    inner: RwLock<LogInner>,
    append_index: AtomicU64,
    prev_index: AtomicU64,
    prev_term: AtomicU64,
}

impl SegmentedLog {
    /// Open the log under the given layout, recovering all segments and
    /// truncating any torn tail.
    pub async fn open(
        layout: ClusterStateLayout,
        options: SegmentedLogOptions,
    ) -> Result<SegmentedLog, StoreError> {
        layout.ensure_dirs()?;

        let mut versions: Vec<u64> = Vec::new();
        let mut dir = tokio::fs::read_dir(layout.raft_log_dir()).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(version) = name.strip_prefix("segment.") {
                if let Ok(version) = version.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut opened: Option<(Arc<Segment>, tokio::fs::File, bool)> = None;
        for version in &versions {
            let path = layout.segment_file(*version);
            let (segment, file, sealed) = Segment::open(&path).await?;
            if let Some((prior, _, _)) = &opened {
                if segment.prev_index != prior.last_index() {
                    return Err(StoreError::CorruptSegment(*version, "segment gap"));
                }
            }
            segments.insert(segment.first_index(), segment.clone());
            opened = Some((segment, file, sealed));
        }

        let (active, writer, next_version) = match opened {
            Some((last, file, sealed)) if !sealed => {
                let next = last.version + 1;
                (last, file, next)
            }
            Some((last, _file, _sealed)) => {
                // The last segment was sealed before shutdown; open a
                // fresh active one after it.
                let version = last.version + 1;
                let last_term = last.term_of(last.last_index()).unwrap_or(last.prev_term);
                let path = layout.segment_file(version);
                let (segment, file) =
                    Segment::create(&path, version, last.last_index(), last_term).await?;
                segments.insert(segment.first_index(), segment.clone());
                (segment, file, version + 1)
            }
            None => {
                let path = layout.segment_file(1);
                let (segment, file) = Segment::create(&path, 1, 0, 0).await?;
                segments.insert(segment.first_index(), segment.clone());
                (segment, file, 2)
            }
        };

        let first = segments.values().next().expect("at least one segment");
        let log = SegmentedLog {
            layout,
            options,
            append_index: AtomicU64::new(active.last_index()),
            prev_index: AtomicU64::new(first.prev_index),
            prev_term: AtomicU64::new(first.prev_term),
            inner: RwLock::new(LogInner {
                segments,
                active,
                writer,
                next_version,
            }),
        };
        Ok(log)
    }

    async fn roll_if_needed(&self, inner: &mut LogInner) -> Result<(), StoreError> {
        if inner.active.byte_size() < self.options.max_segment_bytes || inner.active.is_empty() {
            return Ok(());
        }
        inner.active.seal(&mut inner.writer).await?;

        let version = inner.next_version;
        inner.next_version += 1;
        let prev_index = inner.active.last_index();
        let prev_term = inner
            .active
            .term_of(prev_index)
            .unwrap_or(inner.active.prev_term);
        let path = self.layout.segment_file(version);
        let (segment, file) = Segment::create(&path, version, prev_index, prev_term).await?;
        tracing::debug!(version, prev_index, "rolled to new log segment");
        inner.segments.insert(segment.first_index(), segment.clone());
        inner.active = segment;
        inner.writer = file;
        Ok(())
    }

    fn segment_for(inner: &LogInner, index: u64) -> Option<Arc<Segment>> {
        inner
            .segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| segment.clone())
            .filter(|segment| segment.contains(index))
    }
}

#[async_trait]
impl LogStore for SegmentedLog {
    type Reader = SegmentedLogReader;

    async fn append(&self, entries: &[LogEntry]) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        for entry in entries {
            let expected = self.append_index.load(Ordering::Acquire) + 1;
            if entry.log_id.index != expected {
                return Err(StoreError::NonContiguousAppend {
                    index: entry.log_id.index,
                    expected,
                }
                .into());
            }
            let content = entry.payload.marshal_to_bytes();
            inner
                .active
                .append_record(&mut inner.writer, entry.log_id.term, &content)
                .await?;
            self.append_index.store(entry.log_id.index, Ordering::Release);
            self.roll_if_needed(inner).await?;
        }
        inner.writer.sync_data().await.context("sync log segment")?;
        Ok(self.append_index.load(Ordering::Acquire))
    }

    async fn truncate(&self, from_index: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let prev = self.prev_index.load(Ordering::Acquire);
        if from_index <= prev {
            return Err(StoreError::TruncateBelowPrev {
                from: from_index,
                prev,
            }
            .into());
        }
        if from_index > self.append_index.load(Ordering::Acquire) {
            return Ok(());
        }

        // Drop whole segments above the truncation point.
        let doomed: Vec<u64> = inner
            .segments
            .range(from_index + 1..)
            .filter(|(_, s)| s.first_index() > from_index)
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            if let Some(segment) = inner.segments.remove(&key) {
                segment.mark_pruned();
            }
        }

        // The segment holding the truncation point becomes the active
        // tail.
        let target = Self::segment_for(&inner, from_index)
            .or_else(|| inner.segments.values().next_back().cloned())
            .expect("the log always holds at least one segment");
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.layout.segment_file(target.version))
            .await?;
        target.truncate_from(&mut file, from_index).await?;
        inner.active = target;
        inner.writer = file;

        self.append_index.store(inner.active.last_index(), Ordering::Release);
        Ok(())
    }

    async fn prune(&self, up_to_index: u64) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let doomed: Vec<u64> = inner
            .segments
            .iter()
            .filter(|(_, segment)| {
                segment.version != inner.active.version && segment.last_index() <= up_to_index
            })
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            if let Some(segment) = inner.segments.remove(&key) {
                tracing::debug!(version = segment.version, "pruning log segment");
                segment.mark_pruned();
            }
        }

        let first = inner.segments.values().next().expect("at least one segment");
        self.prev_index.store(first.prev_index, Ordering::Release);
        self.prev_term.store(first.prev_term, Ordering::Release);
        Ok(first.prev_index)
    }

    async fn reset(&self, prev: LogId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let keys: Vec<u64> = inner.segments.keys().copied().collect();
        for key in keys {
            if let Some(segment) = inner.segments.remove(&key) {
                segment.mark_pruned();
            }
        }

        let version = inner.next_version;
        inner.next_version += 1;
        let path = self.layout.segment_file(version);
        let (segment, file) = Segment::create(&path, version, prev.index, prev.term).await?;
        inner.segments.insert(segment.first_index(), segment.clone());
        inner.active = segment;
        inner.writer = file;

        self.append_index.store(prev.index, Ordering::Release);
        self.prev_index.store(prev.index, Ordering::Release);
        self.prev_term.store(prev.term, Ordering::Release);
        tracing::info!(prev=%prev, "log reset after snapshot installation");
        Ok(())
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let segment = {
            let inner = self.inner.read().await;
            Self::segment_for(&inner, index)
        };
        let segment = match segment {
            Some(segment) => segment,
            None => return Ok(None),
        };
        let (term, content) = match segment.read_content(index).await? {
            Some(found) => found,
            None => return Ok(None),
        };
        let payload = EntryPayload::unmarshal_from_bytes(content)
            .map_err(|err| anyhow::anyhow!("undecodable entry {}: {}", index, err))?;
        Ok(Some(LogEntry {
            log_id: LogId::new(term, index),
            payload,
        }))
    }

    async fn entries(&self, from: u64, to_exclusive: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for index in from..to_exclusive {
            match self.entry(index).await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn entry_term(&self, index: u64) -> Result<Option<u64>> {
        if index == self.prev_index.load(Ordering::Acquire) {
            return Ok(Some(self.prev_term.load(Ordering::Acquire)));
        }
        let inner = self.inner.read().await;
        Ok(Self::segment_for(&inner, index).and_then(|segment| segment.term_of(index)))
    }

    async fn reader(&self, from: u64) -> Result<Self::Reader> {
        let inner = self.inner.read().await;
        let segments: VecDeque<Arc<Segment>> = inner
            .segments
            .values()
            .filter(|segment| segment.last_index() >= from)
            .cloned()
            .collect();
        Ok(SegmentedLogReader {
            segments,
            next_index: from,
        })
    }

    fn append_index(&self) -> u64 {
        self.append_index.load(Ordering::Acquire)
    }

    fn prev_index(&self) -> u64 {
        self.prev_index.load(Ordering::Acquire)
    }

    fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }
}

/// A streaming cursor over the log. Keeps its segments referenced, so
/// pruning cannot unlink them mid-stream.
pub struct SegmentedLogReader {
    segments: VecDeque<Arc<Segment>>,
    next_index: u64,
}

#[async_trait]
impl LogReader for SegmentedLogReader {
    async fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        loop {
            let segment = match self.segments.front() {
                Some(segment) => segment.clone(),
                None => return Ok(None),
            };
            if self.next_index > segment.last_index() {
                self.segments.pop_front();
                continue;
            }
            if self.next_index < segment.first_index() {
                self.next_index = segment.first_index();
            }
            let index = self.next_index;
            let (term, content) = match segment.read_content(index).await? {
                Some(found) => found,
                None => return Ok(None),
            };
            self.next_index += 1;
            let payload = EntryPayload::unmarshal_from_bytes(content)
                .map_err(|err| anyhow::anyhow!("undecodable entry {}: {}", index, err))?;
            return Ok(Some(LogEntry {
                log_id: LogId::new(term, index),
                payload,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use causal_raft::operation::DistributedOperation;
    use causal_raft::operation::GlobalSession;
    use causal_raft::operation::LocalOperationId;
    use causal_raft::operation::ReplicatedContent;
    use causal_raft::MemberId;

    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Operation(DistributedOperation::new(
                GlobalSession::new(MemberId::from_u128(1)),
                LocalOperationId {
                    local_session_id: 0,
                    sequence_number: index,
                },
                ReplicatedContent::Dummy { size: 64 },
            )),
        }
    }

    async fn open_log(dir: &std::path::Path, max_segment_bytes: u64) -> SegmentedLog {
        SegmentedLog::open(
            ClusterStateLayout::at(dir.to_path_buf()),
            SegmentedLogOptions { max_segment_bytes },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn append_and_read_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 1024 * 1024).await;
            log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).await.unwrap();
            assert_eq!(log.append_index(), 3);
        }

        let log = open_log(dir.path(), 1024 * 1024).await;
        assert_eq!(log.append_index(), 3);
        assert_eq!(log.entry_term(3).await.unwrap(), Some(2));
        let read = log.entry(2).await.unwrap().unwrap();
        assert_eq!(read.log_id, LogId::new(1, 2));
    }

    #[tokio::test]
    async fn non_contiguous_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024 * 1024).await;
        log.append(&[entry(1, 1)]).await.unwrap();
        assert!(log.append(&[entry(1, 5)]).await.is_err());
    }

    #[tokio::test]
    async fn truncate_discards_the_tail_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024 * 1024).await;
        for i in 1..=5 {
            log.append(&[entry(1, i)]).await.unwrap();
        }

        log.truncate(3).await.unwrap();
        assert_eq!(log.append_index(), 2);
        assert!(log.entry(3).await.unwrap().is_none());
        assert!(log.entry(2).await.unwrap().is_some());

        // The log continues from the truncation point.
        log.append(&[entry(2, 3)]).await.unwrap();
        assert_eq!(log.entry_term(3).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn prune_drops_whole_segments_and_keeps_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segments so every entry or two rolls a new one.
        let log = open_log(dir.path(), 64).await;
        for i in 1..=10 {
            log.append(&[entry(1, i)]).await.unwrap();
        }

        let prev = log.prune(5).await.unwrap();
        assert!(prev <= 5, "prune must not pass the requested index");
        // The entry after the prune horizon must still be readable.
        assert!(log.entry(prev + 1).await.unwrap().is_some());
        for index in 1..=prev {
            assert!(log.entry(index).await.unwrap().is_none());
        }
        assert_eq!(log.prev_index(), prev);
    }

    #[tokio::test]
    async fn readers_defer_segment_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 64).await;
        for i in 1..=8 {
            log.append(&[entry(1, i)]).await.unwrap();
        }

        let mut reader = log.reader(1).await.unwrap();
        let first = reader.next_entry().await.unwrap().unwrap();
        assert_eq!(first.log_id.index, 1);

        // Prune under the open cursor; the stream must still complete.
        log.prune(6).await.unwrap();
        let mut seen = vec![first.log_id.index];
        while let Some(entry) = reader.next_entry().await.unwrap() {
            seen.push(entry.log_id.index);
        }
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn reset_restarts_after_snapshot_position() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024 * 1024).await;
        for i in 1..=4 {
            log.append(&[entry(1, i)]).await.unwrap();
        }

        log.reset(LogId::new(3, 100)).await.unwrap();
        assert_eq!(log.append_index(), 100);
        assert_eq!(log.prev_index(), 100);
        assert_eq!(log.entry_term(100).await.unwrap(), Some(3));
        assert!(log.entry(4).await.unwrap().is_none());

        log.append(&[entry(3, 101)]).await.unwrap();
        assert_eq!(log.append_index(), 101);
    }
}
