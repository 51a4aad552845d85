//! Log segment files.
//!
//! A segment is an append-only file identified by a monotonically
//! increasing version. The fixed header records the log position the
//! segment starts after; each record carries a crc32 so a torn tail can
//! be detected and truncated on open. A sealed segment ends with a
//! sentinel marker and is never written again.
//!
//! ```text
//! header:  [magic u32][format u16][pad u16][version u64][prev_index u64][prev_term u64]
//! record:  [content_len u32][term u64][content ...][crc32 u32]
//! seal:    [0xffff_ffff]
//! ```

use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::StoreError;

const SEGMENT_MAGIC: u32 = 0x4352_4c47;
const SEGMENT_FORMAT: u16 = 1;
pub const HEADER_LEN: u64 = 32;
const SEAL_SENTINEL: u32 = 0xffff_ffff;

/// In-memory metadata of one record.
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    /// Offset of the record's first header byte in the file.
    pub offset: u64,
    pub term: u64,
    pub content_len: u32,
}

impl RecordMeta {
    /// The total on-disk size of the record.
    pub fn record_len(&self) -> u64 {
        4 + 8 + self.content_len as u64 + 4
    }

    fn content_offset(&self) -> u64 {
        self.offset + 4 + 8
    }
}

/// One segment file plus its in-memory record index.
///
/// Readers hold the segment through an `Arc`; a pruned segment's file is
/// unlinked only when the last reference drops.
#[derive(Debug)]
pub struct Segment {
    pub version: u64,
    /// The index of the entry immediately before this segment.
    pub prev_index: u64,
    pub prev_term: u64,
    path: PathBuf,
    records: RwLock<Vec<RecordMeta>>,
    pruned: AtomicBool,
}

impl Segment {
    /// Create a fresh segment file, returning the segment and a writer
    /// positioned after the header.
    pub async fn create(
        path: &Path,
        version: u64,
        prev_index: u64,
        prev_term: u64,
    ) -> Result<(Arc<Segment>, tokio::fs::File), StoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .await?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        header.extend_from_slice(&SEGMENT_FORMAT.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&version.to_be_bytes());
        header.extend_from_slice(&prev_index.to_be_bytes());
        header.extend_from_slice(&prev_term.to_be_bytes());
        file.write_all(&header).await?;
        file.sync_data().await?;

        let segment = Arc::new(Segment {
            version,
            prev_index,
            prev_term,
            path: path.to_path_buf(),
            records: RwLock::new(Vec::new()),
            pruned: AtomicBool::new(false),
        });
        Ok((segment, file))
    }

    /// Open an existing segment, truncating any torn tail. Returns the
    /// segment, a writer positioned at the end, and whether the segment
    /// was sealed.
    pub async fn open(path: &Path) -> Result<(Arc<Segment>, tokio::fs::File, bool), StoreError> {
        let mut file = tokio::fs::OpenOptions::new().read(true).write(true).open(path).await?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .await
            .map_err(|_| StoreError::CorruptSegment(0, "short header"))?;
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let format = u16::from_be_bytes(header[4..6].try_into().unwrap());
        let version = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let prev_index = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let prev_term = u64::from_be_bytes(header[24..32].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(StoreError::CorruptSegment(version, "bad magic"));
        }
        if format != SEGMENT_FORMAT {
            return Err(StoreError::CorruptSegment(version, "unknown format"));
        }

        // Scan records until the seal, the end of the file, or a torn or
        // corrupt tail, which gets truncated away.
        let file_len = file.metadata().await?.len();
        let mut records = Vec::new();
        let mut offset = HEADER_LEN;
        let mut sealed = false;
        while offset < file_len {
            if offset + 4 > file_len {
                break; // torn length prefix
            }
            let mut len_buf = [0u8; 4];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut len_buf).await?;
            let content_len = u32::from_be_bytes(len_buf);
            if content_len == SEAL_SENTINEL {
                sealed = true;
                break;
            }

            let record_len = 4 + 8 + content_len as u64 + 4;
            if offset + record_len > file_len {
                break; // torn record body
            }
            let mut body = vec![0u8; record_len as usize - 4];
            file.read_exact(&mut body).await?;
            let term = u64::from_be_bytes(body[0..8].try_into().unwrap());
            let content = &body[8..8 + content_len as usize];
            let stored_crc = u32::from_be_bytes(body[8 + content_len as usize..].try_into().unwrap());
            if record_crc(term, content) != stored_crc {
                break; // corrupt tail
            }

            records.push(RecordMeta {
                offset,
                term,
                content_len,
            });
            offset += record_len;
        }

        let good_end = records
            .last()
            .map(|r| r.offset + r.record_len())
            .unwrap_or(HEADER_LEN);
        if !sealed && good_end < file_len {
            tracing::warn!(
                version,
                torn_bytes = file_len - good_end,
                "truncating torn segment tail"
            );
            file.set_len(good_end).await?;
            file.sync_data().await?;
        }
        file.seek(SeekFrom::Start(good_end)).await?;

        let segment = Arc::new(Segment {
            version,
            prev_index,
            prev_term,
            path: path.to_path_buf(),
            records: RwLock::new(records),
            pruned: AtomicBool::new(false),
        });
        Ok((segment, file, sealed))
    }

    /// Append one record through the given writer and record its
    /// metadata. Durable once the caller syncs the writer.
    pub async fn append_record(
        &self,
        file: &mut tokio::fs::File,
        term: u64,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let offset = {
            let records = self.records.read().unwrap();
            records
                .last()
                .map(|r| r.offset + r.record_len())
                .unwrap_or(HEADER_LEN)
        };

        let mut buf = Vec::with_capacity(4 + 8 + content.len() + 4);
        buf.extend_from_slice(&(content.len() as u32).to_be_bytes());
        buf.extend_from_slice(&term.to_be_bytes());
        buf.extend_from_slice(content);
        buf.extend_from_slice(&record_crc(term, content).to_be_bytes());
        file.write_all(&buf).await?;

        self.records.write().unwrap().push(RecordMeta {
            offset,
            term,
            content_len: content.len() as u32,
        });
        Ok(())
    }

    /// Write the seal sentinel; the segment is immutable afterwards.
    pub async fn seal(&self, file: &mut tokio::fs::File) -> Result<(), StoreError> {
        file.write_all(&SEAL_SENTINEL.to_be_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.prev_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.prev_index + self.records.read().unwrap().len() as u64
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On-disk size of the segment's records.
    pub fn byte_size(&self) -> u64 {
        let records = self.records.read().unwrap();
        records.last().map(|r| r.offset + r.record_len()).unwrap_or(HEADER_LEN)
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.first_index() && index <= self.last_index()
    }

    pub fn term_of(&self, index: u64) -> Option<u64> {
        if !self.contains(index) {
            return None;
        }
        let records = self.records.read().unwrap();
        records.get((index - self.first_index()) as usize).map(|r| r.term)
    }

    /// Read and verify one record's content.
    pub async fn read_content(&self, index: u64) -> Result<Option<(u64, Bytes)>, StoreError> {
        let rel = match index.checked_sub(self.first_index()) {
            Some(rel) => rel,
            None => return Ok(None),
        };
        let meta = {
            let records = self.records.read().unwrap();
            match records.get(rel as usize) {
                Some(meta) => *meta,
                None => return Ok(None),
            }
        };

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(meta.content_offset())).await?;
        let mut content = vec![0u8; meta.content_len as usize];
        file.read_exact(&mut content).await?;
        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf).await?;
        if record_crc(meta.term, &content) != u32::from_be_bytes(crc_buf) {
            return Err(StoreError::CorruptSegment(self.version, "record crc mismatch"));
        }
        Ok(Some((meta.term, Bytes::from(content))))
    }

    /// Drop records with `index >= from`, truncating the file.
    pub async fn truncate_from(
        &self,
        file: &mut tokio::fs::File,
        from: u64,
    ) -> Result<(), StoreError> {
        let keep = from.saturating_sub(self.first_index()) as usize;
        let offset = {
            let mut records = self.records.write().unwrap();
            records.truncate(keep);
            records
                .last()
                .map(|r| r.offset + r.record_len())
                .unwrap_or(HEADER_LEN)
        };
        file.set_len(offset).await?;
        file.sync_data().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// Mark the segment pruned; the file is unlinked when the last
    /// reference (including reader cursors) drops.
    pub fn mark_pruned(&self) {
        self.pruned.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.pruned.load(Ordering::Acquire) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path=?self.path, error=%err, "could not remove pruned segment");
            }
        }
    }
}

fn record_crc(term: u64, content: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&term.to_be_bytes());
    hasher.update(content);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_append_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.0000001");

        let (segment, mut file) = Segment::create(&path, 1, 10, 3).await.unwrap();
        segment.append_record(&mut file, 4, b"alpha").await.unwrap();
        segment.append_record(&mut file, 4, b"beta").await.unwrap();
        file.sync_data().await.unwrap();
        assert_eq!(segment.first_index(), 11);
        assert_eq!(segment.last_index(), 12);
        drop(file);
        drop(segment);

        let (reopened, _file, sealed) = Segment::open(&path).await.unwrap();
        assert!(!sealed);
        assert_eq!(reopened.prev_index, 10);
        assert_eq!(reopened.prev_term, 3);
        assert_eq!(reopened.last_index(), 12);
        let (term, content) = reopened.read_content(11).await.unwrap().unwrap();
        assert_eq!(term, 4);
        assert_eq!(&content[..], b"alpha");
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.0000001");

        let (segment, mut file) = Segment::create(&path, 1, 0, 0).await.unwrap();
        segment.append_record(&mut file, 1, b"good").await.unwrap();
        file.sync_data().await.unwrap();

        // Simulate a crash mid-write: a record header claiming more
        // bytes than the file holds.
        file.write_all(&20u32.to_be_bytes()).await.unwrap();
        file.write_all(&1u64.to_be_bytes()).await.unwrap();
        file.write_all(b"par").await.unwrap();
        file.sync_data().await.unwrap();
        drop(file);
        drop(segment);

        let (reopened, _file, _sealed) = Segment::open(&path).await.unwrap();
        assert_eq!(reopened.last_index(), 1);
        let (_, content) = reopened.read_content(1).await.unwrap().unwrap();
        assert_eq!(&content[..], b"good");

        // The torn bytes are gone from disk.
        let len = std::fs::metadata(&path).unwrap().len();
        let expected = HEADER_LEN + 4 + 8 + 4 + 4;
        assert_eq!(len, expected);
    }

    #[tokio::test]
    async fn corrupt_record_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.0000001");

        let (segment, mut file) = Segment::create(&path, 1, 0, 0).await.unwrap();
        segment.append_record(&mut file, 1, b"keep").await.unwrap();
        segment.append_record(&mut file, 1, b"flip").await.unwrap();
        file.sync_data().await.unwrap();

        // Flip a bit inside the second record's content.
        let tail = segment.byte_size() - 6;
        file.seek(SeekFrom::Start(tail)).await.unwrap();
        file.write_all(&[0xff]).await.unwrap();
        file.sync_data().await.unwrap();
        drop(file);
        drop(segment);

        let (reopened, _file, _sealed) = Segment::open(&path).await.unwrap();
        assert_eq!(reopened.last_index(), 1);
    }

    #[tokio::test]
    async fn sealed_segment_reads_back_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.0000001");

        let (segment, mut file) = Segment::create(&path, 1, 0, 0).await.unwrap();
        segment.append_record(&mut file, 2, b"only").await.unwrap();
        file.sync_data().await.unwrap();
        segment.seal(&mut file).await.unwrap();
        drop(file);
        drop(segment);

        let (_, _, sealed) = Segment::open(&path).await.unwrap();
        assert!(sealed);
    }

    #[tokio::test]
    async fn pruned_segment_file_survives_while_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.0000001");

        let (segment, mut file) = Segment::create(&path, 1, 0, 0).await.unwrap();
        segment.append_record(&mut file, 1, b"x").await.unwrap();
        file.sync_data().await.unwrap();
        drop(file);

        let reader_ref = segment.clone();
        segment.mark_pruned();
        drop(segment);
        assert!(path.exists(), "file must survive while a reader holds it");

        drop(reader_ref);
        assert!(!path.exists(), "file is unlinked with the last reference");
    }
}
