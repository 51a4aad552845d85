//! The storage seams the core is driven through.
//!
//! Durable implementations live in the `causal-store` crate; the test
//! fixtures drive the core with in-memory implementations of the same
//! traits.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::LogEntry;
use crate::ClusterId;
use crate::LogId;
use crate::MemberId;
use crate::StoreId;

/// The persisted `(term, voted_for)` record.
///
/// Must be durable before any vote or append referencing the term is
/// transmitted or acknowledged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteRecord {
    pub term: u64,
    pub voted_for: Option<MemberId>,
}

impl VoteRecord {
    pub fn marshal(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.term);
        match self.voted_for {
            Some(member) => {
                marshal::put_bool(buf, true);
                marshal::put_member_id(buf, member);
            }
            None => marshal::put_bool(buf, false),
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let term = marshal::get_u64(buf)?;
        let voted_for = if marshal::get_bool(buf)? {
            Some(marshal::get_member_id(buf)?)
        } else {
            None
        };
        Ok(Self { term, voted_for })
    }
}

/// The state a member recovers on startup, assembled from the stable
/// store, the log and the last flushed applier state.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub vote: VoteRecord,
    pub last_log_id: LogId,
    pub last_applied: LogId,
    pub membership: BTreeSet<MemberId>,
}

/// Append-only log storage with safe truncation and pruning.
///
/// All indices are 1-based and contiguous. `prev_index`/`prev_term`
/// describe the highest pruned position; an empty pristine log has both
/// at zero.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// The cursor type for streaming reads. Holding a reader blocks
    /// pruning of the segments it covers.
    type Reader: LogReader;

    /// Durably append entries, returning the new append index. The
    /// entries carry their indices; they must directly follow the current
    /// append index.
    async fn append(&self, entries: &[LogEntry]) -> Result<u64>;

    /// Discard entries with `index >= from_index`. Callers must never
    /// truncate at or below the commit index.
    async fn truncate(&self, from_index: u64) -> Result<()>;

    /// Remove whole segments whose last index is `<= up_to_index`,
    /// returning the new prev index. The segment containing
    /// `up_to_index + 1` is never dropped.
    async fn prune(&self, up_to_index: u64) -> Result<u64>;

    /// Discard the whole log and restart it after an installed snapshot
    /// position.
    async fn reset(&self, prev: LogId) -> Result<()>;

    /// Read one entry, or `None` when outside `(prev_index, append_index]`.
    async fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// Read the entries in `[from, to_exclusive)` that are present.
    async fn entries(&self, from: u64, to_exclusive: u64) -> Result<Vec<LogEntry>>;

    /// Read the term of one entry. Also answers for `prev_index`.
    async fn entry_term(&self, index: u64) -> Result<Option<u64>>;

    /// Open a cursor at `from`.
    async fn reader(&self, from: u64) -> Result<Self::Reader>;

    /// The index of the last appended entry.
    fn append_index(&self) -> u64;

    /// The highest pruned index.
    fn prev_index(&self) -> u64;

    /// The term of the entry at `prev_index`.
    fn prev_term(&self) -> u64;
}

/// A streaming log reader.
#[async_trait]
pub trait LogReader: Send + 'static {
    /// The next entry, or `None` at the end of the log.
    async fn next_entry(&mut self) -> Result<Option<LogEntry>>;
}

/// Durable storage of the vote record and member identity.
#[async_trait]
pub trait StableStore: Send + Sync + 'static {
    /// Persist the vote record. Durable before return.
    async fn save_vote(&self, vote: &VoteRecord) -> Result<()>;

    /// Read the persisted vote record, or the default for a pristine
    /// member.
    async fn read_vote(&self) -> Result<VoteRecord>;

    /// This member's stable id, created on first access.
    async fn member_id(&self) -> Result<MemberId>;

    /// The cluster this member is bound to, if bound.
    async fn cluster_id(&self) -> Result<Option<ClusterId>>;

    /// Bind this member to a cluster. Binding is permanent until unbind.
    async fn bind_cluster(&self, cluster: ClusterId) -> Result<()>;

    /// The identity of the replicated store contents.
    async fn store_id(&self) -> Result<StoreId>;
}

/// Durable storage for the applier's flushed state.
#[async_trait]
pub trait StateFlush: Send + Sync + 'static {
    /// Persist a snapshot of the applied state machines, atomically with
    /// the last applied position it covers.
    async fn flush(&self, snapshot: &CoreSnapshot) -> Result<()>;

    /// Read the most recently flushed snapshot, if any.
    async fn read(&self) -> Result<Option<CoreSnapshot>>;
}

/// A compact summary of the applied state machines at one log position,
/// used to bootstrap or catch up members whose log position has been
/// pruned away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// The last log index the snapshot covers.
    pub prev_index: u64,
    /// The term of the entry at `prev_index`.
    pub prev_term: u64,
    /// The voting member set at the snapshot position.
    pub members: BTreeSet<MemberId>,
    /// Marshalled per-state-machine blobs, keyed by state machine kind.
    pub app_states: BTreeMap<u8, Bytes>,
}

impl CoreSnapshot {
    pub fn log_id(&self) -> LogId {
        LogId::new(self.prev_term, self.prev_index)
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u64(self.prev_index);
        buf.put_u64(self.prev_term);
        buf.put_u32(self.members.len() as u32);
        for member in &self.members {
            marshal::put_member_id(buf, *member);
        }
        buf.put_u32(self.app_states.len() as u32);
        for (kind, blob) in &self.app_states {
            buf.put_u8(*kind);
            marshal::put_bytes(buf, blob);
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let prev_index = marshal::get_u64(buf)?;
        let prev_term = marshal::get_u64(buf)?;
        let n_members = marshal::get_u32(buf)?;
        let mut members = BTreeSet::new();
        for _ in 0..n_members {
            members.insert(marshal::get_member_id(buf)?);
        }
        let n_states = marshal::get_u32(buf)?;
        let mut app_states = BTreeMap::new();
        for _ in 0..n_states {
            let kind = marshal::get_u8(buf)?;
            app_states.insert(kind, marshal::get_bytes(buf)?);
        }
        Ok(Self {
            prev_index,
            prev_term,
            members,
            app_states,
        })
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn vote_record_round_trip() {
        let mut buf = BytesMut::new();
        let record = VoteRecord {
            term: 9,
            voted_for: Some(MemberId::from_u128(4)),
        };
        record.marshal(&mut buf);
        assert_eq!(VoteRecord::unmarshal(&mut buf.freeze()).unwrap(), record);

        let mut buf = BytesMut::new();
        let unvoted = VoteRecord {
            term: 3,
            voted_for: None,
        };
        unvoted.marshal(&mut buf);
        assert_eq!(VoteRecord::unmarshal(&mut buf.freeze()).unwrap(), unvoted);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut app_states = BTreeMap::new();
        app_states.insert(1u8, Bytes::from_static(b"id-alloc"));
        app_states.insert(4u8, Bytes::from_static(b"sessions"));
        let snapshot = CoreSnapshot {
            prev_index: 1000,
            prev_term: 7,
            members: btreeset![MemberId::from_u128(1), MemberId::from_u128(2)],
            app_states,
        };
        let mut buf = BytesMut::new();
        snapshot.marshal(&mut buf);
        assert_eq!(CoreSnapshot::unmarshal(&mut buf.freeze()).unwrap(), snapshot);
    }
}
