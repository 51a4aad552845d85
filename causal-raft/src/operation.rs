//! Replicated operation content and the session model for idempotent
//! client retries.
//!
//! Every value a client replicates is wrapped in a [`DistributedOperation`]
//! carrying its session identity, so the applier can suppress duplicates.
//! Content is marshalled tagged and length-first: an applier that does not
//! recognise a tag can skip the payload and treat the entry as a no-op.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use uuid::Uuid;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::error::ProtocolViolation;
use crate::LogId;
use crate::MemberId;
use crate::MessageSummary;

/// A replication session shared by all operations of one client instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalSession {
    pub id: Uuid,
    pub owner: MemberId,
}

impl GlobalSession {
    pub fn new(owner: MemberId) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
        }
    }

    pub fn marshal(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.id.as_u128());
        marshal::put_member_id(buf, self.owner);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        marshal::need(buf, 16)?;
        let id = Uuid::from_u128(buf.get_u128());
        let owner = marshal::get_member_id(buf)?;
        Ok(Self { id, owner })
    }
}

impl fmt::Display for GlobalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.id.simple().to_string();
        write!(f, "{}@{}", &s[..8], self.owner)
    }
}

/// Names one operation within a global session.
///
/// `(global_session, local_session_id, sequence_number)` uniquely names an
/// operation cluster-wide; retries reuse the same triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalOperationId {
    pub local_session_id: u64,
    pub sequence_number: u64,
}

impl LocalOperationId {
    pub fn marshal(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.local_session_id);
        buf.put_u64(self.sequence_number);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        Ok(Self {
            local_session_id: marshal::get_u64(buf)?,
            sequence_number: marshal::get_u64(buf)?,
        })
    }
}

impl fmt::Display for LocalOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.local_session_id, self.sequence_number)
    }
}

/// Distinguishes the id spaces handed out by the allocation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdType(pub u16);

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id-type-{}", self.0)
    }
}

mod content_tag {
    pub const DUMMY: u8 = 0;
    pub const TRANSACTION: u8 = 1;
    pub const TOKEN_CREATE: u8 = 2;
    pub const ID_ALLOCATION: u8 = 3;
    pub const LOCK_TOKEN: u8 = 4;
    pub const MEMBER_SET: u8 = 5;
    pub const SESSION_TRACK: u8 = 6;
}

/// The opaque-to-Raft content of a replicated operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicatedContent {
    /// Padding content with a declared logical size, used for testing and
    /// for keeping a quiet cluster's log warm.
    Dummy { size: u32 },
    /// An application transaction, applied through the transaction applier.
    Transaction { tx: Bytes },
    /// Registers a token name against a proposed id.
    TokenCreate { name: String, proposed_id: u32 },
    /// Claims an id range for one member.
    IdAllocation {
        id_type: IdType,
        range_start: u64,
        range_length: u32,
        owner: MemberId,
    },
    /// Attempts to take the cluster-wide lock token.
    LockToken { candidate_id: u32, owner: MemberId },
    /// Replaces the cluster's voting member set.
    MemberSet { members: BTreeSet<MemberId> },
    /// Registers a global session for tracking before its first operation.
    SessionTrack { session: GlobalSession },
    /// Content written by a newer version; applied as a no-op.
    Unknown { tag: u8 },
}

impl ReplicatedContent {
    /// The logical size of this content, used for in-flight cache
    /// accounting.
    pub fn size_bytes(&self) -> u64 {
        match self {
            ReplicatedContent::Dummy { size } => *size as u64,
            ReplicatedContent::Transaction { tx } => tx.len() as u64,
            ReplicatedContent::TokenCreate { name, .. } => name.len() as u64 + 4,
            ReplicatedContent::IdAllocation { .. } => 2 + 8 + 4 + 16,
            ReplicatedContent::LockToken { .. } => 4 + 16,
            ReplicatedContent::MemberSet { members } => members.len() as u64 * 16,
            ReplicatedContent::SessionTrack { .. } => 32,
            ReplicatedContent::Unknown { .. } => 0,
        }
    }

    /// Marshal the content, length first so unknown tags can be skipped.
    pub fn marshal(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let tag = match self {
            ReplicatedContent::Dummy { size } => {
                payload.put_u32(*size);
                content_tag::DUMMY
            }
            ReplicatedContent::Transaction { tx } => {
                marshal::put_bytes(&mut payload, tx);
                content_tag::TRANSACTION
            }
            ReplicatedContent::TokenCreate { name, proposed_id } => {
                marshal::put_string(&mut payload, name);
                payload.put_u32(*proposed_id);
                content_tag::TOKEN_CREATE
            }
            ReplicatedContent::IdAllocation {
                id_type,
                range_start,
                range_length,
                owner,
            } => {
                payload.put_u16(id_type.0);
                payload.put_u64(*range_start);
                payload.put_u32(*range_length);
                marshal::put_member_id(&mut payload, *owner);
                content_tag::ID_ALLOCATION
            }
            ReplicatedContent::LockToken { candidate_id, owner } => {
                payload.put_u32(*candidate_id);
                marshal::put_member_id(&mut payload, *owner);
                content_tag::LOCK_TOKEN
            }
            ReplicatedContent::MemberSet { members } => {
                payload.put_u32(members.len() as u32);
                for member in members {
                    marshal::put_member_id(&mut payload, *member);
                }
                content_tag::MEMBER_SET
            }
            ReplicatedContent::SessionTrack { session } => {
                session.marshal(&mut payload);
                content_tag::SESSION_TRACK
            }
            ReplicatedContent::Unknown { tag } => *tag,
        };
        buf.put_u32(payload.len() as u32);
        buf.put_u8(tag);
        buf.put_slice(&payload);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let len = marshal::get_u32(buf)? as usize;
        if len > marshal::MAX_FIELD_LEN {
            return Err(ProtocolViolation::OversizedFrame(len));
        }
        let tag = marshal::get_u8(buf)?;
        marshal::need(buf, len)?;
        let mut payload = buf.copy_to_bytes(len);

        let content = match tag {
            content_tag::DUMMY => ReplicatedContent::Dummy {
                size: marshal::get_u32(&mut payload)?,
            },
            content_tag::TRANSACTION => ReplicatedContent::Transaction {
                tx: marshal::get_bytes(&mut payload)?,
            },
            content_tag::TOKEN_CREATE => ReplicatedContent::TokenCreate {
                name: marshal::get_string(&mut payload)?,
                proposed_id: marshal::get_u32(&mut payload)?,
            },
            content_tag::ID_ALLOCATION => ReplicatedContent::IdAllocation {
                id_type: IdType(marshal::get_u16(&mut payload)?),
                range_start: marshal::get_u64(&mut payload)?,
                range_length: marshal::get_u32(&mut payload)?,
                owner: marshal::get_member_id(&mut payload)?,
            },
            content_tag::LOCK_TOKEN => ReplicatedContent::LockToken {
                candidate_id: marshal::get_u32(&mut payload)?,
                owner: marshal::get_member_id(&mut payload)?,
            },
            content_tag::MEMBER_SET => {
                let n = marshal::get_u32(&mut payload)?;
                let mut members = BTreeSet::new();
                for _ in 0..n {
                    members.insert(marshal::get_member_id(&mut payload)?);
                }
                ReplicatedContent::MemberSet { members }
            }
            content_tag::SESSION_TRACK => ReplicatedContent::SessionTrack {
                session: GlobalSession::unmarshal(&mut payload)?,
            },
            // Forward compatibility: the payload was already consumed by
            // the length prefix, the entry applies as a no-op.
            other => ReplicatedContent::Unknown { tag: other },
        };
        Ok(content)
    }
}

impl MessageSummary for ReplicatedContent {
    fn summary(&self) -> String {
        match self {
            ReplicatedContent::Dummy { size } => format!("dummy({}B)", size),
            ReplicatedContent::Transaction { tx } => format!("tx({}B)", tx.len()),
            ReplicatedContent::TokenCreate { name, proposed_id } => {
                format!("token-create({}->{})", name, proposed_id)
            }
            ReplicatedContent::IdAllocation {
                id_type,
                range_start,
                range_length,
                ..
            } => format!("id-alloc({} {}+{})", id_type, range_start, range_length),
            ReplicatedContent::LockToken { candidate_id, owner } => {
                format!("lock-token({} by {})", candidate_id, owner)
            }
            ReplicatedContent::MemberSet { members } => format!("member-set(n={})", members.len()),
            ReplicatedContent::SessionTrack { session } => format!("session-track({})", session),
            ReplicatedContent::Unknown { tag } => format!("unknown(0x{:02x})", tag),
        }
    }
}

/// A client operation bound to its session identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributedOperation {
    pub global_session: GlobalSession,
    pub local_op: LocalOperationId,
    pub content: ReplicatedContent,
}

impl DistributedOperation {
    pub fn new(
        global_session: GlobalSession,
        local_op: LocalOperationId,
        content: ReplicatedContent,
    ) -> Self {
        Self {
            global_session,
            local_op,
            content,
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        self.global_session.marshal(buf);
        self.local_op.marshal(buf);
        self.content.marshal(buf);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        Ok(Self {
            global_session: GlobalSession::unmarshal(buf)?,
            local_op: LocalOperationId::unmarshal(buf)?,
            content: ReplicatedContent::unmarshal(buf)?,
        })
    }
}

impl MessageSummary for DistributedOperation {
    fn summary(&self) -> String {
        format!(
            "op {} {} {}",
            self.global_session,
            self.local_op,
            self.content.summary()
        )
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A client operation.
    Operation(DistributedOperation),
}

impl EntryPayload {
    pub fn size_bytes(&self) -> u64 {
        match self {
            EntryPayload::Blank => 0,
            EntryPayload::Operation(op) => op.content.size_bytes(),
        }
    }

    /// Marshal into the opaque content bytes the durable store records.
    pub fn marshal_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            EntryPayload::Blank => buf.put_u8(0),
            EntryPayload::Operation(op) => {
                buf.put_u8(1);
                op.marshal(&mut buf);
            }
        }
        buf.freeze()
    }

    pub fn unmarshal_from_bytes(mut content: Bytes) -> MarshalResult<Self> {
        match marshal::get_u8(&mut content)? {
            0 => Ok(EntryPayload::Blank),
            1 => Ok(EntryPayload::Operation(DistributedOperation::unmarshal(&mut content)?)),
            _ => Err(ProtocolViolation::Malformed("invalid entry payload kind")),
        }
    }
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Operation(op) => op.summary(),
        }
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[LogEntry] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

/// The result the applier produced for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppliedResult {
    /// The operation was applied and has no richer result.
    Ack,
    /// A transaction was committed at this transaction id.
    TxCommitted { tx_id: u64 },
    /// The id the token registry bound the name to. This may differ from
    /// the proposed id when the name was already registered.
    TokenId(u32),
    /// An id range was granted to the requesting owner.
    IdRangeAllocated {
        id_type: IdType,
        start: u64,
        length: u32,
    },
    /// The id allocation request was stale and nothing was allocated.
    IdAllocationRejected,
    /// The outcome of a lock token acquisition attempt.
    LockToken { candidate_id: u32, granted: bool },
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    fn op(content: ReplicatedContent) -> DistributedOperation {
        DistributedOperation::new(
            GlobalSession::new(MemberId::from_u128(7)),
            LocalOperationId {
                local_session_id: 3,
                sequence_number: 11,
            },
            content,
        )
    }

    #[test]
    fn operation_round_trip() {
        let original = op(ReplicatedContent::IdAllocation {
            id_type: IdType(2),
            range_start: 4096,
            range_length: 1024,
            owner: MemberId::from_u128(9),
        });
        let mut buf = BytesMut::new();
        original.marshal(&mut buf);
        let decoded = DistributedOperation::unmarshal(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn member_set_round_trip() {
        let original = op(ReplicatedContent::MemberSet {
            members: btreeset![MemberId::from_u128(1), MemberId::from_u128(2)],
        });
        let mut buf = BytesMut::new();
        original.marshal(&mut buf);
        let decoded = DistributedOperation::unmarshal(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_content_tag_is_skipped() {
        let mut buf = BytesMut::new();
        // A content blob written by some future version: tag 0x7f with an
        // eight byte payload.
        buf.put_u32(8);
        buf.put_u8(0x7f);
        buf.put_slice(&[0u8; 8]);
        buf.put_u8(0xaa); // trailing byte must remain readable

        let mut read = buf.freeze();
        let content = ReplicatedContent::unmarshal(&mut read).unwrap();
        assert_eq!(content, ReplicatedContent::Unknown { tag: 0x7f });
        assert_eq!(read.get_u8(), 0xaa);
    }

    #[test]
    fn entry_payload_bytes_round_trip() {
        let payload = EntryPayload::Operation(op(ReplicatedContent::TokenCreate {
            name: "label".into(),
            proposed_id: 42,
        }));
        let bytes = payload.marshal_to_bytes();
        assert_eq!(EntryPayload::unmarshal_from_bytes(bytes).unwrap(), payload);

        let blank = EntryPayload::Blank.marshal_to_bytes();
        assert_eq!(
            EntryPayload::unmarshal_from_bytes(blank).unwrap(),
            EntryPayload::Blank
        );
    }

    #[test]
    fn dummy_size_drives_cache_accounting() {
        let content = ReplicatedContent::Dummy { size: 512 };
        assert_eq!(content.size_bytes(), 512);
    }
}
