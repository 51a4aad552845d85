//! The replicated state machines fed by the applier.
//!
//! Each machine applies committed content deterministically and can
//! marshal itself into a snapshot blob. Machines are not re-entrant;
//! application is single-threaded on the applier task.

pub mod id_allocation;
pub mod lock_token;
pub mod session_tracker;
pub mod token_registry;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Result;
use bytes::Bytes;
use bytes::BytesMut;

use crate::marshal;
use crate::operation::AppliedResult;
use crate::operation::DistributedOperation;
use crate::operation::EntryPayload;
use crate::operation::LogEntry;
use crate::operation::ReplicatedContent;
use crate::storage::CoreSnapshot;
use crate::LogId;
use crate::MemberId;
use crate::MessageSummary;

use self::id_allocation::IdAllocationMachine;
use self::lock_token::LockTokenMachine;
use self::session_tracker::SessionTracker;
use self::session_tracker::SessionValidation;
use self::token_registry::TokenRegistry;

/// Snapshot blob keys, one per state machine.
pub mod kind {
    pub const ID_ALLOCATION: u8 = 1;
    pub const LOCK_TOKEN: u8 = 2;
    pub const TOKEN_REGISTRY: u8 = 3;
    pub const SESSION_TRACKER: u8 = 4;
}

/// The seam through which committed transactions reach the underlying
/// database engine.
pub trait TransactionApplier: Send + 'static {
    /// Apply one committed transaction. `tx_id` is the transaction's
    /// position in the replicated log; recovery replays from the last
    /// flushed position, so appliers must tolerate replays of
    /// already-applied ids.
    fn apply(&mut self, tx: &Bytes, tx_id: u64) -> Result<()>;
}

/// A transaction applier that only counts, used where no engine is wired
/// in (tests, tooling).
#[derive(Debug, Default)]
pub struct NullTransactionApplier {
    pub applied: u64,
    pub last_tx_id: u64,
}

impl TransactionApplier for NullTransactionApplier {
    fn apply(&mut self, _tx: &Bytes, tx_id: u64) -> Result<()> {
        self.applied += 1;
        self.last_tx_id = tx_id;
        Ok(())
    }
}

/// The outcome of applying one entry, as far as progress delivery is
/// concerned.
pub struct Applied {
    pub operation: Option<(crate::operation::GlobalSession, crate::operation::LocalOperationId)>,
    pub result: Option<AppliedResult>,
}

/// All state machines of one member, plus the applied-position marker.
pub struct CoreStateMachines {
    id_allocation: IdAllocationMachine,
    lock_token: LockTokenMachine,
    tokens: TokenRegistry,
    sessions: SessionTracker,
    members: BTreeSet<MemberId>,
    tx_applier: Box<dyn TransactionApplier>,
    last_applied: LogId,
}

impl CoreStateMachines {
    pub fn new(initial_members: BTreeSet<MemberId>, tx_applier: Box<dyn TransactionApplier>) -> Self {
        Self {
            id_allocation: IdAllocationMachine::default(),
            lock_token: LockTokenMachine::default(),
            tokens: TokenRegistry::default(),
            sessions: SessionTracker::default(),
            members: initial_members,
            tx_applier,
            last_applied: LogId::default(),
        }
    }

    pub fn last_applied(&self) -> LogId {
        self.last_applied
    }

    pub fn members(&self) -> &BTreeSet<MemberId> {
        &self.members
    }

    /// Apply one committed entry. `last_applied` advances atomically with
    /// the state change: both live behind the same `&mut self` and are
    /// flushed together.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Result<Applied> {
        debug_assert_eq!(entry.log_id.index, self.last_applied.index + 1);
        let applied = match &entry.payload {
            EntryPayload::Blank => Applied {
                operation: None,
                result: None,
            },
            EntryPayload::Operation(op) => self.apply_operation(op, entry.log_id)?,
        };
        self.last_applied = entry.log_id;
        Ok(applied)
    }

    fn apply_operation(&mut self, op: &DistributedOperation, log_id: LogId) -> Result<Applied> {
        match self.sessions.validate(&op.global_session, op.local_op) {
            SessionValidation::Valid => {}
            SessionValidation::Duplicate { result } => {
                tracing::debug!(op = %op.summary(), "duplicate operation applied as no-op");
                return Ok(Applied {
                    operation: Some((op.global_session, op.local_op)),
                    result,
                });
            }
            SessionValidation::Gap => {
                tracing::warn!(op = %op.summary(), "out-of-order operation rejected as no-op");
                return Ok(Applied {
                    operation: None,
                    result: None,
                });
            }
        }

        let result = match &op.content {
            ReplicatedContent::Dummy { .. } => AppliedResult::Ack,
            ReplicatedContent::Transaction { tx } => {
                self.tx_applier.apply(tx, log_id.index)?;
                AppliedResult::TxCommitted { tx_id: log_id.index }
            }
            ReplicatedContent::TokenCreate { name, proposed_id } => {
                self.tokens.apply(name, *proposed_id)
            }
            ReplicatedContent::IdAllocation {
                id_type,
                range_start,
                range_length,
                owner,
            } => self
                .id_allocation
                .apply(*id_type, *range_start, *range_length, *owner),
            ReplicatedContent::LockToken { candidate_id, owner } => {
                self.lock_token.apply(*candidate_id, *owner)
            }
            ReplicatedContent::MemberSet { members } => {
                self.members = members.clone();
                AppliedResult::Ack
            }
            ReplicatedContent::SessionTrack { session } => {
                self.sessions.track(session);
                AppliedResult::Ack
            }
            ReplicatedContent::Unknown { tag } => {
                tracing::debug!(tag, "content with unknown tag applied as no-op");
                AppliedResult::Ack
            }
        };

        self.sessions
            .record(&op.global_session, op.local_op, result.clone());
        Ok(Applied {
            operation: Some((op.global_session, op.local_op)),
            result: Some(result),
        })
    }

    /// Capture a snapshot of every machine at the current applied
    /// position.
    pub fn snapshot(&self) -> CoreSnapshot {
        let mut app_states = BTreeMap::new();

        let mut buf = BytesMut::new();
        self.id_allocation.marshal(&mut buf);
        app_states.insert(kind::ID_ALLOCATION, buf.freeze());

        let mut buf = BytesMut::new();
        self.lock_token.marshal(&mut buf);
        app_states.insert(kind::LOCK_TOKEN, buf.freeze());

        let mut buf = BytesMut::new();
        self.tokens.marshal(&mut buf);
        app_states.insert(kind::TOKEN_REGISTRY, buf.freeze());

        let mut buf = BytesMut::new();
        self.sessions.marshal(&mut buf);
        app_states.insert(kind::SESSION_TRACKER, buf.freeze());

        CoreSnapshot {
            prev_index: self.last_applied.index,
            prev_term: self.last_applied.term,
            members: self.members.clone(),
            app_states,
        }
    }

    /// Replace all machine state from an installed snapshot. Blobs with
    /// unknown kinds are ignored.
    pub fn install(&mut self, snapshot: &CoreSnapshot) -> Result<()> {
        for (blob_kind, blob) in &snapshot.app_states {
            let mut read = blob.clone();
            match *blob_kind {
                kind::ID_ALLOCATION => self.id_allocation = IdAllocationMachine::unmarshal(&mut read)?,
                kind::LOCK_TOKEN => self.lock_token = LockTokenMachine::unmarshal(&mut read)?,
                kind::TOKEN_REGISTRY => self.tokens = TokenRegistry::unmarshal(&mut read)?,
                kind::SESSION_TRACKER => self.sessions = SessionTracker::unmarshal(&mut read)?,
                other => tracing::debug!(kind = other, "ignoring unknown snapshot state blob"),
            }
        }
        self.members = snapshot.members.clone();
        self.last_applied = snapshot.log_id();
        Ok(())
    }
}

pub(crate) fn marshal_applied_result(result: &AppliedResult, buf: &mut BytesMut) {
    use bytes::BufMut;
    match result {
        AppliedResult::Ack => buf.put_u8(0),
        AppliedResult::TxCommitted { tx_id } => {
            buf.put_u8(1);
            buf.put_u64(*tx_id);
        }
        AppliedResult::TokenId(id) => {
            buf.put_u8(2);
            buf.put_u32(*id);
        }
        AppliedResult::IdRangeAllocated {
            id_type,
            start,
            length,
        } => {
            buf.put_u8(3);
            buf.put_u16(id_type.0);
            buf.put_u64(*start);
            buf.put_u32(*length);
        }
        AppliedResult::IdAllocationRejected => buf.put_u8(4),
        AppliedResult::LockToken {
            candidate_id,
            granted,
        } => {
            buf.put_u8(5);
            buf.put_u32(*candidate_id);
            marshal::put_bool(buf, *granted);
        }
    }
}

pub(crate) fn unmarshal_applied_result(
    buf: &mut impl bytes::Buf,
) -> crate::marshal::MarshalResult<AppliedResult> {
    use crate::operation::IdType;
    Ok(match marshal::get_u8(buf)? {
        0 => AppliedResult::Ack,
        1 => AppliedResult::TxCommitted {
            tx_id: marshal::get_u64(buf)?,
        },
        2 => AppliedResult::TokenId(marshal::get_u32(buf)?),
        3 => AppliedResult::IdRangeAllocated {
            id_type: IdType(marshal::get_u16(buf)?),
            start: marshal::get_u64(buf)?,
            length: marshal::get_u32(buf)?,
        },
        4 => AppliedResult::IdAllocationRejected,
        5 => AppliedResult::LockToken {
            candidate_id: marshal::get_u32(buf)?,
            granted: marshal::get_bool(buf)?,
        },
        _ => {
            return Err(crate::error::ProtocolViolation::Malformed(
                "invalid applied result tag",
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::operation::GlobalSession;
    use crate::operation::IdType;
    use crate::operation::LocalOperationId;

    fn entry(index: u64, session: GlobalSession, seq: u64, content: ReplicatedContent) -> LogEntry {
        LogEntry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Operation(DistributedOperation::new(
                session,
                LocalOperationId {
                    local_session_id: 0,
                    sequence_number: seq,
                },
                content,
            )),
        }
    }

    fn machines() -> CoreStateMachines {
        CoreStateMachines::new(
            btreeset![MemberId::from_u128(1)],
            Box::new(NullTransactionApplier::default()),
        )
    }

    #[test]
    fn applies_in_order_and_advances_last_applied() {
        let mut sm = machines();
        let session = GlobalSession::new(MemberId::from_u128(1));

        let applied = sm
            .apply_entry(&entry(1, session, 0, ReplicatedContent::Dummy { size: 1 }))
            .unwrap();
        assert_eq!(applied.result, Some(AppliedResult::Ack));
        assert_eq!(sm.last_applied(), LogId::new(1, 1));
    }

    #[test]
    fn duplicate_sequence_is_applied_once_with_original_result() {
        let mut sm = machines();
        let session = GlobalSession::new(MemberId::from_u128(1));
        let content = ReplicatedContent::TokenCreate {
            name: "label".into(),
            proposed_id: 7,
        };

        let first = sm.apply_entry(&entry(1, session, 0, content.clone())).unwrap();
        assert_eq!(first.result, Some(AppliedResult::TokenId(7)));

        // The retry carries the same (session, seq); the registry must not
        // be touched a second time.
        let second = sm.apply_entry(&entry(2, session, 0, content)).unwrap();
        assert_eq!(second.result, Some(AppliedResult::TokenId(7)));
    }

    #[test]
    fn snapshot_install_round_trip() {
        let mut sm = machines();
        let session = GlobalSession::new(MemberId::from_u128(1));
        sm.apply_entry(&entry(
            1,
            session,
            0,
            ReplicatedContent::IdAllocation {
                id_type: IdType(3),
                range_start: 0,
                range_length: 128,
                owner: MemberId::from_u128(1),
            },
        ))
        .unwrap();
        sm.apply_entry(&entry(
            2,
            session,
            1,
            ReplicatedContent::MemberSet {
                members: btreeset![MemberId::from_u128(1), MemberId::from_u128(2)],
            },
        ))
        .unwrap();

        let snapshot = sm.snapshot();
        assert_eq!(snapshot.prev_index, 2);

        let mut restored = machines();
        restored.install(&snapshot).unwrap();
        assert_eq!(restored.last_applied(), LogId::new(1, 2));
        assert_eq!(restored.members().len(), 2);

        // The restored session tracker must still suppress the duplicate.
        let dup = restored
            .apply_entry(&entry(
                3,
                session,
                1,
                ReplicatedContent::MemberSet {
                    members: btreeset![MemberId::from_u128(1)],
                },
            ))
            .unwrap();
        assert_eq!(dup.result, Some(AppliedResult::Ack));
        assert_eq!(restored.members().len(), 2, "duplicate must not reapply");
    }
}
