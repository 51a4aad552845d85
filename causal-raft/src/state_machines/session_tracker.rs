//! The global session tracker.
//!
//! Records the highest applied sequence number per `(global session,
//! local session)` so duplicate client retries are applied exactly once.
//! A bounded window of recent results is cached per local session, so a
//! retry of any operation still inside the window is answered with its
//! original outcome, even when later operations have applied since.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use uuid::Uuid;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::AppliedResult;
use crate::operation::GlobalSession;
use crate::operation::LocalOperationId;
use crate::state_machines::marshal_applied_result;
use crate::state_machines::unmarshal_applied_result;

/// Results retained per local session for duplicate suppression.
pub const RESULT_CACHE_DEPTH: usize = 32;

/// The verdict for one incoming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionValidation {
    /// The next expected sequence number; apply it.
    Valid,
    /// Already applied; do not reapply. Carries the cached result, absent
    /// only when the operation has aged out of the result window.
    Duplicate { result: Option<AppliedResult> },
    /// The sequence number skips ahead; reject without applying.
    Gap,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LocalSessionState {
    last_sequence_number: u64,
    /// Results of the most recent operations, oldest first; the back
    /// entry belongs to `last_sequence_number`.
    recent_results: VecDeque<AppliedResult>,
}

impl LocalSessionState {
    fn cached_result(&self, sequence_number: u64) -> Option<AppliedResult> {
        let age = self.last_sequence_number - sequence_number;
        let len = self.recent_results.len() as u64;
        if age >= len {
            return None;
        }
        self.recent_results.get((len - 1 - age) as usize).cloned()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct GlobalSessionState {
    owner: u128,
    // Keyed by local session id; each local session is a strictly
    // sequential stream of operations.
    locals: BTreeMap<u64, LocalSessionState>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionTracker {
    sessions: BTreeMap<Uuid, GlobalSessionState>,
}

impl SessionTracker {
    /// Register a session before its first operation.
    pub fn track(&mut self, session: &GlobalSession) {
        self.sessions.entry(session.id).or_insert_with(|| GlobalSessionState {
            owner: session.owner.as_u128(),
            locals: BTreeMap::new(),
        });
    }

    /// Decide whether an operation should be applied.
    pub fn validate(&self, session: &GlobalSession, op: LocalOperationId) -> SessionValidation {
        let local = self
            .sessions
            .get(&session.id)
            .and_then(|s| s.locals.get(&op.local_session_id));
        match local {
            None => {
                if op.sequence_number == 0 {
                    SessionValidation::Valid
                } else {
                    SessionValidation::Gap
                }
            }
            Some(state) => {
                if op.sequence_number == state.last_sequence_number + 1 {
                    SessionValidation::Valid
                } else if op.sequence_number <= state.last_sequence_number {
                    SessionValidation::Duplicate {
                        result: state.cached_result(op.sequence_number),
                    }
                } else {
                    SessionValidation::Gap
                }
            }
        }
    }

    /// Record an applied operation and its result.
    pub fn record(&mut self, session: &GlobalSession, op: LocalOperationId, result: AppliedResult) {
        let global = self.sessions.entry(session.id).or_insert_with(|| GlobalSessionState {
            owner: session.owner.as_u128(),
            locals: BTreeMap::new(),
        });
        let local = global.locals.entry(op.local_session_id).or_default();
        local.last_sequence_number = op.sequence_number;
        local.recent_results.push_back(result);
        while local.recent_results.len() > RESULT_CACHE_DEPTH {
            local.recent_results.pop_front();
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sessions.len() as u32);
        for (id, global) in &self.sessions {
            buf.put_u128(id.as_u128());
            buf.put_u128(global.owner);
            buf.put_u32(global.locals.len() as u32);
            for (local_id, local) in &global.locals {
                buf.put_u64(*local_id);
                buf.put_u64(local.last_sequence_number);
                buf.put_u32(local.recent_results.len() as u32);
                for result in &local.recent_results {
                    marshal_applied_result(result, buf);
                }
            }
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let n_sessions = marshal::get_u32(buf)?;
        let mut sessions = BTreeMap::new();
        for _ in 0..n_sessions {
            marshal::need(buf, 32)?;
            let id = Uuid::from_u128(buf.get_u128());
            let owner = buf.get_u128();
            let n_locals = marshal::get_u32(buf)?;
            let mut locals = BTreeMap::new();
            for _ in 0..n_locals {
                let local_id = marshal::get_u64(buf)?;
                let last_sequence_number = marshal::get_u64(buf)?;
                let n_results = marshal::get_u32(buf)?;
                let mut recent_results = VecDeque::with_capacity(n_results as usize);
                for _ in 0..n_results {
                    recent_results.push_back(unmarshal_applied_result(buf)?);
                }
                locals.insert(
                    local_id,
                    LocalSessionState {
                        last_sequence_number,
                        recent_results,
                    },
                );
            }
            sessions.insert(id, GlobalSessionState { owner, locals });
        }
        Ok(Self { sessions })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::MemberId;

    fn op(local: u64, seq: u64) -> LocalOperationId {
        LocalOperationId {
            local_session_id: local,
            sequence_number: seq,
        }
    }

    #[test]
    fn sequential_operations_validate() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));

        assert_eq!(tracker.validate(&session, op(0, 0)), SessionValidation::Valid);
        tracker.record(&session, op(0, 0), AppliedResult::Ack);
        assert_eq!(tracker.validate(&session, op(0, 1)), SessionValidation::Valid);
    }

    #[test]
    fn duplicate_returns_the_cached_result() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        tracker.record(&session, op(0, 0), AppliedResult::TokenId(5));

        assert_eq!(
            tracker.validate(&session, op(0, 0)),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(5))
            }
        );
    }

    #[test]
    fn stale_duplicate_still_answers_from_the_cache() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        tracker.record(&session, op(0, 0), AppliedResult::TokenId(5));
        tracker.record(&session, op(0, 1), AppliedResult::TokenId(6));
        tracker.record(&session, op(0, 2), AppliedResult::Ack);

        // A retry of op #0 arrives after two further operations applied;
        // the original result must still come back.
        assert_eq!(
            tracker.validate(&session, op(0, 0)),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(5))
            }
        );
        assert_eq!(
            tracker.validate(&session, op(0, 1)),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TokenId(6))
            }
        );
    }

    #[test]
    fn results_age_out_of_the_bounded_window() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        for seq in 0..(RESULT_CACHE_DEPTH as u64 + 1) {
            tracker.record(&session, op(0, seq), AppliedResult::TxCommitted { tx_id: seq });
        }

        // Sequence 0 fell out of the window; the newest entries remain.
        assert_eq!(
            tracker.validate(&session, op(0, 0)),
            SessionValidation::Duplicate { result: None }
        );
        assert_eq!(
            tracker.validate(&session, op(0, 1)),
            SessionValidation::Duplicate {
                result: Some(AppliedResult::TxCommitted { tx_id: 1 })
            }
        );
    }

    #[test]
    fn skipping_ahead_is_a_gap() {
        let tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        assert_eq!(tracker.validate(&session, op(0, 5)), SessionValidation::Gap);
    }

    #[test]
    fn local_sessions_are_independent() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        tracker.record(&session, op(0, 0), AppliedResult::Ack);

        assert_eq!(tracker.validate(&session, op(1, 0)), SessionValidation::Valid);
    }

    #[test]
    fn marshal_round_trip() {
        let mut tracker = SessionTracker::default();
        let session = GlobalSession::new(MemberId::from_u128(1));
        tracker.record(&session, op(0, 3), AppliedResult::TokenId(9));
        tracker.record(&session, op(0, 4), AppliedResult::Ack);
        tracker.record(&session, op(1, 7), AppliedResult::Ack);

        let mut buf = BytesMut::new();
        tracker.marshal(&mut buf);
        assert_eq!(SessionTracker::unmarshal(&mut buf.freeze()).unwrap(), tracker);
    }
}
