//! Local replication sessions.
//!
//! A member owns one global session per process lifetime; operation ids
//! are handed out from pooled local sessions, each a strictly sequential
//! stream of sequence numbers. Retries of an operation reuse its id,
//! which is what makes the session tracker's duplicate suppression work.

use std::sync::Mutex;

use crate::operation::GlobalSession;
use crate::operation::LocalOperationId;
use crate::MemberId;

/// A leased local session. Returned to the pool on drop via
/// [`LocalSessionPool::release`].
#[derive(Debug)]
pub struct LocalSession {
    pub local_session_id: u64,
    next_sequence_number: u64,
}

impl LocalSession {
    /// The operation id for the next operation of this session.
    pub fn next_operation_id(&mut self) -> LocalOperationId {
        let op = LocalOperationId {
            local_session_id: self.local_session_id,
            sequence_number: self.next_sequence_number,
        };
        self.next_sequence_number += 1;
        op
    }
}

/// Pools local sessions under one global session.
pub struct LocalSessionPool {
    global_session: GlobalSession,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: Vec<LocalSession>,
    next_id: u64,
}

impl LocalSessionPool {
    pub fn new(owner: MemberId) -> Self {
        Self {
            global_session: GlobalSession::new(owner),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn global_session(&self) -> GlobalSession {
        self.global_session
    }

    /// Lease a local session, creating a fresh one when the pool is
    /// empty.
    pub fn acquire(&self) -> LocalSession {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.idle.pop() {
            return session;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        LocalSession {
            local_session_id: id,
            next_sequence_number: 0,
        }
    }

    /// Return a leased session so its sequence stream can be reused.
    pub fn release(&self, session: LocalSession) {
        self.inner.lock().unwrap().idle.push(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_hand_out_sequential_ids() {
        let pool = LocalSessionPool::new(MemberId::from_u128(1));
        let mut session = pool.acquire();
        let first = session.next_operation_id();
        let second = session.next_operation_id();
        assert_eq!(first.sequence_number, 0);
        assert_eq!(second.sequence_number, 1);
        assert_eq!(first.local_session_id, second.local_session_id);
    }

    #[test]
    fn released_sessions_are_reused_with_their_sequence() {
        let pool = LocalSessionPool::new(MemberId::from_u128(1));
        let mut session = pool.acquire();
        session.next_operation_id();
        let id = session.local_session_id;
        pool.release(session);

        let mut reused = pool.acquire();
        assert_eq!(reused.local_session_id, id);
        assert_eq!(reused.next_operation_id().sequence_number, 1);
    }

    #[test]
    fn concurrent_acquires_get_distinct_sessions() {
        let pool = LocalSessionPool::new(MemberId::from_u128(1));
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.local_session_id, b.local_session_id);
    }
}
