//! Tracks in-flight replicated operations through to their applied
//! results.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::operation::AppliedResult;
use crate::operation::GlobalSession;
use crate::operation::LocalOperationId;

#[derive(Debug, Default)]
struct ProgressState {
    replicated: bool,
    result: Option<AppliedResult>,
    aborted: bool,
}

/// The progress of one operation. Waiters park on the embedded notify and
/// re-check state after every wakeup, so spurious wakeups (for example
/// from `trigger_replication_event`) are harmless.
#[derive(Debug, Default)]
pub struct Progress {
    state: Mutex<ProgressState>,
    notify: Notify,
}

impl Progress {
    pub fn is_replicated(&self) -> bool {
        self.state.lock().unwrap().replicated
    }

    pub fn mark_replicated(&self) {
        self.state.lock().unwrap().replicated = true;
        self.notify.notify_waiters();
    }

    fn set_result(&self, result: AppliedResult) {
        let mut state = self.state.lock().unwrap();
        state.replicated = true;
        state.result = Some(result);
        drop(state);
        self.notify.notify_waiters();
    }

    fn set_aborted(&self) {
        self.state.lock().unwrap().aborted = true;
        self.notify.notify_waiters();
    }

    /// Wait until the applier has produced a result, or the entry is
    /// aborted.
    pub async fn result(&self) -> Option<AppliedResult> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a wakeup between the check and
            // the await is not lost.
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if let Some(result) = &state.result {
                    return Some(result.clone());
                }
                if state.aborted {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Thread-safe map of in-flight operations, keyed by local operation id.
///
/// Operations carrying a foreign global session are ignored: results from
/// another member's replicator must not complete ours.
pub struct ProgressTracker {
    global_session: GlobalSession,
    entries: Mutex<HashMap<LocalOperationId, Arc<Progress>>>,
}

impl ProgressTracker {
    pub fn new(global_session: GlobalSession) -> Self {
        Self {
            global_session,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn global_session(&self) -> GlobalSession {
        self.global_session
    }

    /// Create a progress entry for a new operation.
    pub fn start(&self, op: LocalOperationId) -> Arc<Progress> {
        let progress = Arc::new(Progress::default());
        self.entries.lock().unwrap().insert(op, progress.clone());
        progress
    }

    /// Mark an operation as locally appended and committed.
    pub fn track_replication(&self, session: &GlobalSession, op: LocalOperationId) {
        if *session != self.global_session {
            return;
        }
        if let Some(progress) = self.entries.lock().unwrap().get(&op) {
            progress.mark_replicated();
        }
    }

    /// Deliver the applier's result for an operation and complete its
    /// future.
    pub fn track_result(&self, session: &GlobalSession, op: LocalOperationId, result: AppliedResult) {
        if *session != self.global_session {
            return;
        }
        if let Some(progress) = self.entries.lock().unwrap().get(&op) {
            progress.set_result(result);
        }
    }

    /// Remove an entry, completing its future exceptionally.
    pub fn abort(&self, op: LocalOperationId) {
        if let Some(progress) = self.entries.lock().unwrap().remove(&op) {
            progress.set_aborted();
        }
    }

    /// Remove a completed entry after its result was delivered.
    pub fn finish(&self, op: LocalOperationId) {
        self.entries.lock().unwrap().remove(&op);
    }

    /// Wake all waiters so they can re-examine the cluster, used on
    /// leader changes.
    pub fn trigger_replication_event(&self) {
        let entries = self.entries.lock().unwrap();
        for progress in entries.values() {
            progress.notify.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::MemberId;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(GlobalSession::new(MemberId::from_u128(1)))
    }

    fn op(seq: u64) -> LocalOperationId {
        LocalOperationId {
            local_session_id: 0,
            sequence_number: seq,
        }
    }

    #[tokio::test]
    async fn replication_then_result_completes_the_future() {
        let tracker = tracker();
        let session = tracker.global_session();
        let progress = tracker.start(op(0));

        let waiter = {
            let progress = progress.clone();
            tokio::spawn(async move { progress.result().await })
        };

        tracker.track_replication(&session, op(0));
        assert!(progress.is_replicated());
        tracker.track_result(&session, op(0), AppliedResult::Ack);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("result future did not complete")
            .unwrap();
        assert_eq!(result, Some(AppliedResult::Ack));
    }

    #[tokio::test]
    async fn abort_completes_exceptionally() {
        let tracker = tracker();
        let progress = tracker.start(op(0));
        tracker.abort(op(0));
        assert_eq!(progress.result().await, None);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn foreign_sessions_are_ignored() {
        let tracker = tracker();
        let foreign = GlobalSession::new(MemberId::from_u128(2));
        let progress = tracker.start(op(0));

        tracker.track_result(&foreign, op(0), AppliedResult::Ack);
        assert!(!progress.is_replicated());
    }
}
