//! The client-facing replicator.
//!
//! `replicate` wraps a content value in a session-stamped operation,
//! drives it through the Raft core with capped exponential-backoff
//! retries, and resolves with the applier's result. Retries reuse the
//! operation id, so the session tracker applies the operation at most
//! once no matter how often it is resent.

pub mod progress;
pub mod session;

use std::sync::Arc;

use tokio::time::sleep;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::ReplicationError;
use crate::handle::RaftHandle;
use crate::operation::AppliedResult;
use crate::operation::DistributedOperation;
use crate::operation::LocalOperationId;
use crate::operation::ReplicatedContent;
use crate::replicator::progress::ProgressTracker;
use crate::replicator::session::LocalSessionPool;
use crate::MessageSummary;

/// See the module docs.
pub struct Replicator {
    raft: RaftHandle,
    config: Arc<Config>,
    sessions: LocalSessionPool,
    progress: Arc<ProgressTracker>,
}

impl Replicator {
    pub fn new(
        raft: RaftHandle,
        config: Arc<Config>,
        sessions: LocalSessionPool,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            raft,
            config,
            sessions,
            progress,
        }
    }

    /// The progress tracker; the applier delivers results through it.
    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Replicate a content value.
    ///
    /// With `ack_required`, resolves with the applier's result after
    /// local application; without it, resolves as soon as the operation
    /// is committed. Fails fast with `NotLeader` (carrying the leader
    /// hint) when this member does not lead; transient failures are
    /// retried with exponential backoff up to the configured bound.
    /// Cancelling the returned future removes the progress entry, though
    /// the operation may still commit and apply.
    #[tracing::instrument(level = "debug", skip(self, content), fields(content = %content.summary()))]
    pub async fn replicate(
        &self,
        content: ReplicatedContent,
        ack_required: bool,
    ) -> Result<AppliedResult, ReplicationError> {
        let mut session = self.sessions.acquire();
        let op_id = session.next_operation_id();
        let op = DistributedOperation::new(self.sessions.global_session(), op_id, content);

        let progress = self.progress.start(op_id);
        let guard = ProgressGuard {
            tracker: &self.progress,
            op: op_id,
            armed: true,
        };

        let mut backoff = Backoff::new(
            std::time::Duration::from_millis(self.config.replication_retry_base),
            std::time::Duration::from_millis(self.config.replication_retry_upper),
        );
        let mut attempts: u32 = 0;

        loop {
            if progress.is_replicated() {
                break;
            }
            match self.raft.client_write(op.clone()).await {
                Ok(response) => {
                    tracing::debug!(op = %op.summary(), log_id = %response.log_id, "operation committed");
                    self.progress.track_replication(&op.global_session, op_id);
                    break;
                }
                Err(ReplicationError::NotLeader { hint }) => {
                    // The caller redirects to the hinted leader. The
                    // session is abandoned, not released: its consumed
                    // sequence number was never applied, and reusing the
                    // stream would leave a gap the tracker rejects.
                    drop(guard);
                    return Err(ReplicationError::NotLeader { hint });
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.config.replication_max_retries {
                        tracing::warn!(op = %op.summary(), attempts, error = %err, "replication giving up");
                        drop(guard);
                        return Err(ReplicationError::ReplicationFailure { attempts });
                    }
                    let delay = backoff.jittered_delay();
                    backoff.increment();
                    tracing::debug!(op = %op.summary(), attempts, ?delay, "replication retry");
                    sleep(delay).await;
                }
            }
        }

        let outcome = if ack_required {
            match progress.result().await {
                Some(result) => Ok(result),
                None => Err(ReplicationError::Aborted),
            }
        } else {
            Ok(AppliedResult::Ack)
        };

        let mut guard = guard;
        guard.armed = false;
        self.progress.finish(op_id);
        self.sessions.release(session);
        outcome
    }
}

/// Removes the progress entry when a replicate call is cancelled
/// mid-flight. Cancellation cannot stop the operation from committing
/// and applying; it only detaches the local waiter.
struct ProgressGuard<'a> {
    tracker: &'a ProgressTracker,
    op: LocalOperationId,
    armed: bool,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.abort(self.op);
        }
    }
}
