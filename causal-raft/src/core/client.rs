//! Leader-side handling of client operations: append, batch dispatch to
//! the replication streams, and commit advancement.

use std::sync::Arc;
use std::time::Duration;

use crate::core::ClientWriteResponse;
use crate::core::ClientWriteTx;
use crate::core::LeaderState;
use crate::error::RaftResult;
use crate::error::ReplicationError;
use crate::operation::DistributedOperation;
use crate::operation::EntryPayload;
use crate::operation::LogEntry;
use crate::operation::ReplicatedContent;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::timer::TimerName;
use crate::LogId;
use crate::MessageSummary;
use crate::Outbound;

/// A locally appended entry awaiting cluster commitment, with the client
/// response channel when a client is waiting on it.
pub(crate) struct AwaitingCommit {
    pub log_id: LogId,
    pub tx: Option<ClientWriteTx>,
}

impl<'a, L: LogStore, S: StableStore, N: Outbound> LeaderState<'a, L, S, N> {
    /// Commit an entry of the new term as part of assuming leadership.
    ///
    /// Entries of prior terms may only be committed transitively beneath
    /// an entry of the current term, so the leader creates one
    /// immediately.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        self.awaiting_committed.push(AwaitingCommit {
            log_id: entry.log_id,
            tx: None,
        });
        self.replicate_entry(entry).await
    }

    /// Handle one client write request.
    #[tracing::instrument(level = "debug", skip(self, op, tx), fields(op = %op.summary()))]
    pub(super) async fn handle_client_write(
        &mut self,
        op: DistributedOperation,
        tx: ClientWriteTx,
    ) -> RaftResult<()> {
        let is_member_set = matches!(op.content, ReplicatedContent::MemberSet { .. });
        let entry = match self.append_payload_to_log(EntryPayload::Operation(op)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ReplicationError::ShuttingDown));
                return Err(err);
            }
        };
        if is_member_set {
            // The appended member set is already adopted by the core;
            // align the replication streams with it.
            self.update_replication_streams();
        }
        self.awaiting_committed.push(AwaitingCommit {
            log_id: entry.log_id,
            tx: Some(tx),
        });
        self.replicate_entry(entry).await
    }

    /// Assign the next log position to a payload and append it durably.
    async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Arc<LogEntry>> {
        let entry = Arc::new(LogEntry {
            log_id: LogId {
                term: self.core.current_term,
                index: self.core.last_log_id.index + 1,
            },
            payload,
        });
        self.core.observe_membership_entries(std::slice::from_ref(&entry));
        self.core
            .log
            .append(vec![entry.clone()])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        self.core.report_metrics();
        Ok(entry)
    }

    /// Queue an appended entry for replication.
    ///
    /// Entries are coalesced: the batch is flushed to the streams when it
    /// reaches the payload bound or when the append-batch timer fires,
    /// whichever comes first. A single-member cluster commits directly.
    async fn replicate_entry(&mut self, entry: Arc<LogEntry>) -> RaftResult<()> {
        if self.nodes.is_empty() {
            self.core.advance_commit(entry.log_id.index, entry.log_id.term);
            self.drain_committed();
            self.core.report_metrics();
            return Ok(());
        }

        let was_empty = self.pending_dispatch.is_empty();
        self.pending_dispatch.push(entry);
        if self.pending_dispatch.len() as u64 >= self.core.config.max_payload_entries {
            self.dispatch_pending();
        } else if was_empty {
            self.core.timers.set(
                TimerName::AppendBatch,
                self.core.config.append_batch_delay(),
                Duration::ZERO,
            );
        }
        Ok(())
    }

    /// Flush the pending batch to every replication stream.
    pub(super) fn dispatch_pending(&mut self) {
        if self.pending_dispatch.is_empty() {
            return;
        }
        self.core.timers.cancel(TimerName::AppendBatch);
        let entries = std::mem::take(&mut self.pending_dispatch);
        for node in self.nodes.values() {
            let _ = node.stream.repl_tx.send(RaftEvent::Replicate {
                entries: entries.clone(),
                commit_index: self.core.commit_index,
                commit_term: self.core.commit_term,
            });
        }
    }

    /// Advance the commit index from the follower match indexes.
    ///
    /// The largest index replicated on a majority commits, but only when
    /// the entry there carries the current term; earlier terms commit
    /// transitively beneath it.
    pub(super) async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let mut indexes: Vec<u64> = self.nodes.values().map(|node| node.matched.index).collect();
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let majority = quorum::majority_of(self.core.membership.len());
        let candidate = match indexes.get(majority - 1) {
            Some(index) => *index,
            None => return Ok(()),
        };
        if candidate <= self.core.commit_index {
            return Ok(());
        }

        let term_at = self
            .core
            .log
            .read_entry_term(candidate)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if term_at != Some(self.core.current_term) {
            tracing::trace!(
                id=%self.core.id,
                candidate,
                ?term_at,
                "majority index carries an older term, not committing directly"
            );
            return Ok(());
        }

        self.core.advance_commit(candidate, self.core.current_term);
        tracing::debug!(id=%self.core.id, commit=candidate, "commit index advanced");

        // Propagate the new commit index to the streams without waiting
        // for the next payload.
        for node in self.nodes.values() {
            let _ = node.stream.repl_tx.send(RaftEvent::UpdateCommitIndex {
                commit_index: self.core.commit_index,
                commit_term: self.core.commit_term,
            });
        }

        self.drain_committed();
        self.core.report_metrics();
        Ok(())
    }

    /// Resolve client requests whose entries are now committed.
    ///
    /// The response resolves commitment only; the applied result reaches
    /// the client separately through the progress tracker once the
    /// applier has consumed the entry.
    pub(super) fn drain_committed(&mut self) {
        let commit_index = self.core.commit_index;
        let mut remaining = Vec::with_capacity(self.awaiting_committed.len());
        for awaiting in self.awaiting_committed.drain(..) {
            if awaiting.log_id.index <= commit_index {
                if let Some(tx) = awaiting.tx {
                    let _ = tx.send(Ok(ClientWriteResponse {
                        log_id: awaiting.log_id,
                    }));
                }
            } else {
                remaining.push(awaiting);
            }
        }
        self.awaiting_committed = remaining;
    }
}
