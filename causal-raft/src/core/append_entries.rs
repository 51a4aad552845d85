//! Follower-side append, heartbeat and prune handling.

use std::sync::Arc;

use crate::core::CoreEvent;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::message::AppendEntriesRequest;
use crate::message::AppendResponse;
use crate::message::Heartbeat;
use crate::message::PruneRequest;
use crate::message::RaftMessage;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::MemberId;
use crate::MessageSummary;
use crate::Outbound;

impl<L: LogStore, S: StableStore, N: Outbound> RaftCore<L, S, N> {
    /// Handle an AppendEntries request.
    ///
    /// Accepts iff the request's term is current and the local log holds
    /// `prev_log_id`. On acceptance any conflicting tail above
    /// `prev_log_id` is truncated, the new entries are durably appended,
    /// and the commit index advances to `min(leader_commit, last new
    /// entry)`. Rejections carry the local append index so the leader can
    /// jump its `next_index` down in one step.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        from: MemberId,
        req: AppendEntriesRequest,
    ) -> RaftResult<()> {
        if req.term < self.current_term {
            tracing::debug!(
                id=%self.id, term=self.current_term, req_term=req.term,
                "rejecting append entries from older term"
            );
            return self.send_append_response(from, false, 0).await;
        }

        // A valid leader for the current term.
        self.update_next_election_timeout();
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            self.report_metrics();
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        // The log consistency check.
        if !self.log_holds(req.prev_log_id.index, req.prev_log_id.term).await? {
            tracing::debug!(
                id=%self.id,
                prev=%req.prev_log_id,
                append_index=self.last_log_id.index,
                "log does not hold the request's prev position"
            );
            return self.send_append_response(from, false, 0).await;
        }

        let match_index = if req.entries.is_empty() {
            req.prev_log_id.index
        } else {
            self.append_new_entries(&req).await?
        };

        // Commit advancement is capped by what we actually hold.
        let commit_target = std::cmp::min(req.leader_commit, match_index);
        if commit_target > self.commit_index {
            let commit_term = self
                .log
                .read_entry_term(commit_target)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
                .unwrap_or(0);
            self.advance_commit(commit_target, commit_term);
            self.report_metrics();
        }

        self.send_append_response(from, true, match_index).await
    }

    /// True when the local log holds `(index, term)`.
    async fn log_holds(&mut self, index: u64, term: u64) -> RaftResult<bool> {
        if index == 0 {
            return Ok(true);
        }
        if index > self.last_log_id.index {
            return Ok(false);
        }
        if index < self.log.prev_index() {
            // Below the prune horizon: everything pruned is committed, so
            // a leader speaking about it necessarily agrees with us.
            return Ok(true);
        }
        let local_term = self
            .log
            .read_entry_term(index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(local_term == Some(term))
    }

    /// Truncate any conflicting tail and append the request's entries,
    /// returning the final matched index.
    async fn append_new_entries(&mut self, req: &AppendEntriesRequest) -> RaftResult<u64> {
        // Skip entries we already hold with matching terms; find the first
        // actual conflict or gap.
        let mut to_append = Vec::with_capacity(req.entries.len());
        for entry in &req.entries {
            if entry.log_id.index <= self.log.prev_index() {
                // Pruned positions are committed and necessarily agree.
                continue;
            }
            if entry.log_id.index <= self.last_log_id.index {
                let held = self
                    .log
                    .read_entry_term(entry.log_id.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                if held == Some(entry.log_id.term) {
                    continue;
                }
                // Conflict: a committed entry is never overwritten, so the
                // conflict is necessarily above the commit index.
                assert!(
                    entry.log_id.index > self.commit_index,
                    "refusing to truncate at or below the commit index"
                );
                tracing::info!(
                    id=%self.id,
                    conflict=%entry.log_id,
                    "truncating conflicting log tail"
                );
                self.log
                    .truncate(entry.log_id.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = if entry.log_id.index == 1 {
                    crate::LogId::default()
                } else {
                    let prior = entry.log_id.index - 1;
                    let term = self
                        .log
                        .read_entry_term(prior)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?
                        .unwrap_or(0);
                    crate::LogId::new(term, prior)
                };
            }
            to_append.push(Arc::new(entry.clone()));
        }

        if let Some(last) = to_append.last() {
            let last_id = last.log_id;
            self.observe_membership_entries(&to_append);
            self.log
                .append(to_append)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = last_id;
            self.report_metrics();
        }

        Ok(req
            .entries
            .last()
            .map(|e| e.log_id.index)
            .unwrap_or(req.prev_log_id.index))
    }

    async fn send_append_response(&mut self, to: MemberId, success: bool, match_index: u64) -> RaftResult<()> {
        let response = RaftMessage::AppendResponse(AppendResponse {
            term: self.current_term,
            success,
            match_index,
            append_index: self.last_log_id.index,
        });
        if let Err(err) = self.network.send(to, response).await {
            tracing::warn!(id=%self.id, target=%to, error=%err, "error sending append response");
        }
        Ok(())
    }

    /// Handle a leader heartbeat: liveness plus cheap commit propagation.
    ///
    /// The commit index only advances when the local log holds the
    /// leader's `(commit_index, commit_index_term)`.
    #[tracing::instrument(level = "trace", skip(self, hb), fields(hb = %hb.summary()))]
    pub(super) async fn handle_heartbeat(&mut self, from: MemberId, hb: Heartbeat) -> RaftResult<()> {
        if hb.term < self.current_term {
            return Ok(());
        }
        self.update_next_election_timeout();
        if self.current_leader != Some(from) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(from));
            self.report_metrics();
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        if hb.leader_commit > self.commit_index && hb.leader_commit <= self.last_log_id.index {
            let held = self
                .log
                .read_entry_term(hb.leader_commit)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if held == Some(hb.commit_index_term) {
                self.advance_commit(hb.leader_commit, hb.commit_index_term);
                self.report_metrics();
            }
        }
        Ok(())
    }

    /// Handle the leader's prune horizon notification.
    ///
    /// A member whose log ends below the horizon cannot be served by log
    /// shipping any longer and signals for out-of-band catch-up. A member
    /// at or past the horizon treats it as a safe local prune point.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_prune_request(&mut self, from: MemberId, req: PruneRequest) -> RaftResult<()> {
        if req.up_to_index > self.last_log_id.index {
            tracing::info!(
                id=%self.id,
                horizon=req.up_to_index,
                append_index=self.last_log_id.index,
                "log is behind the leader's prune horizon, catch-up required"
            );
            let _ = self.tx_events.send(CoreEvent::CatchupRequired {
                source_hint: from,
                required_index: req.up_to_index,
            });
            return Ok(());
        }

        // Never prune what the applier has not durably flushed.
        let horizon = std::cmp::min(req.up_to_index, self.snapshot_index);
        if horizon > self.log.prev_index() {
            self.log
                .prune(horizon)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }
        Ok(())
    }
}
