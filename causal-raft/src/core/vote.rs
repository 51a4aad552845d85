//! Vote handling: granting votes and counting campaign responses.

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::message::RaftMessage;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::MemberId;
use crate::MessageSummary;
use crate::Outbound;

impl<L: LogStore, S: StableStore, N: Outbound> RaftCore<L, S, N> {
    /// Decide a vote request and send the response.
    ///
    /// A vote is granted iff the request's term is current, this member
    /// has not voted differently in the term, and the candidate's log is
    /// at least as up-to-date as ours. The vote record is durable before
    /// the response leaves this member.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, from: MemberId, req: VoteRequest) -> RaftResult<()> {
        // The caller has already applied the higher-term rule, so a
        // request from a newer term finds current_term == req.term here.
        if req.term < self.current_term {
            tracing::debug!(
                id=%self.id, term=self.current_term, req_term=req.term,
                "rejecting vote request from older term"
            );
            return self.send_vote_response(from, false).await;
        }

        // One vote per term, first-come-first-served.
        if let Some(voted_for) = &self.voted_for {
            if voted_for != &req.candidate_id {
                tracing::debug!(id=%self.id, %voted_for, "vote already granted in this term");
                return self.send_vote_response(from, false).await;
            }
        }

        // The up-to-date rule: (lastLogTerm, lastLogIndex), lexicographic.
        let candidate_log = (req.last_log_term, req.last_log_index);
        let local_log = (self.last_log_id.term, self.last_log_id.index);
        if candidate_log < local_log {
            tracing::debug!(
                id=%self.id, ?candidate_log, ?local_log,
                "rejecting vote request, candidate log is behind"
            );
            return self.send_vote_response(from, false).await;
        }

        self.voted_for = Some(req.candidate_id);
        self.save_vote().await?;
        self.update_next_election_timeout();
        self.report_metrics();
        tracing::info!(id=%self.id, candidate=%req.candidate_id, term=req.term, "vote granted");
        self.send_vote_response(from, true).await
    }

    async fn send_vote_response(&mut self, to: MemberId, granted: bool) -> RaftResult<()> {
        let response = RaftMessage::VoteResponse(VoteResponse {
            term: self.current_term,
            granted,
        });
        if let Err(err) = self.network.send(to, response).await {
            tracing::warn!(id=%self.id, target=%to, error=%err, "error sending vote response");
        }
        Ok(())
    }
}

impl<'a, L: LogStore, S: StableStore, N: Outbound> CandidateState<'a, L, S, N> {
    /// Broadcast vote requests to every voting peer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn broadcast_vote_requests(&mut self) {
        let request = VoteRequest {
            term: self.core.current_term,
            candidate_id: self.core.id,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
        };
        let peers: Vec<_> = self
            .core
            .membership
            .iter()
            .filter(|member| **member != self.core.id)
            .cloned()
            .collect();
        for peer in peers {
            let message = RaftMessage::VoteRequest(request.clone());
            if let Err(err) = self.core.network.send(peer, message).await {
                tracing::warn!(id=%self.core.id, target=%peer, error=%err, "error sending vote request");
            }
        }
    }

    /// Count a vote response; a majority makes this member leader.
    #[tracing::instrument(level = "debug", skip(self, rsp), fields(rsp = %rsp.summary()))]
    pub(super) async fn handle_vote_response(&mut self, rsp: VoteResponse) -> RaftResult<()> {
        // Responses from older campaigns are meaningless.
        if rsp.term < self.core.current_term {
            return Ok(());
        }
        if !rsp.granted {
            return Ok(());
        }

        self.votes_granted += 1;
        tracing::debug!(
            id=%self.core.id,
            granted=self.votes_granted,
            needed=self.votes_needed,
            "vote granted"
        );
        if self.votes_granted >= self.votes_needed {
            tracing::info!(
                id=%self.core.id,
                term=self.core.current_term,
                "majority of votes granted, becoming leader"
            );
            self.core.set_target_state(State::Leader);
            self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        }
        Ok(())
    }
}
