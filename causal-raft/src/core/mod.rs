//! The core logic of a cluster member.
//!
//! One spawned task owns all Raft state. It consumes a single queue of
//! inbound messages, client requests and timer fires, processing one at a
//! time; network sends and the applier run elsewhere and communicate
//! through channels. The task assumes one of three roles and delegates
//! control to the matching state controller, which returns only when a
//! role change or shutdown is required.

mod append_entries;
mod client;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::AwaitingCommit;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ReplicationError;
use crate::log::RaftLog;
use crate::message::Inbound;
use crate::message::RaftMessage;
use crate::metrics::CoreMetrics;
use crate::operation::DistributedOperation;
use crate::operation::EntryPayload;
use crate::operation::LogEntry;
use crate::operation::ReplicatedContent;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::CoreSnapshot;
use crate::storage::InitialState;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::storage::VoteRecord;
use crate::timer::TimerFired;
use crate::timer::TimerName;
use crate::timer::TimerService;
use crate::LogId;
use crate::MemberId;
use crate::MessageSummary;
use crate::Outbound;

/// The response to a successfully committed client write.
#[derive(Clone, Debug)]
pub struct ClientWriteResponse {
    /// The log position the operation was committed at.
    pub log_id: LogId,
}

pub(crate) type ClientWriteTx = oneshot::Sender<Result<ClientWriteResponse, ReplicationError>>;

/// A request consumed by the core task.
pub(crate) enum CoreRequest {
    /// A decoded message from a cluster peer.
    Inbound(Inbound),
    /// A local client operation to append and commit.
    ClientWrite {
        op: DistributedOperation,
        tx: ClientWriteTx,
    },
    /// Bootstrap a pristine member with an initial voting set.
    Initialize {
        members: BTreeSet<MemberId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    /// Install a snapshot pulled by the catch-up client. The applier has
    /// already installed the matching state machine snapshot.
    InstallSnapshot {
        snapshot: CoreSnapshot,
        tx: oneshot::Sender<RaftResult<()>>,
    },
    /// Append a tail of committed entries pulled by the catch-up client.
    InstallCommittedTail {
        entries: Vec<LogEntry>,
        tx: oneshot::Sender<RaftResult<u64>>,
    },
    /// The applier flushed its state durably up to this index; the log
    /// can be pruned below it.
    Flushed { up_to: u64 },
}

/// Events the core emits towards the surrounding node.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// This member's log has fallen behind the leader's prune horizon and
    /// must be caught up out-of-band.
    CatchupRequired {
        /// The member that reported the horizon, the natural catch-up
        /// source.
        source_hint: MemberId,
        /// The horizon the log must reach.
        required_index: u64,
    },
    /// The known leader changed.
    LeaderChanged { leader: Option<MemberId> },
}

/// All possible roles of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Replicating entries from the leader.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// The cluster leader.
    Leader,
    /// Shutting down.
    Shutdown,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// An enum describing the way the current leader property is to be
/// updated.
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(MemberId),
    ThisNode,
}

/// The core type implementing the Raft protocol.
pub(crate) struct RaftCore<L: LogStore, S: StableStore, N: Outbound> {
    /// This member's id.
    id: MemberId,
    /// This member's runtime config.
    config: Arc<Config>,
    /// The cluster's voting member set.
    membership: BTreeSet<MemberId>,
    /// The outbound message channel implementation.
    network: Arc<N>,
    /// The Raft log (durable store + in-flight cache).
    log: Arc<RaftLog<L>>,
    /// Durable term/vote storage.
    stable: Arc<S>,

    /// The role the main loop drives towards.
    target_state: State,

    /// The highest log index known to be committed cluster-wide.
    ///
    /// Initialized to zero on boot; a commit index must be re-learned
    /// from a leader of the current term, never assumed from stale state.
    commit_index: u64,
    /// The term of the entry at `commit_index`.
    commit_term: u64,

    /// The current term. Durable via the vote record.
    current_term: u64,
    /// Who this member voted for in `current_term`.
    voted_for: Option<MemberId>,
    /// The current cluster leader, as far as this member knows.
    current_leader: Option<MemberId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The index covered by the last durable state flush.
    snapshot_index: u64,

    /// Named timers; fires arrive on `rx_timers` and serialize with
    /// message handling.
    timers: TimerService,
    rx_timers: mpsc::UnboundedReceiver<TimerFired>,

    rx_api: mpsc::UnboundedReceiver<CoreRequest>,
    /// Commit index updates consumed by the applier.
    tx_commit: watch::Sender<u64>,
    /// The applier's progress, folded into metrics.
    rx_last_applied: watch::Receiver<LogId>,
    tx_events: mpsc::UnboundedSender<CoreEvent>,
    tx_metrics: watch::Sender<CoreMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<L: LogStore, S: StableStore, N: Outbound> RaftCore<L, S, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: MemberId,
        config: Arc<Config>,
        initial: InitialState,
        network: Arc<N>,
        log: Arc<RaftLog<L>>,
        stable: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<CoreRequest>,
        tx_commit: watch::Sender<u64>,
        rx_last_applied: watch::Receiver<LogId>,
        tx_events: mpsc::UnboundedSender<CoreEvent>,
        tx_metrics: watch::Sender<CoreMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (timers, rx_timers) = TimerService::new();
        let this = Self {
            id,
            config,
            membership: initial.membership,
            network,
            log,
            stable,
            target_state: State::Follower,
            commit_index: 0,
            commit_term: 0,
            current_term: initial.vote.term,
            voted_for: initial.vote.voted_for,
            current_leader: None,
            last_log_id: initial.last_log_id,
            snapshot_index: initial.last_applied.index,
            timers,
            rx_timers,
            rx_api,
            tx_commit,
            rx_last_applied,
            tx_events,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!(
            term = self.current_term,
            last_log = %self.last_log_id,
            members = self.membership.len(),
            "member is starting"
        );

        // A restarted member must not disrupt a stable cluster: the first
        // election timeout carries a settling overhead so that network
        // communication gets established first.
        self.timers.set(
            TimerName::Election,
            Duration::from_millis(self.config.election_timeout) + Duration::from_secs(1),
            Duration::from_millis(self.config.election_timeout),
        );

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id=%self.id, "member has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the member.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(CoreMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.rx_last_applied.borrow().index,
            current_leader: self.current_leader,
            membership: self.membership.clone(),
            snapshot_index: self.snapshot_index,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=%self.id, "error reporting metrics");
        }
    }

    /// Persist the current `(term, voted_for)` record.
    async fn save_vote(&mut self) -> RaftResult<()> {
        let vote = VoteRecord {
            term: self.current_term,
            voted_for: self.voted_for,
        };
        self.stable
            .save_vote(&vote)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    fn set_target_state(&mut self, target_state: State) {
        if target_state != self.target_state {
            tracing::debug!(id=%self.id, from=?self.target_state, to=?target_state, "role change");
        }
        self.target_state = target_state;
    }

    /// Re-arm the election timer with a fresh randomized timeout in
    /// `[base, base * 2]`.
    fn update_next_election_timeout(&mut self) {
        let base = Duration::from_millis(self.config.election_timeout);
        self.timers.set(TimerName::Election, base, base);
    }

    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        let leader = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
        if leader != self.current_leader {
            self.current_leader = leader;
            let _ = self.tx_events.send(CoreEvent::LeaderChanged { leader });
        }
    }

    /// Update the current term. `voted_for` is cleared together with the
    /// term, never independently.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<MemberId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// A storage error observed here is non-recoverable: instruct the
    /// member to stop so it can restart from durable state.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=%self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    /// Apply the observed-higher-term rule to any inbound message.
    /// Returns true when the term forced a revert to follower.
    async fn observe_message_term(&mut self, message: &RaftMessage) -> RaftResult<bool> {
        let term = match message.term() {
            Some(term) => term,
            None => return Ok(false),
        };
        if term > self.current_term {
            self.update_current_term(term, None);
            self.save_vote().await?;
            self.set_target_state(State::Follower);
            self.update_next_election_timeout();
            self.report_metrics();
            return Ok(true);
        }
        Ok(false)
    }

    /// Advance the commit index and wake the applier.
    fn advance_commit(&mut self, commit_index: u64, commit_term: u64) {
        if commit_index <= self.commit_index {
            return;
        }
        self.commit_index = commit_index;
        self.commit_term = commit_term;
        let _ = self.tx_commit.send(self.commit_index);
    }

    /// Append entries carrying a member set update take effect
    /// immediately, not at commit.
    fn observe_membership_entries(&mut self, entries: &[Arc<LogEntry>]) {
        for entry in entries {
            if let EntryPayload::Operation(op) = &entry.payload {
                if let ReplicatedContent::MemberSet { members } = &op.content {
                    tracing::info!(id=%self.id, n = members.len(), "adopting appended member set");
                    self.membership = members.clone();
                }
            }
        }
    }

    /// Install a snapshot pulled by the catch-up client. Only legal on a
    /// follower; the matching state machine snapshot is already
    /// installed on the applier side.
    async fn install_snapshot(&mut self, snapshot: CoreSnapshot) -> RaftResult<()> {
        let prev = snapshot.log_id();
        if prev.index <= self.last_log_id.index && prev.index <= self.commit_index {
            tracing::info!(id=%self.id, snapshot=%prev, "ignoring snapshot not ahead of the log");
            return Ok(());
        }
        self.log
            .reset(prev)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = prev;
        self.membership = snapshot.members.clone();
        self.snapshot_index = prev.index;
        self.commit_index = prev.index;
        self.commit_term = prev.term;
        let _ = self.tx_commit.send(self.commit_index);
        self.report_metrics();
        tracing::info!(id=%self.id, snapshot=%prev, "installed snapshot");
        Ok(())
    }

    /// Append a tail of already-committed entries pulled by the catch-up
    /// client.
    async fn install_committed_tail(&mut self, entries: Vec<LogEntry>) -> RaftResult<u64> {
        let mut accepted = Vec::new();
        for entry in entries {
            if entry.log_id.index == self.last_log_id.index + 1 {
                accepted.push(Arc::new(entry));
            }
        }
        if accepted.is_empty() {
            return Ok(self.last_log_id.index);
        }
        let last = accepted.last().map(|e| e.log_id).unwrap_or(self.last_log_id);
        self.observe_membership_entries(&accepted);
        self.log
            .append(accepted)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = last;
        self.advance_commit(last.index, last.term);
        self.report_metrics();
        Ok(self.last_log_id.index)
    }

    /// Handle the applier's durable flush notification by pruning the
    /// log below the flushed index.
    async fn handle_flushed(&mut self, up_to: u64) -> RaftResult<()> {
        self.snapshot_index = up_to;
        let horizon = up_to.saturating_sub(self.config.log_prune_keep);
        if horizon > self.log.prev_index() {
            let pruned_to = self
                .log
                .prune(horizon)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            tracing::debug!(id=%self.id, pruned_to, "pruned log after state flush");
        }
        self.report_metrics();
        Ok(())
    }

    /// Bootstrap a pristine member. Valid only when nothing was ever
    /// logged or voted.
    async fn handle_initialize(&mut self, mut members: BTreeSet<MemberId>) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.current_term != 0 {
            tracing::error!(
                id=%self.id,
                last_log_index = self.last_log_id.index,
                term = self.current_term,
                "rejecting initialize request on a non-pristine member"
            );
            return Err(InitializeError::NotAllowed);
        }
        members.insert(self.id);
        self.membership = members;

        // A single-member cluster elects itself without campaigning.
        if self.membership.len() == 1 {
            self.current_term += 1;
            self.voted_for = Some(self.id);
            self.set_target_state(State::Leader);
            self.save_vote().await?;
        } else {
            self.set_target_state(State::Candidate);
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader role.
pub(self) struct LeaderState<'a, L: LogStore, S: StableStore, N: Outbound> {
    pub(super) core: &'a mut RaftCore<L, S, N>,
    /// Per-follower replication streams.
    pub(super) nodes: BTreeMap<MemberId, ReplicationState>,
    /// Entries appended but not yet dispatched to the streams; flushed by
    /// the append-batch timer.
    pub(super) pending_dispatch: Vec<Arc<LogEntry>>,
    /// Client requests awaiting commitment, in log order.
    pub(super) awaiting_committed: Vec<AwaitingCommit>,
    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
}

/// The replication state of one follower, from the leader's perspective.
pub(self) struct ReplicationState {
    pub matched: LogId,
    pub stream: ReplicationStream,
}

impl<'a, L: LogStore, S: StableStore, N: Outbound> LeaderState<'a, L, S, N> {
    pub(self) fn new(core: &'a mut RaftCore<L, S, N>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            pending_dispatch: Vec::new(),
            awaiting_committed: Vec::new(),
            replication_rx,
            replication_tx,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        let targets: Vec<_> = self
            .core
            .membership
            .iter()
            .filter(|member| **member != self.core.id)
            .cloned()
            .collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.timers.cancel(TimerName::Election);
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Commit an entry of the new term straight away: entries of prior
        // terms may only ever be committed transitively under it.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.stream.repl_tx.send(RaftEvent::Terminate);
                }
                self.abort_awaiting();
                return Ok(());
            }

            tokio::select! {
                Some(request) = self.core.rx_api.recv() => {
                    self.handle_request(request).await?;
                }
                Some(event) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).await?;
                }
                Some(fired) = self.core.rx_timers.recv() => {
                    if fired.name == TimerName::AppendBatch {
                        self.dispatch_pending();
                    }
                }
                Ok(()) = self.core.rx_last_applied.changed() => {
                    self.core.report_metrics();
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    async fn handle_request(&mut self, request: CoreRequest) -> RaftResult<()> {
        match request {
            CoreRequest::Inbound(inbound) => {
                tracing::debug!(id=%self.core.id, msg=%inbound.summary(), "leader recv");
                let reverted = self.core.observe_message_term(&inbound.message).await?;
                if reverted {
                    match inbound.message {
                        RaftMessage::AppendEntries(req) => {
                            self.core.handle_append_entries(inbound.from, req).await?;
                        }
                        RaftMessage::VoteRequest(req) => {
                            self.core.handle_vote_request(inbound.from, req).await?;
                        }
                        RaftMessage::Heartbeat(hb) => {
                            self.core.handle_heartbeat(inbound.from, hb).await?;
                        }
                        _ => {}
                    }
                    return Ok(());
                }
                match inbound.message {
                    RaftMessage::AppendEntries(req) => {
                        // A stale leader of an older term; reject so it
                        // steps down.
                        self.core.handle_append_entries(inbound.from, req).await?;
                    }
                    RaftMessage::VoteRequest(req) => {
                        self.core.handle_vote_request(inbound.from, req).await?;
                    }
                    RaftMessage::AppendResponse(rsp) => {
                        if let Some(node) = self.nodes.get(&inbound.from) {
                            let _ = node.stream.repl_tx.send(RaftEvent::Response(rsp));
                        }
                    }
                    RaftMessage::VoteResponse(_) => {
                        // Stale responses from the campaign that elected us.
                    }
                    RaftMessage::Heartbeat(hb) => {
                        self.core.handle_heartbeat(inbound.from, hb).await?;
                    }
                    RaftMessage::PruneRequest(req) => {
                        self.core.handle_prune_request(inbound.from, req).await?;
                    }
                }
            }
            CoreRequest::ClientWrite { op, tx } => {
                self.handle_client_write(op, tx).await?;
            }
            CoreRequest::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            CoreRequest::InstallSnapshot { tx, .. } => {
                let _ = tx.send(Err(RaftError::Storage(anyhow::anyhow!(
                    "snapshot installation is not legal on a leader"
                ))));
            }
            CoreRequest::InstallCommittedTail { tx, .. } => {
                let _ = tx.send(Err(RaftError::Storage(anyhow::anyhow!(
                    "tail installation is not legal on a leader"
                ))));
            }
            CoreRequest::Flushed { up_to } => {
                self.core.handle_flushed(up_to).await?;
            }
        }
        Ok(())
    }

    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatched { target, matched } => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.matched = matched;
                }
                self.advance_commit_index().await?;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(id=%self.core.id, %target, term, "higher term observed, stepping down");
                    self.core.update_current_term(term, None);
                    self.core.save_vote().await?;
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.update_next_election_timeout();
                    self.core.set_target_state(State::Follower);
                    self.abort_awaiting();
                }
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return Err(RaftError::ShuttingDown);
            }
        }
        Ok(())
    }

    /// Abort all requests awaiting commitment; used when stepping down.
    fn abort_awaiting(&mut self) {
        for awaiting in self.awaiting_committed.drain(..) {
            if let Some(tx) = awaiting.tx {
                let _ = tx.send(Err(ReplicationError::NotLeader {
                    hint: self.core.current_leader,
                }));
            }
        }
    }

    fn spawn_replication_stream(&self, target: MemberId) -> ReplicationState {
        let stream = ReplicationStream::spawn(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.commit_term,
            self.core.network.clone(),
            self.core.log.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            stream,
        }
    }

    /// Adjust replication streams after a membership change.
    pub(super) fn update_replication_streams(&mut self) {
        let desired: BTreeSet<MemberId> = self
            .core
            .membership
            .iter()
            .filter(|m| **m != self.core.id)
            .cloned()
            .collect();

        let current: BTreeSet<MemberId> = self.nodes.keys().cloned().collect();
        for removed in current.difference(&desired) {
            if let Some(node) = self.nodes.remove(removed) {
                tracing::info!(id=%self.core.id, target=%removed, "terminating replication to removed member");
                let _ = node.stream.repl_tx.send(RaftEvent::Terminate);
            }
        }
        for added in desired.difference(&current).cloned().collect::<Vec<_>>() {
            tracing::info!(id=%self.core.id, target=%added, "spawning replication to added member");
            let state = self.spawn_replication_stream(added);
            self.nodes.insert(added, state);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the candidate role.
pub(self) struct CandidateState<'a, L: LogStore, S: StableStore, N: Outbound> {
    core: &'a mut RaftCore<L, S, N>,
    /// Granted votes in the current campaign, including our own.
    votes_granted: u64,
    votes_needed: u64,
}

impl<'a, L: LogStore, S: StableStore, N: Outbound> CandidateState<'a, L, S, N> {
    pub(self) fn new(core: &'a mut RaftCore<L, S, N>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop
    /// represents a new term.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.votes_granted = 1; // We vote for ourselves.
            self.votes_needed = crate::quorum::majority_of(self.core.membership.len()) as u64;

            // Establish the new term.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_vote().await?;
            self.core.update_next_election_timeout();
            self.core.report_metrics();

            tracing::info!(id=%self.core.id, term=self.core.current_term, "campaigning");
            self.broadcast_vote_requests().await;

            // Inner processing loop for this term.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }

                tokio::select! {
                    Some(request) = self.core.rx_api.recv() => {
                        self.handle_request(request).await?;
                    }
                    Some(fired) = self.core.rx_timers.recv() => {
                        if fired.name == TimerName::Election {
                            // This campaign timed out; start a new term.
                            break;
                        }
                    }
                    Ok(()) = self.core.rx_last_applied.changed() => {
                        self.core.report_metrics();
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, request: CoreRequest) -> RaftResult<()> {
        match request {
            CoreRequest::Inbound(inbound) => {
                let reverted = self.core.observe_message_term(&inbound.message).await?;
                match inbound.message {
                    RaftMessage::AppendEntries(req) => {
                        // A valid leader of the current term also reverts
                        // us to follower.
                        if !reverted && req.term == self.core.current_term {
                            self.core.set_target_state(State::Follower);
                        }
                        self.core.handle_append_entries(inbound.from, req).await?;
                    }
                    RaftMessage::VoteRequest(req) => {
                        self.core.handle_vote_request(inbound.from, req).await?;
                    }
                    RaftMessage::VoteResponse(rsp) => {
                        if !reverted {
                            self.handle_vote_response(rsp).await?;
                        }
                    }
                    RaftMessage::Heartbeat(hb) => {
                        if !reverted && hb.term == self.core.current_term {
                            self.core.set_target_state(State::Follower);
                        }
                        self.core.handle_heartbeat(inbound.from, hb).await?;
                    }
                    RaftMessage::AppendResponse(_) => {}
                    RaftMessage::PruneRequest(req) => {
                        self.core.handle_prune_request(inbound.from, req).await?;
                    }
                }
            }
            CoreRequest::ClientWrite { tx, .. } => {
                let _ = tx.send(Err(ReplicationError::NotLeader {
                    hint: self.core.current_leader,
                }));
            }
            CoreRequest::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            CoreRequest::InstallSnapshot { tx, .. } => {
                let _ = tx.send(Err(RaftError::Storage(anyhow::anyhow!(
                    "snapshot installation is not legal on a candidate"
                ))));
            }
            CoreRequest::InstallCommittedTail { tx, .. } => {
                let _ = tx.send(Err(RaftError::Storage(anyhow::anyhow!(
                    "tail installation is not legal on a candidate"
                ))));
            }
            CoreRequest::Flushed { up_to } => {
                self.core.handle_flushed(up_to).await?;
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the follower role.
pub(self) struct FollowerState<'a, L: LogStore, S: StableStore, N: Outbound> {
    core: &'a mut RaftCore<L, S, N>,
}

impl<'a, L: LogStore, S: StableStore, N: Outbound> FollowerState<'a, L, S, N> {
    pub(self) fn new(core: &'a mut RaftCore<L, S, N>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            tokio::select! {
                Some(request) = self.core.rx_api.recv() => {
                    self.core.follower_handle_request(request).await?;
                }
                Some(fired) = self.core.rx_timers.recv() => {
                    if fired.name == TimerName::Election {
                        tracing::info!(id=%self.core.id, "election timeout, becoming candidate");
                        self.core.set_target_state(State::Candidate);
                    }
                }
                Ok(()) = self.core.rx_last_applied.changed() => {
                    self.core.report_metrics();
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

impl<L: LogStore, S: StableStore, N: Outbound> RaftCore<L, S, N> {
    async fn follower_handle_request(&mut self, request: CoreRequest) -> RaftResult<()> {
        match request {
            CoreRequest::Inbound(inbound) => {
                self.observe_message_term(&inbound.message).await?;
                match inbound.message {
                    RaftMessage::AppendEntries(req) => {
                        self.handle_append_entries(inbound.from, req).await?;
                    }
                    RaftMessage::VoteRequest(req) => {
                        self.handle_vote_request(inbound.from, req).await?;
                    }
                    RaftMessage::Heartbeat(hb) => {
                        self.handle_heartbeat(inbound.from, hb).await?;
                    }
                    RaftMessage::PruneRequest(req) => {
                        self.handle_prune_request(inbound.from, req).await?;
                    }
                    RaftMessage::VoteResponse(_) | RaftMessage::AppendResponse(_) => {
                        // Stale responses from an earlier role.
                    }
                }
            }
            CoreRequest::ClientWrite { tx, .. } => {
                let _ = tx.send(Err(ReplicationError::NotLeader {
                    hint: self.current_leader,
                }));
            }
            CoreRequest::Initialize { members, tx } => {
                let _ = tx.send(self.handle_initialize(members).await);
            }
            CoreRequest::InstallSnapshot { snapshot, tx } => {
                let _ = tx.send(self.install_snapshot(snapshot).await);
            }
            CoreRequest::InstallCommittedTail { entries, tx } => {
                let _ = tx.send(self.install_committed_tail(entries).await);
            }
            CoreRequest::Flushed { up_to } => {
                self.handle_flushed(up_to).await?;
            }
        }
        Ok(())
    }
}
