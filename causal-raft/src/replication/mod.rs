//! Leader-to-peer replication streams.
//!
//! One task per peer. Entries arrive in batches from the leader loop and
//! are shipped in order; nothing is pipelined past an unacknowledged
//! payload, so a lost response simply causes a retransmission on the next
//! heartbeat tick. Responses arrive out-of-band through the leader loop,
//! which routes them here by peer id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::log::RaftLog;
use crate::message::AppendEntriesRequest;
use crate::message::AppendResponse;
use crate::message::Heartbeat;
use crate::message::PruneRequest;
use crate::message::RaftMessage;
use crate::operation::LogEntry;
use crate::storage::LogStore;
use crate::timer::TimerFired;
use crate::timer::TimerName;
use crate::timer::TimerService;
use crate::LogId;
use crate::MemberId;
use crate::Outbound;

/// An event from the leader loop to a replication stream.
pub(crate) enum RaftEvent {
    /// Newly appended entries to ship, with the current commit position.
    Replicate {
        entries: Vec<Arc<LogEntry>>,
        commit_index: u64,
        commit_term: u64,
    },
    /// The commit position advanced without new entries.
    UpdateCommitIndex { commit_index: u64, commit_term: u64 },
    /// An AppendResponse from this stream's peer.
    Response(AppendResponse),
    /// The leader is stepping down; stop the stream.
    Terminate,
}

/// An event from a replication stream to the leader loop.
pub(crate) enum ReplicaEvent {
    /// The peer's highest matched log position advanced.
    UpdateMatched { target: MemberId, matched: LogId },
    /// The peer reported a higher term; the leader must step down.
    RevertToFollower { target: MemberId, term: u64 },
    /// A non-recoverable storage error was hit inside the stream.
    Shutdown,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Spawn a new replication task for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<L: LogStore, N: Outbound>(
        id: MemberId,
        target: MemberId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        commit_term: u64,
        network: Arc<N>,
        log: Arc<RaftLog<L>>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let (timers, rx_timers) = TimerService::new();
        let this = ReplicationCore {
            id,
            target,
            term,
            network,
            log,
            config,
            target_state: TargetReplState::LineRate,
            last_log_index: last_log.index,
            commit_index,
            commit_term,
            next_index: last_log.index + 1,
            matched: last_log,
            buffer: VecDeque::new(),
            outbound: Vec::new(),
            raft_core_tx,
            repl_rx,
            timers,
            rx_timers,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { repl_tx }
    }
}

/// The replication stream's pacing state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TargetReplState {
    /// Shipping freshly appended entries as they arrive.
    LineRate,
    /// Reading older entries back from the log to close a gap.
    Lagging,
    /// The peer is behind the prune horizon; parked until it catches up
    /// out-of-band.
    WaitingForCatchup,
    /// Shutting down.
    Shutdown,
}

struct ReplicationCore<L: LogStore, N: Outbound> {
    id: MemberId,
    target: MemberId,
    /// The leader term this stream serves. Fixed for the stream's
    /// lifetime; a term change tears all streams down.
    term: u64,

    network: Arc<N>,
    log: Arc<RaftLog<L>>,
    config: Arc<Config>,

    target_state: TargetReplState,

    /// The leader's last appended index.
    last_log_index: u64,
    commit_index: u64,
    commit_term: u64,

    /// The next index to ship to the peer.
    next_index: u64,
    /// The highest position known replicated on the peer.
    matched: LogId,

    /// Appended entries not yet handed to the peer.
    buffer: VecDeque<Arc<LogEntry>>,
    /// The in-flight payload, kept until acknowledged so it can be
    /// retransmitted.
    outbound: Vec<Arc<LogEntry>>,

    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
    timers: TimerService,
    rx_timers: mpsc::UnboundedReceiver<TimerFired>,
}

impl<L: LogStore, N: Outbound> ReplicationCore<L, N> {
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, target=%self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // An immediate heartbeat announces the new leader.
        self.send_heartbeat().await;
        self.arm_heartbeat();

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::WaitingForCatchup => self.catchup_wait_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    fn arm_heartbeat(&self) {
        self.timers.set(
            TimerName::Heartbeat,
            self.config.heartbeat_interval(),
            Duration::ZERO,
        );
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // The buffer must directly continue at next_index; a gap means
            // entries were dispatched while this stream was paused and we
            // must read them back from the log.
            if self.outbound.is_empty() {
                if let Some(front) = self.buffer.front() {
                    if front.log_id.index != self.next_index {
                        self.target_state = TargetReplState::Lagging;
                        return;
                    }
                    self.load_outbound_from_buffer();
                    self.send_append_entries().await;
                }
            }

            tokio::select! {
                Some(fired) = self.rx_timers.recv() => {
                    if fired.name == TimerName::Heartbeat {
                        self.on_heartbeat_tick().await;
                        self.arm_heartbeat();
                    }
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_events(event).await,
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// One heartbeat tick: retransmit the in-flight payload, ship the
    /// next buffered payload, or fall back to a plain heartbeat.
    async fn on_heartbeat_tick(&mut self) {
        if !self.outbound.is_empty() {
            self.send_append_entries().await;
        } else if !self.buffer.is_empty()
            && self.buffer.front().map(|e| e.log_id.index) == Some(self.next_index)
        {
            self.load_outbound_from_buffer();
            self.send_append_entries().await;
        } else {
            self.send_heartbeat().await;
        }
    }

    fn load_outbound_from_buffer(&mut self) {
        let max = self.config.max_payload_entries as usize;
        while self.outbound.len() < max {
            match self.buffer.pop_front() {
                Some(entry) => self.outbound.push(entry),
                None => break,
            }
        }
    }

    /// Ship the in-flight payload. `matched` is the payload's prev
    /// position by construction.
    async fn send_append_entries(&mut self) {
        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries: self.outbound.iter().map(|e| e.as_ref().clone()).collect(),
            leader_commit: self.commit_index,
        };
        if let Err(err) = self
            .network
            .send(self.target, RaftMessage::AppendEntries(request))
            .await
        {
            tracing::debug!(target=%self.target, error=%err, "error sending append entries");
        }
    }

    async fn send_heartbeat(&mut self) {
        let heartbeat = Heartbeat {
            term: self.term,
            leader_commit: self.commit_index,
            commit_index_term: self.commit_term,
        };
        if let Err(err) = self
            .network
            .send(self.target, RaftMessage::Heartbeat(heartbeat))
            .await
        {
            tracing::debug!(target=%self.target, error=%err, "error sending heartbeat");
        }
    }

    async fn send_prune_request(&mut self) {
        let request = PruneRequest {
            up_to_index: self.log.prev_index(),
        };
        if let Err(err) = self
            .network
            .send(self.target, RaftMessage::PruneRequest(request))
            .await
        {
            tracing::debug!(target=%self.target, error=%err, "error sending prune request");
        }
    }

    /// Process one event and greedily drain any further queued ones.
    async fn drain_events(&mut self, first: RaftEvent) {
        let mut event_opt = Some(first);
        let mut iters = 0usize;
        loop {
            // Don't starve the loop on a hot feed.
            if iters > self.config.max_payload_entries as usize {
                return;
            }
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            match event {
                RaftEvent::Replicate {
                    entries,
                    commit_index,
                    commit_term,
                } => {
                    self.commit_index = commit_index;
                    self.commit_term = commit_term;
                    if let Some(last) = entries.last() {
                        self.last_log_index = last.log_id.index;
                    }
                    if self.target_state == TargetReplState::LineRate {
                        let next_index = self.next_index;
                        self.buffer
                            .extend(entries.into_iter().filter(|e| e.log_id.index >= next_index));
                    }
                }
                RaftEvent::UpdateCommitIndex {
                    commit_index,
                    commit_term,
                } => {
                    let advanced = commit_index > self.commit_index;
                    self.commit_index = commit_index;
                    self.commit_term = commit_term;
                    // Propagate the commit position without waiting for
                    // the next tick, so followers apply promptly.
                    if advanced && self.outbound.is_empty() {
                        self.send_heartbeat().await;
                    }
                }
                RaftEvent::Response(response) => {
                    self.handle_response(response).await;
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            if let Some(Some(next)) = self.repl_rx.recv().now_or_never() {
                event_opt = Some(next);
            }
            iters += 1;
        }
    }

    /// Handle an AppendResponse from the peer.
    async fn handle_response(&mut self, response: AppendResponse) {
        if response.term > self.term {
            tracing::debug!(target=%self.target, term=response.term, "peer reported a higher term");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: response.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        if response.success {
            if response.match_index >= self.matched.index {
                let matched_term = self
                    .outbound
                    .iter()
                    .chain(self.buffer.iter())
                    .find(|e| e.log_id.index == response.match_index)
                    .map(|e| e.log_id.term);
                self.outbound.retain(|e| e.log_id.index > response.match_index);
                self.next_index = response.match_index + 1;
                if let Some(term) = matched_term {
                    self.matched = LogId::new(term, response.match_index);
                } else if response.match_index != self.matched.index {
                    match self.log.read_entry_term(response.match_index).await {
                        Ok(Some(term)) => self.matched = LogId::new(term, response.match_index),
                        Ok(None) => self.matched.index = response.match_index,
                        Err(err) => {
                            tracing::error!(error=%err, "error reading matched entry term");
                            let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                            self.target_state = TargetReplState::Shutdown;
                            return;
                        }
                    }
                }
                let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatched {
                    target: self.target,
                    matched: self.matched,
                });
            }

            // A peer trailing too far behind leaves line rate so the
            // buffers don't grow without bound.
            let lagging = self
                .last_log_index
                .saturating_sub(self.matched.index)
                > self.config.replication_lag_threshold;
            if lagging && self.target_state == TargetReplState::LineRate {
                self.target_state = TargetReplState::Lagging;
            }
            if self.outbound.is_empty() && !self.buffer.is_empty() {
                if self.buffer.front().map(|e| e.log_id.index) == Some(self.next_index) {
                    self.load_outbound_from_buffer();
                    self.send_append_entries().await;
                }
            }
            return;
        }

        // Rejected: jump next_index down to at most the peer's append
        // index, rather than one entry at a time.
        self.outbound.clear();
        let new_next = std::cmp::min(
            self.next_index.saturating_sub(1),
            response.append_index + 1,
        )
        .max(1);
        self.next_index = new_next;
        tracing::debug!(
            target=%self.target,
            next_index=self.next_index,
            append_index=response.append_index,
            "append rejected, backing up"
        );

        if self.next_index <= self.log.prev_index() {
            // The peer needs entries we have pruned; it must catch up
            // out-of-band.
            self.send_prune_request().await;
            self.target_state = TargetReplState::WaitingForCatchup;
        } else {
            self.target_state = TargetReplState::Lagging;
        }
    }

    /// Re-anchor `matched` at `next_index - 1` by reading the term from
    /// the log. Returns false when the position is pruned away.
    async fn anchor_prev(&mut self) -> bool {
        let prev_index = self.next_index - 1;
        if prev_index == 0 {
            self.matched = LogId::default();
            return true;
        }
        match self.log.read_entry_term(prev_index).await {
            Ok(Some(term)) => {
                self.matched = LogId::new(term, prev_index);
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::error!(error=%err, "error anchoring replication position");
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.target_state = TargetReplState::Shutdown;
                false
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    async fn lagging_loop(&mut self) {
        self.buffer.clear();
        self.outbound.clear();

        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }
            if self.next_index > self.last_log_index {
                self.target_state = TargetReplState::LineRate;
                return;
            }
            if !self.anchor_prev().await {
                if self.target_state == TargetReplState::Lagging {
                    self.send_prune_request().await;
                    self.target_state = TargetReplState::WaitingForCatchup;
                }
                return;
            }

            // Fetch the next payload from the log (usually the cache).
            let stop = std::cmp::min(
                self.next_index + self.config.max_payload_entries,
                self.last_log_index + 1,
            );
            let entries = match self.log.read_entries(self.next_index, stop).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error=%err, "error reading entries for lagging peer");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            };
            if entries.is_empty() {
                // Pruned from under us between the anchor and the read.
                self.send_prune_request().await;
                self.target_state = TargetReplState::WaitingForCatchup;
                return;
            }
            self.outbound = entries;
            self.send_append_entries().await;

            // Wait for the acknowledgement (or retransmit on the tick).
            loop {
                if self.target_state != TargetReplState::Lagging {
                    return;
                }
                if self.outbound.is_empty() {
                    break;
                }
                tokio::select! {
                    Some(fired) = self.rx_timers.recv() => {
                        if fired.name == TimerName::Heartbeat {
                            self.send_append_entries().await;
                            self.arm_heartbeat();
                        }
                    }
                    event = self.repl_rx.recv() => {
                        match event {
                            Some(event) => self.drain_events(event).await,
                            None => {
                                self.target_state = TargetReplState::Shutdown;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Park while the peer catches up out-of-band, probing on each tick.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "waiting-for-catchup"))]
    async fn catchup_wait_loop(&mut self) {
        self.buffer.clear();
        self.outbound.clear();

        loop {
            if self.target_state != TargetReplState::WaitingForCatchup {
                return;
            }

            tokio::select! {
                Some(fired) = self.rx_timers.recv() => {
                    if fired.name == TimerName::Heartbeat {
                        // Heartbeats keep the peer's election timer at
                        // bay; the probe discovers when it has caught up.
                        self.send_heartbeat().await;
                        self.send_probe().await;
                        self.arm_heartbeat();
                    }
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.handle_catchup_wait_event(event).await,
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// An empty append anchored at the prune horizon; the peer answers
    /// success once its catch-up has restored that position.
    async fn send_probe(&mut self) {
        let prev = LogId::new(self.log.prev_term(), self.log.prev_index());
        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: prev,
            entries: Vec::new(),
            leader_commit: self.commit_index,
        };
        if let Err(err) = self
            .network
            .send(self.target, RaftMessage::AppendEntries(request))
            .await
        {
            tracing::debug!(target=%self.target, error=%err, "error sending catch-up probe");
        }
    }

    async fn handle_catchup_wait_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Response(response) => {
                if response.term > self.term {
                    let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                        target: self.target,
                        term: response.term,
                    });
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
                if response.success {
                    tracing::info!(
                        target=%self.target,
                        match_index=response.match_index,
                        "peer caught up, resuming log shipping"
                    );
                    self.matched = LogId::new(self.log.prev_term(), response.match_index);
                    self.next_index = response.match_index + 1;
                    let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatched {
                        target: self.target,
                        matched: self.matched,
                    });
                    self.target_state = TargetReplState::Lagging;
                } else {
                    // Still behind; remind it of the horizon.
                    self.send_prune_request().await;
                }
            }
            RaftEvent::Replicate {
                entries,
                commit_index,
                commit_term,
            } => {
                self.commit_index = commit_index;
                self.commit_term = commit_term;
                if let Some(last) = entries.last() {
                    self.last_log_index = last.log_id.index;
                }
            }
            RaftEvent::UpdateCommitIndex {
                commit_index,
                commit_term,
            } => {
                self.commit_index = commit_index;
                self.commit_term = commit_term;
            }
            RaftEvent::Terminate => {
                self.target_state = TargetReplState::Shutdown;
            }
        }
    }
}
