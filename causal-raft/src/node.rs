//! Assembly of one cluster member.
//!
//! [`RaftMember::assemble`] wires the core task, the applier, the
//! replicator and the progress tracker over any [`Outbound`]
//! implementation; [`RaftNode::start`] additionally binds the TCP
//! transport and catch-up servers and drives catch-up runs from core
//! events.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::applier::Applier;
use crate::applier::ApplierHandle;
use crate::catchup::client::CatchupAddresses;
use crate::catchup::client::CatchupClient;
use crate::catchup::server::CatchupServer;
use crate::catchup::server::StoreResources;
use crate::config::Config;
use crate::core::CoreEvent;
use crate::handle::CoreWiring;
use crate::handle::RaftHandle;
use crate::log::RaftLog;
use crate::monitor::NoopMonitor;
use crate::replicator::progress::ProgressTracker;
use crate::replicator::session::LocalSessionPool;
use crate::replicator::Replicator;
use crate::state_machines::CoreStateMachines;
use crate::state_machines::TransactionApplier;
use crate::storage::InitialState;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::storage::StateFlush;
use crate::transport::inbound::RaftServer;
use crate::transport::outbound::AddressBook;
use crate::transport::outbound::OutboundChannels;
use crate::ClusterId;
use crate::LogId;
use crate::MemberId;
use crate::Outbound;

/// One assembled member, transport-agnostic.
pub struct RaftMember<L: LogStore> {
    pub id: MemberId,
    pub raft: RaftHandle,
    pub replicator: Arc<Replicator>,
    pub applier: ApplierHandle,
    pub progress: Arc<ProgressTracker>,
    pub log: Arc<RaftLog<L>>,
    /// Core events; taken by whoever drives catch-up.
    pub rx_events: mpsc::UnboundedReceiver<CoreEvent>,
}

impl<L: LogStore> RaftMember<L> {
    /// Recover durable state and wire up the member over the given
    /// outbound implementation.
    pub async fn assemble<S: StableStore, F: StateFlush, N: Outbound>(
        config: Arc<Config>,
        log_store: Arc<L>,
        stable: Arc<S>,
        flush: Arc<F>,
        tx_applier: Box<dyn TransactionApplier>,
        network: Arc<N>,
        initial_members: BTreeSet<MemberId>,
    ) -> Result<RaftMember<L>> {
        let id = stable.member_id().await?;
        let vote = stable.read_vote().await?;

        // Recover the applied state machines from the last durable flush.
        let mut machines = CoreStateMachines::new(initial_members.clone(), tx_applier);
        if let Some(snapshot) = flush.read().await? {
            machines.install(&snapshot)?;
            tracing::info!(id=%id, up_to = snapshot.prev_index, "recovered flushed state");
        }

        let log = Arc::new(RaftLog::new(log_store, &config));
        let append_index = log.append_index();
        let last_log_term = log
            .read_entry_term(append_index)
            .await?
            .unwrap_or(machines.last_applied().term);
        let last_log_id = LogId::new(last_log_term, append_index);

        let membership = if machines.members().is_empty() {
            initial_members
        } else {
            machines.members().clone()
        };
        let initial = InitialState {
            vote,
            last_log_id,
            last_applied: machines.last_applied(),
            membership,
        };

        let sessions = LocalSessionPool::new(id);
        let progress = Arc::new(ProgressTracker::new(sessions.global_session()));

        let (wiring, rx_commit, rx_events) = CoreWiring::new();
        let (applier, _applier_task) = Applier::spawn(
            log.clone(),
            machines,
            flush,
            config.clone(),
            progress.clone(),
            rx_commit,
            wiring.api_sender(),
        );

        let raft = RaftHandle::spawn(
            id,
            config.clone(),
            initial,
            network,
            log.clone(),
            stable,
            applier.watch_last_applied(),
            wiring,
        );
        let replicator = Arc::new(Replicator::new(
            raft.clone(),
            config,
            sessions,
            progress.clone(),
        ));

        Ok(RaftMember {
            id,
            raft,
            replicator,
            applier,
            progress,
            log,
            rx_events,
        })
    }
}

/// Transport addresses and listeners for one member.
pub struct TransportOptions {
    /// Where to accept Raft traffic. Use port 0 for an ephemeral port.
    pub listen_raft: SocketAddr,
    /// Where to accept catch-up traffic.
    pub listen_catchup: SocketAddr,
    /// Raft addresses of the other members.
    pub addresses: Arc<AddressBook>,
    /// Catch-up addresses of the other members.
    pub catchup_addresses: Arc<dyn CatchupAddresses>,
}

/// A fully started member: core, applier, replicator, TCP transport and
/// catch-up client/server.
pub struct RaftNode<L: LogStore> {
    pub id: MemberId,
    pub raft: RaftHandle,
    pub replicator: Arc<Replicator>,
    pub applier: ApplierHandle,
    pub log: Arc<RaftLog<L>>,
    raft_server: RaftServer,
    catchup_server: CatchupServer,
    driver: JoinHandle<()>,
    tx_binding: watch::Sender<Option<ClusterId>>,
}

impl<L: LogStore> RaftNode<L> {
    #[allow(clippy::too_many_arguments)]
    pub async fn start<S: StableStore, F: StateFlush>(
        config: Arc<Config>,
        cluster: ClusterId,
        log_store: Arc<L>,
        stable: Arc<S>,
        flush: Arc<F>,
        tx_applier: Box<dyn TransactionApplier>,
        initial_members: BTreeSet<MemberId>,
        transport: TransportOptions,
        resources: Arc<dyn StoreResources>,
    ) -> Result<RaftNode<L>> {
        let store_id = stable.store_id().await?;

        // Bind the member to its cluster before any message can flow.
        match stable.cluster_id().await? {
            Some(bound) if bound != cluster => {
                anyhow::bail!("member is bound to cluster {}, refusing to join {}", bound, cluster)
            }
            Some(_) => {}
            None => stable.bind_cluster(cluster).await?,
        }
        let (tx_binding, rx_binding) = watch::channel(Some(cluster));

        let member_id = stable.member_id().await?;
        let network = Arc::new(OutboundChannels::new(
            member_id,
            cluster,
            config.clone(),
            transport.addresses.clone(),
        ));

        let member = RaftMember::assemble(
            config.clone(),
            log_store,
            stable,
            flush,
            tx_applier,
            network,
            initial_members,
        )
        .await?;

        let raft_server = RaftServer::spawn(
            transport.listen_raft,
            rx_binding,
            member.raft.clone(),
            Arc::new(NoopMonitor),
        )
        .await?;
        let catchup_server = CatchupServer::spawn(
            transport.listen_catchup,
            store_id,
            config.clone(),
            member.log.clone(),
            member.applier.clone(),
            resources.clone(),
        )
        .await?;

        let catchup_client = CatchupClient::new(
            store_id,
            config,
            member.raft.clone(),
            member.applier.clone(),
            transport.catchup_addresses,
            resources,
            Arc::new(NoopMonitor),
        );
        let driver = tokio::spawn(
            drive_events(member.rx_events, catchup_client, member.progress.clone())
                .instrument(tracing::debug_span!("event-driver", id=%member.id)),
        );

        Ok(RaftNode {
            id: member.id,
            raft: member.raft,
            replicator: member.replicator,
            applier: member.applier,
            log: member.log,
            raft_server,
            catchup_server,
            driver,
            tx_binding,
        })
    }

    /// The bound Raft listen address.
    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_server.local_addr()
    }

    /// The bound catch-up listen address.
    pub fn catchup_addr(&self) -> SocketAddr {
        self.catchup_server.local_addr()
    }

    /// Drop the cluster binding, so inbound messages are rejected while
    /// shutting down.
    pub fn unbind(&self) {
        let _ = self.tx_binding.send(None);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.driver.abort();
        self.raft_server.abort();
        drop(self.catchup_server);
        self.raft.shutdown().await
    }
}

/// React to core events: run catch-up when the member falls behind the
/// leader's prune horizon, and wake replication waiters on leader
/// changes.
async fn drive_events<M: crate::monitor::CatchupMonitor>(
    mut rx_events: mpsc::UnboundedReceiver<CoreEvent>,
    catchup: CatchupClient<M>,
    progress: Arc<ProgressTracker>,
) {
    while let Some(event) = rx_events.recv().await {
        match event {
            CoreEvent::CatchupRequired {
                source_hint,
                required_index,
            } => {
                tracing::info!(source=%source_hint, required_index, "starting catch-up");
                match catchup.catch_up(source_hint).await {
                    Ok(last_index) => {
                        tracing::info!(last_index, "catch-up finished");
                    }
                    Err(err) => {
                        tracing::warn!(error=%err, "catch-up failed");
                    }
                }
            }
            CoreEvent::LeaderChanged { leader } => {
                tracing::debug!(?leader, "leader changed");
                progress.trigger_replication_event();
            }
        }
    }
}
