//! The public handle to a running Raft core task.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::CoreEvent;
use crate::core::CoreRequest;
use crate::core::RaftCore;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ReplicationError;
use crate::log::RaftLog;
use crate::message::Inbound;
use crate::metrics::CoreMetrics;
use crate::metrics::Wait;
use crate::operation::DistributedOperation;
use crate::operation::LogEntry;
use crate::storage::CoreSnapshot;
use crate::storage::InitialState;
use crate::storage::LogStore;
use crate::storage::StableStore;
use crate::LogId;
use crate::MemberId;
use crate::Outbound;

pub use crate::core::ClientWriteResponse;
pub use crate::core::State;

struct HandleInner {
    tx_api: mpsc::UnboundedSender<CoreRequest>,
    rx_metrics: watch::Receiver<CoreMetrics>,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The interface to a running member core.
///
/// Cheap to clone; all methods funnel into the core task's queue.
#[derive(Clone)]
pub struct RaftHandle {
    inner: Arc<HandleInner>,
}

/// Channels wiring the core to the applier and the surrounding node.
pub struct CoreWiring {
    /// Commit index feed towards the applier.
    pub(crate) tx_commit: watch::Sender<u64>,
    /// Core events (catch-up required, leader changes).
    pub(crate) tx_events: mpsc::UnboundedSender<CoreEvent>,
    /// The request queue, shared with the applier's flush notifications.
    pub(crate) tx_api: mpsc::UnboundedSender<CoreRequest>,
    pub(crate) rx_api: mpsc::UnboundedReceiver<CoreRequest>,
}

impl CoreWiring {
    /// Create the channel set for one member: the wiring itself, the
    /// commit feed for the applier and the event feed for the node.
    pub fn new() -> (Self, watch::Receiver<u64>, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx_commit, rx_commit) = watch::channel(0u64);
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        (
            Self {
                tx_commit,
                tx_events,
                tx_api,
                rx_api,
            },
            rx_commit,
            rx_events,
        )
    }

    /// A sender the applier uses for flush notifications.
    pub(crate) fn api_sender(&self) -> mpsc::UnboundedSender<CoreRequest> {
        self.tx_api.clone()
    }
}

impl RaftHandle {
    /// Spawn the core task and return its handle.
    pub fn spawn<L: LogStore, S: StableStore, N: Outbound>(
        id: MemberId,
        config: Arc<Config>,
        initial: InitialState,
        network: Arc<N>,
        log: Arc<RaftLog<L>>,
        stable: Arc<S>,
        rx_last_applied: watch::Receiver<LogId>,
        wiring: CoreWiring,
    ) -> Self {
        let (tx_metrics, rx_metrics) = watch::channel(CoreMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let tx_api = wiring.tx_api.clone();
        let core_handle = RaftCore::spawn(
            id,
            config,
            initial,
            network,
            log,
            stable,
            wiring.rx_api,
            wiring.tx_commit,
            rx_last_applied,
            wiring.tx_events,
            tx_metrics,
            rx_shutdown,
        );
        Self {
            inner: Arc::new(HandleInner {
                tx_api,
                rx_metrics,
                core_handle: Mutex::new(Some(core_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
            }),
        }
    }

    /// Enqueue a decoded peer message. Called by the inbound dispatcher.
    pub fn inbound(&self, inbound: Inbound) -> Result<(), RaftError> {
        self.inner
            .tx_api
            .send(CoreRequest::Inbound(inbound))
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit an operation for append and commitment.
    ///
    /// Resolves once the operation is committed cluster-wide (not yet
    /// applied), or with `NotLeader` carrying the leader hint.
    pub async fn client_write(
        &self,
        op: DistributedOperation,
    ) -> Result<ClientWriteResponse, ReplicationError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(CoreRequest::ClientWrite { op, tx })
            .map_err(|_| ReplicationError::ShuttingDown)?;
        rx.await.map_err(|_| ReplicationError::ShuttingDown)?
    }

    /// Bootstrap a pristine member with the initial voting set.
    pub async fn initialize(&self, members: BTreeSet<MemberId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(CoreRequest::Initialize { members, tx })
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?
    }

    /// Install a snapshot pulled by the catch-up client. The state
    /// machine side must be installed on the applier first.
    pub async fn install_snapshot(&self, snapshot: CoreSnapshot) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(CoreRequest::InstallSnapshot { snapshot, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Append a tail of committed entries pulled by the catch-up client.
    pub async fn install_committed_tail(&self, entries: Vec<LogEntry>) -> RaftResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(CoreRequest::InstallCommittedTail { entries, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// The current leader, as far as this member knows.
    pub fn current_leader(&self) -> Option<MemberId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<CoreMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut down this member's core task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}
