//! The state-machine applier.
//!
//! A dedicated task that consumes committed entries in strict index
//! order, feeds them through the replicated state machines, and delivers
//! results to the progress tracker. The applier periodically flushes the
//! machine state durably; each flush advances the log prune horizon via a
//! notification back to the Raft loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::CoreRequest;
use crate::log::RaftLog;
use crate::replicator::progress::ProgressTracker;
use crate::state_machines::CoreStateMachines;
use crate::storage::CoreSnapshot;
use crate::storage::LogStore;
use crate::storage::StateFlush;
use crate::LogId;

/// Commands served by the applier task besides the committed-entry feed.
pub(crate) enum ApplierCmd {
    /// Replace all machine state from a snapshot pulled by catch-up, and
    /// flush it durably.
    InstallSnapshot {
        snapshot: CoreSnapshot,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Capture a snapshot at the current applied position, for the
    /// catch-up server.
    TakeSnapshot { tx: oneshot::Sender<CoreSnapshot> },
}

/// Handle to a spawned applier.
#[derive(Clone)]
pub struct ApplierHandle {
    tx_cmd: mpsc::Sender<ApplierCmd>,
    rx_last_applied: watch::Receiver<LogId>,
}

impl ApplierHandle {
    /// The position of the last applied entry.
    pub fn last_applied(&self) -> LogId {
        *self.rx_last_applied.borrow()
    }

    pub fn watch_last_applied(&self) -> watch::Receiver<LogId> {
        self.rx_last_applied.clone()
    }

    /// Install a snapshot into the state machines and flush it durably.
    pub async fn install_snapshot(&self, snapshot: CoreSnapshot) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx_cmd
            .send(ApplierCmd::InstallSnapshot { snapshot, tx })
            .await
            .map_err(|_| anyhow::anyhow!("applier is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("applier is gone"))?
    }

    /// Capture a snapshot at the current applied position.
    pub async fn take_snapshot(&self) -> Result<CoreSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx_cmd
            .send(ApplierCmd::TakeSnapshot { tx })
            .await
            .map_err(|_| anyhow::anyhow!("applier is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("applier is gone"))
    }
}

pub(crate) struct Applier<L: LogStore, F: StateFlush> {
    log: Arc<RaftLog<L>>,
    machines: CoreStateMachines,
    flush_store: Arc<F>,
    config: Arc<Config>,
    progress: Arc<ProgressTracker>,
    rx_commit: watch::Receiver<u64>,
    rx_cmd: mpsc::Receiver<ApplierCmd>,
    tx_last_applied: watch::Sender<LogId>,
    core_tx: mpsc::UnboundedSender<CoreRequest>,
    applied_since_flush: u64,
}

impl<L: LogStore, F: StateFlush> Applier<L, F> {
    /// Spawn the applier task. `machines` must already reflect the last
    /// flushed state; application resumes from its applied position as
    /// the commit index advances.
    pub(crate) fn spawn(
        log: Arc<RaftLog<L>>,
        machines: CoreStateMachines,
        flush_store: Arc<F>,
        config: Arc<Config>,
        progress: Arc<ProgressTracker>,
        rx_commit: watch::Receiver<u64>,
        core_tx: mpsc::UnboundedSender<CoreRequest>,
    ) -> (ApplierHandle, JoinHandle<Result<()>>) {
        let (tx_cmd, rx_cmd) = mpsc::channel(8);
        let (tx_last_applied, rx_last_applied) = watch::channel(machines.last_applied());
        let this = Self {
            log,
            machines,
            flush_store,
            config,
            progress,
            rx_commit,
            rx_cmd,
            tx_last_applied,
            core_tx,
            applied_since_flush: 0,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("applier")));
        (
            ApplierHandle {
                tx_cmd,
                rx_last_applied,
            },
            handle,
        )
    }

    async fn main(mut self) -> Result<()> {
        loop {
            tokio::select! {
                changed = self.rx_commit.changed() => {
                    if changed.is_err() {
                        tracing::debug!("commit feed closed, applier stopping");
                        return Ok(());
                    }
                    let target = *self.rx_commit.borrow_and_update();
                    self.apply_up_to(target).await?;
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Apply all committed entries up to `target`, in index order.
    async fn apply_up_to(&mut self, target: u64) -> Result<()> {
        while self.machines.last_applied().index < target {
            let next = self.machines.last_applied().index + 1;
            let entry = match self.log.read_entry(next).await? {
                Some(entry) => entry,
                None => {
                    // The entry is not readable yet; a snapshot install is
                    // racing us. The next commit notification retries.
                    tracing::warn!(index = next, "committed entry not readable yet");
                    return Ok(());
                }
            };

            let applied = self.machines.apply_entry(&entry)?;
            if let Some((session, op)) = applied.operation {
                match applied.result {
                    Some(result) => self.progress.track_result(&session, op, result),
                    None => {
                        // A duplicate whose original result has aged out
                        // of the session tracker's window. A local waiter
                        // can never be answered; complete it
                        // exceptionally instead of leaving it parked.
                        if session == self.progress.global_session() {
                            tracing::warn!(
                                seq = op.sequence_number,
                                "duplicate result no longer cached, aborting waiter"
                            );
                            self.progress.abort(op);
                        }
                    }
                }
            }
            let _ = self.tx_last_applied.send(self.machines.last_applied());

            self.applied_since_flush += 1;
            if self.applied_since_flush >= self.config.flush_interval {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Persist the machine state; the covered position is recorded
    /// atomically with the state inside the snapshot itself.
    async fn flush(&mut self) -> Result<()> {
        let snapshot = self.machines.snapshot();
        self.flush_store.flush(&snapshot).await?;
        self.applied_since_flush = 0;
        tracing::debug!(up_to = snapshot.prev_index, "applier state flushed");
        let _ = self.core_tx.send(CoreRequest::Flushed {
            up_to: snapshot.prev_index,
        });
        Ok(())
    }

    async fn handle_cmd(&mut self, cmd: ApplierCmd) -> Result<()> {
        match cmd {
            ApplierCmd::InstallSnapshot { snapshot, tx } => {
                let res = self.install(snapshot).await;
                let _ = tx.send(res);
            }
            ApplierCmd::TakeSnapshot { tx } => {
                let _ = tx.send(self.machines.snapshot());
            }
        }
        Ok(())
    }

    async fn install(&mut self, snapshot: CoreSnapshot) -> Result<()> {
        self.machines.install(&snapshot)?;
        self.flush_store.flush(&snapshot).await?;
        self.applied_since_flush = 0;
        let _ = self.tx_last_applied.send(self.machines.last_applied());
        tracing::info!(up_to = snapshot.prev_index, "state machine snapshot installed");
        Ok(())
    }
}
