//! Observable state of a cluster member, published on a watch channel.
//!
//! Consumers clone the receiver and either sample it or use [`Wait`] to
//! block until some condition holds, which is how the integration tests
//! synchronize with the core.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::State;
use crate::MemberId;

/// A snapshot of one member's externally observable state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreMetrics {
    /// This member's id.
    pub id: MemberId,
    /// The member's current role.
    pub state: State,
    /// The member's current term.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The highest committed index.
    pub commit_index: u64,
    /// The index of the highest applied entry.
    pub last_applied: u64,
    /// The current cluster leader, as far as this member knows.
    pub current_leader: Option<MemberId>,
    /// The voting member set.
    pub membership: BTreeSet<MemberId>,
    /// The log index covered by the last flushed snapshot.
    pub snapshot_index: u64,
}

impl CoreMetrics {
    pub fn new_initial(id: MemberId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            membership: BTreeSet::new(),
            snapshot_index: 0,
        }
    }
}

/// Error returned by [`Wait`].
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    #[error("the metrics channel is closed")]
    Closed,
}

/// Waits for the metrics to satisfy a condition, within a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<CoreMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for the current metrics.
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<CoreMetrics, WaitError>
    where
        T: Fn(&CoreMetrics) -> bool + Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait satisfied: {} metrics: {:?}", msg, latest);
                return Ok(latest);
            }

            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Closed),
                Err(_) => {
                    let latest = rx.borrow().clone();
                    tracing::debug!("wait timed out: {} metrics: {:?}", msg, latest);
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
            }
        }
    }

    /// Wait for `last_applied` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<CoreMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied >= want_log,
            &format!("{} .last_log_index and .last_applied >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the member to assume `want_state`.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<CoreMetrics, WaitError> {
        self.metrics(
            |m| m.state == want_state,
            &format!("{} .state == {:?}", msg, want_state),
        )
        .await
    }

    /// Wait for the member to observe `leader` as the current leader.
    pub async fn current_leader(&self, leader: MemberId, msg: &str) -> Result<CoreMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} .current_leader == {}", msg, leader),
        )
        .await
    }
}
