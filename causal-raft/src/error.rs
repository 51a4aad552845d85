//! Error types exposed by the cluster core.

use thiserror::Error;

use crate::MemberId;

/// A result returned by the Raft core task.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors of the Raft core itself.
///
/// Storage errors are treated as fatal: the core task shuts down so that a
/// supervisor can restart the process from durable state.
#[derive(Debug, Error)]
pub enum RaftError {
    /// An error which has come from the storage layer.
    #[error("error from storage: {0}")]
    Storage(anyhow::Error),
    /// The Raft node is shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// Errors surfaced to replication clients.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Replication was attempted on a node which is not the leader.
    ///
    /// Carries the last known leader as a hint so the caller can retry
    /// elsewhere.
    #[error("not the current leader (hint: {hint:?})")]
    NotLeader { hint: Option<MemberId> },
    /// The operation could not be persisted or broadcast within the retry
    /// bound.
    #[error("replication failed after {attempts} attempts")]
    ReplicationFailure { attempts: u32 },
    /// The operation's progress entry was aborted, typically on leader loss.
    #[error("operation aborted before a result was produced")]
    Aborted,
    /// The caller-provided deadline elapsed.
    #[error("replication timed out")]
    Timeout,
    /// The Raft node is shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// Errors produced by the catch-up client.
#[derive(Debug, Error)]
pub enum CatchupError {
    /// The remote store identity does not match the local one. Fatal: the
    /// local store is unusable for this cluster.
    #[error("store id mismatch against {remote}")]
    StoreIdMismatch { remote: MemberId },
    /// The remote has pruned past the requested transaction; a snapshot is
    /// required.
    #[error("transactions pruned on the remote, snapshot required")]
    TransactionPruned,
    /// A recoverable failure; the client retries with backoff.
    #[error("catch-up attempt failed: {0}")]
    General(String),
    /// The total time budget for the catch-up was exceeded.
    #[error("catch-up exceeded its total time budget")]
    BudgetExceeded,
    /// The remote spoke the protocol incorrectly; the channel is closed.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    /// A network-level failure; retried with backoff.
    #[error("network error during catch-up: {0}")]
    Network(String),
}

impl CatchupError {
    /// Whether another attempt may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CatchupError::General(_) | CatchupError::Network(_) | CatchupError::TransactionPruned
        )
    }
}

/// An unexpected or malformed wire message. Closes the offending channel.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("unexpected message tag 0x{0:02x} in this protocol state")]
    UnexpectedMessage(u8),
    #[error("message sent before version switchover")]
    BeforeSwitchover,
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("frame of {0} bytes exceeds the maximum")]
    OversizedFrame(usize),
}

/// Errors from the admin `initialize` command.
#[derive(Debug, Error)]
pub enum InitializeError {
    #[error("the cluster is already initialized")]
    NotAllowed,
    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Errors raised while validating a [`crate::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout must be at least twice the heartbeat interval")]
    ElectionTimeoutTooSmall,
    #[error("max payload entries must not be zero")]
    MaxPayloadEntriesTooSmall,
    #[error("backoff upper bound must be at least the base value")]
    InvalidBackoff,
    #[error("in-flight cache bounds must not be zero when the cache is enabled")]
    InvalidCacheBounds,
}
