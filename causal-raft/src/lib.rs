//! The Raft-based replicated state machine core of a causal cluster.
//!
//! This crate implements leader election, durable log replication,
//! snapshot-based catch-up for lagging members, and the client-facing
//! replicator which resolves only after an operation has been applied
//! locally. Storage and networking are behind trait seams ([`LogStore`],
//! [`StableStore`], [`Outbound`]) so that the core can be driven both by
//! the durable store and by in-process test fixtures.

pub mod applier;
pub mod backoff;
pub mod cache;
pub mod catchup;
pub mod config;
mod core;
pub mod error;
pub mod handle;
pub mod log;
pub mod marshal;
pub mod message;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod node;
pub mod operation;
pub(crate) mod quorum;
pub(crate) mod replication;
pub mod replicator;
pub mod state_machines;
pub mod storage;
pub mod timer;
pub mod transport;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::ClientWriteResponse;
pub use crate::core::CoreEvent;
pub use crate::core::State;
pub use crate::error::CatchupError;
pub use crate::error::RaftError;
pub use crate::error::ReplicationError;
pub use crate::handle::RaftHandle;
pub use crate::metrics::CoreMetrics;
pub use crate::network::Outbound;
pub use crate::storage::LogStore;
pub use crate::storage::StableStore;

/// A stable 128-bit identifier for one member of the cluster.
///
/// Member ids are persisted alongside the cluster state and must survive
/// restarts; a process which loses its member id effectively leaves the
/// cluster and must rejoin as a fresh member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first eight hex digits identify a member well enough in logs.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// A 128-bit identifier naming one logical cluster.
///
/// Messages carrying a mismatched cluster id are dropped by the inbound
/// dispatcher, never surfaced as errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Identifies the store contents a member replicates.
///
/// Two members may only exchange transactions when their store ids match;
/// a mismatch is fatal for catch-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// The term and index of one log entry.
///
/// Log indices are 1-based and contiguous; `LogId { term: 0, index: 0 }`
/// denotes the position before the first entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A summary of a message for structured logging.
///
/// Kept separate from `Debug` so that payload bytes never end up in logs.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
