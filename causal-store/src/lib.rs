//! Durable cluster-state storage.
//!
//! Implements the storage seams of `causal-raft` on disk: a segmented
//! append-only Raft log with crash-safe truncation and pruning, the
//! vote/identity files, and the flushed state machine snapshots. The
//! on-disk cluster-state directory looks like:
//!
//! ```text
//! cluster-state/
//!   member-id            16-byte member identity
//!   cluster-id           16-byte cluster binding
//!   store-id             16-byte store identity
//!   vote                 (term, voted_for)
//!   store-lock           held while a process uses the directory
//!   core-state/
//!     last-flushed       snapshot header + blob checksums
//!     id-allocation      id allocation state blob
//!     lock-token         lock token state blob
//!     token-registry     token registry state blob
//!     session-tracker    session tracker state blob
//!   raft-log/
//!     segment.<version>  immutable log segments
//! ```

pub mod layout;
pub mod lock;
pub mod log;
pub mod resources;
pub mod segments;
pub mod stable;
pub mod states;

use thiserror::Error;

pub use crate::layout::ClusterStateLayout;
pub use crate::lock::StoreLock;
pub use crate::log::SegmentedLog;
pub use crate::log::SegmentedLogOptions;
pub use crate::resources::ClusterStateResources;
pub use crate::stable::FileStableStore;
pub use crate::states::FileStateFlush;

/// Errors of the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("segment {0} is corrupt: {1}")]
    CorruptSegment(u64, &'static str),
    #[error("corrupt state file {0}: {1}")]
    CorruptState(String, &'static str),
    #[error("truncate at {from} would touch pruned entries (prev {prev})")]
    TruncateBelowPrev { from: u64, prev: u64 },
    #[error("append index {index} does not follow the log at {expected}")]
    NonContiguousAppend { index: u64, expected: u64 },
    #[error("the store lock is held by another process")]
    LockContended,
}
