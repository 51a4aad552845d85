//! Paths inside a cluster-state directory.

use std::path::Path;
use std::path::PathBuf;

/// The cluster-state directory of one database.
#[derive(Debug, Clone)]
pub struct ClusterStateLayout {
    root: PathBuf,
}

impl ClusterStateLayout {
    /// The layout rooted at `<data_dir>/<database>/cluster-state`.
    pub fn for_database(data_dir: &Path, database: &str) -> Self {
        Self {
            root: data_dir.join(database).join("cluster-state"),
        }
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn member_id_file(&self) -> PathBuf {
        self.root.join("member-id")
    }

    pub fn cluster_id_file(&self) -> PathBuf {
        self.root.join("cluster-id")
    }

    pub fn store_id_file(&self) -> PathBuf {
        self.root.join("store-id")
    }

    pub fn vote_file(&self) -> PathBuf {
        self.root.join("vote")
    }

    pub fn store_lock_file(&self) -> PathBuf {
        self.root.join("store-lock")
    }

    pub fn core_state_dir(&self) -> PathBuf {
        self.root.join("core-state")
    }

    pub fn last_flushed_file(&self) -> PathBuf {
        self.core_state_dir().join("last-flushed")
    }

    pub fn state_blob_file(&self, name: &str) -> PathBuf {
        self.core_state_dir().join(name)
    }

    pub fn raft_log_dir(&self) -> PathBuf {
        self.root.join("raft-log")
    }

    pub fn segment_file(&self, version: u64) -> PathBuf {
        self.raft_log_dir().join(format!("segment.{:07}", version))
    }

    /// Create the directory tree.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.core_state_dir())?;
        std::fs::create_dir_all(self.raft_log_dir())?;
        Ok(())
    }
}

/// The blob file name for a state machine kind.
pub fn state_blob_name(kind: u8) -> &'static str {
    match kind {
        causal_raft::state_machines::kind::ID_ALLOCATION => "id-allocation",
        causal_raft::state_machines::kind::LOCK_TOKEN => "lock-token",
        causal_raft::state_machines::kind::TOKEN_REGISTRY => "token-registry",
        causal_raft::state_machines::kind::SESSION_TRACKER => "session-tracker",
        _ => "state-blob",
    }
}
