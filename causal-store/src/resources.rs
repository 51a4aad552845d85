//! Store-copy access to the cluster-state files.

use anyhow::Result;
use async_trait::async_trait;
use causal_raft::catchup::server::StoreResources;
use causal_raft::catchup::StoreFileInfo;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::layout::ClusterStateLayout;

/// The state blob files a fresh member copies before pulling
/// transactions.
const COPYABLE: &[&str] = &[
    "id-allocation",
    "lock-token",
    "token-registry",
    "session-tracker",
];

pub struct ClusterStateResources {
    layout: ClusterStateLayout,
}

impl ClusterStateResources {
    pub fn new(layout: ClusterStateLayout) -> Self {
        Self { layout }
    }

    fn is_copyable(name: &str) -> bool {
        COPYABLE.contains(&name) || name == "last-flushed"
    }
}

#[async_trait]
impl StoreResources for ClusterStateResources {
    async fn listing(&self) -> Result<Vec<StoreFileInfo>> {
        let mut files = Vec::new();
        for name in COPYABLE.iter().chain(std::iter::once(&"last-flushed")) {
            let path = self.layout.state_blob_file(name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => files.push(StoreFileInfo {
                    name: name.to_string(),
                    length: meta.len(),
                }),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(files)
    }

    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        if !Self::is_copyable(name) {
            anyhow::bail!("file {} is not part of a store copy", name);
        }
        let file = tokio::fs::File::open(self.layout.state_blob_file(name)).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, name: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        if !Self::is_copyable(name) {
            anyhow::bail!("refusing to receive unexpected store file {}", name);
        }
        self.layout.ensure_dirs()?;
        let file = tokio::fs::File::create(self.layout.state_blob_file(name)).await?;
        Ok(Box::new(file))
    }
}
