//! Durable identity and vote storage.
//!
//! The vote record is written to a temporary file, synced and renamed
//! into place, so a crash never leaves a half-written record behind. The
//! identity files hold a raw 16-byte id each and are created on first
//! access.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use causal_raft::storage::StableStore;
use causal_raft::storage::VoteRecord;
use causal_raft::ClusterId;
use causal_raft::MemberId;
use causal_raft::StoreId;
use std::path::Path;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::layout::ClusterStateLayout;

pub struct FileStableStore {
    layout: ClusterStateLayout,
}

impl FileStableStore {
    pub fn new(layout: ClusterStateLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        Ok(Self { layout })
    }

    async fn read_id_file(&self, path: &Path) -> Result<Option<u128>> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.len() == 16 => {
                Ok(Some(u128::from_be_bytes(bytes.try_into().unwrap())))
            }
            Ok(_) => anyhow::bail!("id file {:?} has the wrong length", path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("reading id file"),
        }
    }

    async fn write_id_file(&self, path: &Path, value: u128) -> Result<()> {
        write_atomically(path, &value.to_be_bytes()).await
    }
}

#[async_trait]
impl StableStore for FileStableStore {
    async fn save_vote(&self, vote: &VoteRecord) -> Result<()> {
        let mut buf = BytesMut::new();
        vote.marshal(&mut buf);
        write_atomically(&self.layout.vote_file(), &buf).await
    }

    async fn read_vote(&self) -> Result<VoteRecord> {
        match tokio::fs::read(self.layout.vote_file()).await {
            Ok(bytes) => {
                let mut read = bytes::Bytes::from(bytes);
                VoteRecord::unmarshal(&mut read).map_err(|err| anyhow::anyhow!("corrupt vote file: {}", err))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(VoteRecord::default()),
            Err(err) => Err(err).context("reading vote file"),
        }
    }

    async fn member_id(&self) -> Result<MemberId> {
        let path = self.layout.member_id_file();
        if let Some(raw) = self.read_id_file(&path).await? {
            return Ok(MemberId::from_u128(raw));
        }
        let id = MemberId::random();
        self.write_id_file(&path, id.as_u128()).await?;
        tracing::info!(%id, "created member identity");
        Ok(id)
    }

    async fn cluster_id(&self) -> Result<Option<ClusterId>> {
        Ok(self
            .read_id_file(&self.layout.cluster_id_file())
            .await?
            .map(ClusterId::from_u128))
    }

    async fn bind_cluster(&self, cluster: ClusterId) -> Result<()> {
        if let Some(bound) = self.cluster_id().await? {
            if bound != cluster {
                anyhow::bail!("already bound to cluster {}", bound);
            }
            return Ok(());
        }
        self.write_id_file(&self.layout.cluster_id_file(), cluster.as_u128()).await?;
        tracing::info!(%cluster, "bound to cluster");
        Ok(())
    }

    async fn store_id(&self) -> Result<StoreId> {
        let path = self.layout.store_id_file();
        if let Some(raw) = self.read_id_file(&path).await? {
            return Ok(StoreId::from_u128(raw));
        }
        let id = StoreId::random();
        self.write_id_file(&path, id.as_u128()).await?;
        Ok(id)
    }
}

/// Write a small file durably: temp, sync, rename.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> FileStableStore {
        FileStableStore::new(ClusterStateLayout::at(dir.to_path_buf())).unwrap()
    }

    #[tokio::test]
    async fn vote_round_trips_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let stable = store(dir.path());

        assert_eq!(stable.read_vote().await.unwrap(), VoteRecord::default());

        let vote = VoteRecord {
            term: 12,
            voted_for: Some(MemberId::from_u128(3)),
        };
        stable.save_vote(&vote).await.unwrap();
        assert_eq!(stable.read_vote().await.unwrap(), vote);
    }

    #[tokio::test]
    async fn member_id_is_stable_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path()).member_id().await.unwrap();
        let second = store(dir.path()).member_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cluster_binding_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let stable = store(dir.path());
        assert!(stable.cluster_id().await.unwrap().is_none());

        let cluster = ClusterId::from_u128(0xb0);
        stable.bind_cluster(cluster).await.unwrap();
        assert_eq!(stable.cluster_id().await.unwrap(), Some(cluster));

        // Rebinding to the same cluster is a no-op; another cluster is
        // refused.
        stable.bind_cluster(cluster).await.unwrap();
        assert!(stable.bind_cluster(ClusterId::from_u128(0xb1)).await.is_err());
    }
}
