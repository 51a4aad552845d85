//! Durable state machine snapshots.
//!
//! Each state machine's blob lands in its own file; the `last-flushed`
//! checkpoint is written last and records the covered log position, the
//! member set and a crc32 per blob. A flush whose checkpoint never made
//! it to disk is invisible after recovery, so the files always describe
//! one consistent position.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use causal_raft::marshal;
use causal_raft::storage::CoreSnapshot;
use causal_raft::storage::StateFlush;

use crate::layout::state_blob_name;
use crate::layout::ClusterStateLayout;
use crate::stable::write_atomically;
use crate::StoreError;

const CHECKPOINT_MAGIC: u32 = 0x4c46_5348;

pub struct FileStateFlush {
    layout: ClusterStateLayout,
}

impl FileStateFlush {
    pub fn new(layout: ClusterStateLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        Ok(Self { layout })
    }
}

#[async_trait]
impl StateFlush for FileStateFlush {
    async fn flush(&self, snapshot: &CoreSnapshot) -> Result<()> {
        // Blob files first; the checkpoint is the commit point.
        for (kind, blob) in &snapshot.app_states {
            let path = self.layout.state_blob_file(state_blob_name(*kind));
            write_atomically(&path, blob).await.context("writing state blob")?;
        }

        let mut checkpoint = BytesMut::new();
        checkpoint.put_u32(CHECKPOINT_MAGIC);
        checkpoint.put_u64(snapshot.prev_index);
        checkpoint.put_u64(snapshot.prev_term);
        checkpoint.put_u32(snapshot.members.len() as u32);
        for member in &snapshot.members {
            marshal::put_member_id(&mut checkpoint, *member);
        }
        checkpoint.put_u32(snapshot.app_states.len() as u32);
        for (kind, blob) in &snapshot.app_states {
            checkpoint.put_u8(*kind);
            checkpoint.put_u32(blob_crc(blob));
        }
        write_atomically(&self.layout.last_flushed_file(), &checkpoint)
            .await
            .context("writing checkpoint")?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<CoreSnapshot>> {
        let raw = match tokio::fs::read(self.layout.last_flushed_file()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("reading checkpoint"),
        };
        let mut buf = Bytes::from(raw);

        let corrupt = |what: &'static str| {
            StoreError::CorruptState("last-flushed".to_string(), what)
        };
        if marshal::get_u32(&mut buf).map_err(|_| corrupt("short header"))? != CHECKPOINT_MAGIC {
            return Err(corrupt("bad magic").into());
        }
        let prev_index = marshal::get_u64(&mut buf).map_err(|_| corrupt("short header"))?;
        let prev_term = marshal::get_u64(&mut buf).map_err(|_| corrupt("short header"))?;
        let n_members = marshal::get_u32(&mut buf).map_err(|_| corrupt("short header"))?;
        let mut members = std::collections::BTreeSet::new();
        for _ in 0..n_members {
            members.insert(marshal::get_member_id(&mut buf).map_err(|_| corrupt("short members"))?);
        }

        let n_blobs = marshal::get_u32(&mut buf).map_err(|_| corrupt("short blob list"))?;
        let mut app_states = BTreeMap::new();
        for _ in 0..n_blobs {
            let kind = marshal::get_u8(&mut buf).map_err(|_| corrupt("short blob list"))?;
            let expected_crc = marshal::get_u32(&mut buf).map_err(|_| corrupt("short blob list"))?;

            let name = state_blob_name(kind);
            let blob = tokio::fs::read(self.layout.state_blob_file(name))
                .await
                .with_context(|| format!("reading state blob {}", name))?;
            if blob_crc(&blob) != expected_crc {
                return Err(StoreError::CorruptState(name.to_string(), "crc mismatch").into());
            }
            app_states.insert(kind, Bytes::from(blob));
        }

        Ok(Some(CoreSnapshot {
            prev_index,
            prev_term,
            members,
            app_states,
        }))
    }
}

fn blob_crc(blob: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(blob);
    hasher.finalize()
}
