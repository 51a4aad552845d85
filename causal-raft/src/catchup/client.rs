//! The catch-up client.
//!
//! Pulls, in order: the remote store id (mismatch is fatal), a store
//! copy when the local member is pristine, the committed transaction
//! tail, and a core snapshot when the tail has been pruned away. The
//! whole run is bounded by a total time budget; individual attempts
//! retry with exponential backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::applier::ApplierHandle;
use crate::backoff::Backoff;
use crate::catchup::server::StoreResources;
use crate::catchup::CatchupRequest;
use crate::catchup::CatchupResponse;
use crate::catchup::CatchupStatus;
use crate::config::Config;
use crate::error::CatchupError;
use crate::error::ProtocolViolation;
use crate::handle::RaftHandle;
use crate::monitor::CatchupMonitor;
use crate::operation::LogEntry;
use crate::transport::codec;
use crate::MemberId;
use crate::StoreId;

/// Resolves catch-up addresses for members.
pub trait CatchupAddresses: Send + Sync + 'static {
    fn resolve(&self, member: MemberId) -> Option<SocketAddr>;
}

impl CatchupAddresses for std::collections::HashMap<MemberId, SocketAddr> {
    fn resolve(&self, member: MemberId) -> Option<SocketAddr> {
        self.get(&member).copied()
    }
}

/// See the module docs.
pub struct CatchupClient<M: CatchupMonitor> {
    store_id: StoreId,
    config: Arc<Config>,
    raft: RaftHandle,
    applier: ApplierHandle,
    addresses: Arc<dyn CatchupAddresses>,
    resources: Arc<dyn StoreResources>,
    monitor: Arc<M>,
}

impl<M: CatchupMonitor> CatchupClient<M> {
    pub fn new(
        store_id: StoreId,
        config: Arc<Config>,
        raft: RaftHandle,
        applier: ApplierHandle,
        addresses: Arc<dyn CatchupAddresses>,
        resources: Arc<dyn StoreResources>,
        monitor: Arc<M>,
    ) -> Self {
        Self {
            store_id,
            config,
            raft,
            applier,
            addresses,
            resources,
            monitor,
        }
    }

    /// Run a full catch-up against `from`, returning the last pulled
    /// index.
    #[tracing::instrument(level = "info", skip(self), fields(from = %from))]
    pub async fn catch_up(&self, from: MemberId) -> Result<u64, CatchupError> {
        let addr = self
            .addresses
            .resolve(from)
            .ok_or_else(|| CatchupError::General(format!("no catch-up address for {}", from)))?;

        self.monitor.catchup_started(from);
        let deadline = Instant::now() + Duration::from_millis(self.config.catchup_max_total_time);
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.catchup_backoff_base),
            Duration::from_millis(self.config.catchup_backoff_upper),
        );

        loop {
            let attempt = timeout_at(deadline, self.attempt(from, addr)).await;
            match attempt {
                Ok(Ok(last_index)) => {
                    self.monitor.catchup_finished(from, last_index);
                    tracing::info!(last_index, "catch-up complete");
                    return Ok(last_index);
                }
                Ok(Err(err)) if err.is_recoverable() => {
                    self.monitor.catchup_failed(from, &err.to_string());
                    let delay = backoff.increment();
                    tracing::warn!(error=%err, ?delay, "catch-up attempt failed, backing off");
                    if Instant::now() + delay >= deadline {
                        return Err(CatchupError::BudgetExceeded);
                    }
                    sleep(delay).await;
                }
                Ok(Err(err)) => {
                    self.monitor.catchup_failed(from, &err.to_string());
                    return Err(err);
                }
                Err(_) => {
                    self.monitor.catchup_failed(from, "time budget exceeded");
                    return Err(CatchupError::BudgetExceeded);
                }
            }
        }
    }

    async fn attempt(&self, from: MemberId, addr: SocketAddr) -> Result<u64, CatchupError> {
        let mut conn = Connection::open(addr).await?;

        // 1. The stores must match.
        conn.request(&CatchupRequest::GetStoreId).await?;
        match conn.response().await? {
            CatchupResponse::StoreId(remote) if remote == self.store_id => {}
            CatchupResponse::StoreId(_) => {
                return Err(CatchupError::StoreIdMismatch { remote: from });
            }
            other => return Err(unexpected(&other)),
        }

        // 2. A pristine member first copies the remote store files.
        if self.applier.last_applied().index == 0 && self.raft.metrics().borrow().last_log_index == 0 {
            self.store_copy(&mut conn).await?;
        }

        // 3. Pull the committed transaction tail; fall back to a core
        // snapshot when our position has been pruned remotely.
        loop {
            let previous = self.raft.metrics().borrow().last_log_index;
            conn.request(&CatchupRequest::TxPull {
                previous_tx_id: previous,
                store_id: self.store_id,
            })
            .await?;

            match self.drain_tx_stream(&mut conn).await? {
                TxStreamOutcome::Done { last_tx_id } => return Ok(last_tx_id),
                TxStreamOutcome::Pruned => {
                    self.install_snapshot(&mut conn).await?;
                }
            }
        }
    }

    async fn store_copy(&self, conn: &mut Connection) -> Result<(), CatchupError> {
        conn.request(&CatchupRequest::PrepareStoreCopy).await?;
        let files = match conn.response().await? {
            CatchupResponse::PrepareStoreCopy { files, .. } => files,
            other => return Err(unexpected(&other)),
        };

        for file in files {
            tracing::info!(name=%file.name, length=file.length, "copying store file");
            conn.request(&CatchupRequest::GetFile {
                name: file.name.clone(),
            })
            .await?;

            match conn.response().await? {
                CatchupResponse::FileHeader { name, .. } if name == file.name => {}
                CatchupResponse::StoreCopyFinished { status } => {
                    return Err(status_error(status, None));
                }
                other => return Err(unexpected(&other)),
            }

            let mut writer = self
                .resources
                .create(&file.name)
                .await
                .map_err(|err| CatchupError::General(err.to_string()))?;
            loop {
                match conn.response().await? {
                    CatchupResponse::FileChunk { bytes } => {
                        writer
                            .write_all(&bytes)
                            .await
                            .map_err(|err| CatchupError::General(err.to_string()))?;
                    }
                    CatchupResponse::StoreCopyFinished {
                        status: CatchupStatus::SuccessEndOfStream,
                    } => break,
                    CatchupResponse::StoreCopyFinished { status } => {
                        return Err(status_error(status, None));
                    }
                    other => return Err(unexpected(&other)),
                }
            }
            writer
                .shutdown()
                .await
                .map_err(|err| CatchupError::General(err.to_string()))?;
        }
        Ok(())
    }

    async fn drain_tx_stream(&self, conn: &mut Connection) -> Result<TxStreamOutcome, CatchupError> {
        let mut batch: Vec<LogEntry> = Vec::new();
        loop {
            match conn.response().await? {
                CatchupResponse::TxPull { entry } => {
                    batch.push(entry);
                    if batch.len() as u64 >= self.config.catchup_tx_batch {
                        self.install_tail(std::mem::take(&mut batch)).await?;
                    }
                }
                CatchupResponse::TxStreamFinished { status, last_tx_id } => {
                    if !batch.is_empty() {
                        self.install_tail(std::mem::take(&mut batch)).await?;
                    }
                    return match status {
                        CatchupStatus::SuccessEndOfStream => Ok(TxStreamOutcome::Done { last_tx_id }),
                        CatchupStatus::TransactionPruned => Ok(TxStreamOutcome::Pruned),
                        other => Err(status_error(other, Some(last_tx_id))),
                    };
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    async fn install_tail(&self, entries: Vec<LogEntry>) -> Result<(), CatchupError> {
        self.raft
            .install_committed_tail(entries)
            .await
            .map_err(|err| CatchupError::General(err.to_string()))?;
        Ok(())
    }

    async fn install_snapshot(&self, conn: &mut Connection) -> Result<(), CatchupError> {
        conn.request(&CatchupRequest::CoreSnapshot).await?;
        let snapshot = match conn.response().await? {
            CatchupResponse::CoreSnapshot { snapshot } => snapshot,
            other => return Err(unexpected(&other)),
        };
        tracing::info!(
            prev_index = snapshot.prev_index,
            prev_term = snapshot.prev_term,
            "installing pulled snapshot"
        );

        // State machines first, then the log; the applier's position must
        // never trail a reset log.
        self.applier
            .install_snapshot(snapshot.clone())
            .await
            .map_err(|err| CatchupError::General(err.to_string()))?;
        self.raft
            .install_snapshot(snapshot)
            .await
            .map_err(|err| CatchupError::General(err.to_string()))?;
        Ok(())
    }
}

enum TxStreamOutcome {
    Done { last_tx_id: u64 },
    Pruned,
}

fn unexpected(response: &CatchupResponse) -> CatchupError {
    CatchupError::Protocol(ProtocolViolation::UnexpectedMessage(response.wire_tag()))
}

fn status_error(status: CatchupStatus, _last_tx_id: Option<u64>) -> CatchupError {
    match status {
        CatchupStatus::SuccessEndOfStream => CatchupError::General("unexpected success status".into()),
        CatchupStatus::TransactionPruned => CatchupError::TransactionPruned,
        CatchupStatus::StoreIdMismatch => CatchupError::General("store id mismatch".into()),
        CatchupStatus::GeneralError => CatchupError::General("remote reported a failure".into()),
    }
}

/// One handshaken catch-up connection.
struct Connection {
    stream: TcpStream,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Result<Self, CatchupError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|err| CatchupError::Network(err.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|err| CatchupError::Network(err.to_string()))?;

        let mut hello = BytesMut::new();
        codec::Hello::current().marshal(&mut hello);
        codec::write_frame(&mut stream, codec::TAG_HELLO, &hello)
            .await
            .map_err(|err| CatchupError::Network(err.to_string()))?;

        match codec::read_frame(&mut stream)
            .await
            .map_err(|err| CatchupError::Network(err.to_string()))?
        {
            Some((codec::TAG_SWITCHOVER, mut body)) => {
                let switchover = codec::Switchover::unmarshal(&mut body)?;
                if !codec::SUPPORTED_APP_VERSIONS.contains(&switchover.chosen_app_version) {
                    return Err(CatchupError::Protocol(ProtocolViolation::Malformed(
                        "unsupported switchover version",
                    )));
                }
            }
            Some((tag, _)) => {
                return Err(CatchupError::Protocol(ProtocolViolation::UnexpectedMessage(tag)));
            }
            None => return Err(CatchupError::Network("closed during handshake".into())),
        }
        Ok(Self { stream })
    }

    async fn request(&mut self, request: &CatchupRequest) -> Result<(), CatchupError> {
        let mut body = BytesMut::new();
        request.marshal(&mut body);
        codec::write_frame(&mut self.stream, request.wire_tag(), &body)
            .await
            .map_err(|err| CatchupError::Network(err.to_string()))
    }

    async fn response(&mut self) -> Result<CatchupResponse, CatchupError> {
        match codec::read_frame(&mut self.stream)
            .await
            .map_err(|err| CatchupError::Network(err.to_string()))?
        {
            Some((tag, mut body)) => Ok(CatchupResponse::unmarshal(tag, &mut body)?),
            None => Err(CatchupError::Network("stream closed mid-protocol".into())),
        }
    }
}
