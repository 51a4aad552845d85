//! The catch-up server.
//!
//! Serves store-id checks, store file copies, committed transaction
//! tails and core snapshots to lagging members. Transaction tails are
//! read through a ref-counted log cursor, so pruning of the served
//! segments is deferred until the stream completes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::applier::ApplierHandle;
use crate::catchup::CatchupRequest;
use crate::catchup::CatchupResponse;
use crate::catchup::CatchupStatus;
use crate::catchup::StoreFileInfo;
use crate::config::Config;
use crate::log::RaftLog;
use crate::storage::LogReader;
use crate::storage::LogStore;
use crate::transport::codec;
use crate::StoreId;

/// Access to the durable store files offered for store copy.
#[async_trait]
pub trait StoreResources: Send + Sync + 'static {
    /// List the files a new member needs.
    async fn listing(&self) -> Result<Vec<StoreFileInfo>>;

    /// Open one file for streaming.
    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Create one file while receiving a store copy.
    async fn create(&self, name: &str) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>;
}

/// A resource provider with no files, for members without a separate
/// store (tests, tooling).
pub struct NoStoreResources;

#[async_trait]
impl StoreResources for NoStoreResources {
    async fn listing(&self) -> Result<Vec<StoreFileInfo>> {
        Ok(Vec::new())
    }

    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        anyhow::bail!("no such store file: {}", name)
    }

    async fn create(&self, name: &str) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        anyhow::bail!("cannot create store file: {}", name)
    }
}

/// The catch-up server of one member.
pub struct CatchupServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl CatchupServer {
    pub async fn spawn<L: LogStore>(
        listen: SocketAddr,
        store_id: StoreId,
        config: Arc<Config>,
        log: Arc<RaftLog<L>>,
        applier: ApplierHandle,
        resources: Arc<dyn StoreResources>,
    ) -> std::io::Result<CatchupServer> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(
            async move {
                loop {
                    let (stream, peer_addr) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(error=%err, "catch-up accept failed");
                            continue;
                        }
                    };
                    let session = ServerSession {
                        store_id,
                        config: config.clone(),
                        log: log.clone(),
                        applier: applier.clone(),
                        resources: resources.clone(),
                    };
                    tokio::spawn(
                        async move {
                            if let Err(err) = session.run(stream).await {
                                tracing::debug!(peer=%peer_addr, error=%err, "catch-up session ended");
                            }
                        }
                        .instrument(tracing::debug_span!("catchup-session", peer=%peer_addr)),
                    );
                }
            }
            .instrument(tracing::debug_span!("catchup-server", addr=%local_addr)),
        );

        Ok(CatchupServer { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for CatchupServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ServerSession<L: LogStore> {
    store_id: StoreId,
    config: Arc<Config>,
    log: Arc<RaftLog<L>>,
    applier: ApplierHandle,
    resources: Arc<dyn StoreResources>,
}

impl<L: LogStore> ServerSession<L> {
    async fn run(self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut switched_over = false;

        while let Some((tag, mut body)) = codec::read_frame(&mut stream).await? {
            if tag == codec::TAG_HELLO {
                let hello = codec::Hello::unmarshal(&mut body)?;
                let chosen = match codec::choose_version(&hello.supported_app_versions) {
                    Some(version) => version,
                    None => return Ok(()),
                };
                let mut response = BytesMut::new();
                codec::Switchover {
                    chosen_app_version: chosen,
                    chosen_modifiers: Vec::new(),
                }
                .marshal(&mut response);
                codec::write_frame(&mut stream, codec::TAG_SWITCHOVER, &response).await?;
                switched_over = true;
                continue;
            }
            if !switched_over {
                return Err(crate::error::ProtocolViolation::BeforeSwitchover.into());
            }

            let request = CatchupRequest::unmarshal(tag, &mut body)?;
            tracing::debug!(?request, "catch-up request");
            match request {
                CatchupRequest::GetStoreId => {
                    self.respond(&mut stream, &CatchupResponse::StoreId(self.store_id)).await?;
                }
                CatchupRequest::PrepareStoreCopy => {
                    let files = match self.resources.listing().await {
                        Ok(files) => files,
                        Err(err) => {
                            tracing::warn!(error=%err, "store listing failed");
                            self.respond(
                                &mut stream,
                                &CatchupResponse::StoreCopyFinished {
                                    status: CatchupStatus::GeneralError,
                                },
                            )
                            .await?;
                            continue;
                        }
                    };
                    self.respond(
                        &mut stream,
                        &CatchupResponse::PrepareStoreCopy {
                            files,
                            last_tx_id: self.applier.last_applied().index,
                        },
                    )
                    .await?;
                }
                CatchupRequest::GetFile { name } => {
                    self.serve_file(&mut stream, &name).await?;
                }
                CatchupRequest::TxPull {
                    previous_tx_id,
                    store_id,
                } => {
                    self.serve_tx_pull(&mut stream, previous_tx_id, store_id).await?;
                }
                CatchupRequest::CoreSnapshot => {
                    let snapshot = self.applier.take_snapshot().await?;
                    self.respond(&mut stream, &CatchupResponse::CoreSnapshot { snapshot }).await?;
                }
            }
        }
        Ok(())
    }

    async fn respond(&self, stream: &mut TcpStream, response: &CatchupResponse) -> Result<()> {
        let mut body = BytesMut::new();
        response.marshal(&mut body);
        codec::write_frame(stream, response.wire_tag(), &body).await?;
        Ok(())
    }

    async fn serve_file(&self, stream: &mut TcpStream, name: &str) -> Result<()> {
        let mut reader = match self.resources.open(name).await {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(name, error=%err, "store file not servable");
                return self
                    .respond(
                        stream,
                        &CatchupResponse::StoreCopyFinished {
                            status: CatchupStatus::GeneralError,
                        },
                    )
                    .await;
            }
        };

        self.respond(
            stream,
            &CatchupResponse::FileHeader {
                name: name.to_string(),
                required_alignment: 1,
            },
        )
        .await?;

        let mut chunk = vec![0u8; self.config.catchup_chunk_size as usize];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.respond(
                stream,
                &CatchupResponse::FileChunk {
                    bytes: bytes::Bytes::copy_from_slice(&chunk[..n]),
                },
            )
            .await?;
        }
        self.respond(
            stream,
            &CatchupResponse::StoreCopyFinished {
                status: CatchupStatus::SuccessEndOfStream,
            },
        )
        .await
    }

    async fn serve_tx_pull(
        &self,
        stream: &mut TcpStream,
        previous_tx_id: u64,
        store_id: StoreId,
    ) -> Result<()> {
        if store_id != self.store_id {
            return self
                .respond(
                    stream,
                    &CatchupResponse::TxStreamFinished {
                        status: CatchupStatus::StoreIdMismatch,
                        last_tx_id: previous_tx_id,
                    },
                )
                .await;
        }
        if previous_tx_id < self.log.prev_index() {
            return self
                .respond(
                    stream,
                    &CatchupResponse::TxStreamFinished {
                        status: CatchupStatus::TransactionPruned,
                        last_tx_id: previous_tx_id,
                    },
                )
                .await;
        }

        // Serve only applied (hence durably committed) entries. The
        // cursor pins the covered segments against pruning.
        let horizon = self.applier.last_applied().index;
        let mut last_tx_id = previous_tx_id;
        let mut cursor = self.log.reader(previous_tx_id + 1).await?;
        while last_tx_id < horizon {
            let entry = match cursor.next_entry().await? {
                Some(entry) => entry,
                None => break,
            };
            if entry.log_id.index > horizon {
                break;
            }
            last_tx_id = entry.log_id.index;
            self.respond(stream, &CatchupResponse::TxPull { entry }).await?;
        }

        self.respond(
            stream,
            &CatchupResponse::TxStreamFinished {
                status: CatchupStatus::SuccessEndOfStream,
                last_tx_id,
            },
        )
        .await
    }
}
