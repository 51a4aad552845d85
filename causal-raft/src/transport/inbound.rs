//! The inbound dispatcher.
//!
//! Accepts peer connections, answers the version handshake, decodes
//! frames by tag and hands messages through a small filter pipeline to
//! the Raft loop: cluster-id binding filter first, then the monitor
//! stage, then the enqueue stage. Messages arriving before the local
//! cluster id is bound are dropped with a log line, not an error.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::error::ProtocolViolation;
use crate::handle::RaftHandle;
use crate::message::Inbound;
use crate::monitor::InboundMonitor;
use crate::transport::codec;
use crate::ClusterId;
use crate::MessageSummary;

/// The inbound message server of one member.
pub struct RaftServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RaftServer {
    /// Bind and start accepting peer connections.
    pub async fn spawn<M: InboundMonitor>(
        listen: SocketAddr,
        cluster_binding: watch::Receiver<Option<ClusterId>>,
        raft: RaftHandle,
        monitor: Arc<M>,
    ) -> std::io::Result<RaftServer> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(
            async move {
                loop {
                    let (stream, peer_addr) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(error=%err, "accept failed");
                            continue;
                        }
                    };
                    let conn = Connection {
                        cluster_binding: cluster_binding.clone(),
                        raft: raft.clone(),
                        monitor: monitor.clone(),
                    };
                    tokio::spawn(
                        async move {
                            if let Err(err) = conn.run(stream).await {
                                tracing::debug!(peer=%peer_addr, error=%err, "connection closed");
                            }
                        }
                        .instrument(tracing::debug_span!("inbound-conn", peer=%peer_addr)),
                    );
                }
            }
            .instrument(tracing::debug_span!("raft-server", addr=%local_addr)),
        );

        Ok(RaftServer { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Connection<M: InboundMonitor> {
    cluster_binding: watch::Receiver<Option<ClusterId>>,
    raft: RaftHandle,
    monitor: Arc<M>,
}

impl<M: InboundMonitor> Connection<M> {
    async fn run(self, mut stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let mut switched_over = false;

        while let Some((tag, mut body)) = codec::read_frame(&mut stream).await? {
            match tag {
                codec::TAG_HELLO => {
                    let hello = codec::Hello::unmarshal(&mut body)?;
                    let chosen = match codec::choose_version(&hello.supported_app_versions) {
                        Some(version) => version,
                        None => {
                            tracing::warn!(
                                offered=?hello.supported_app_versions,
                                "no common protocol version, closing"
                            );
                            return Ok(());
                        }
                    };
                    let mut response = bytes::BytesMut::new();
                    codec::Switchover {
                        chosen_app_version: chosen,
                        chosen_modifiers: Vec::new(),
                    }
                    .marshal(&mut response);
                    codec::write_frame(&mut stream, codec::TAG_SWITCHOVER, &response).await?;
                    switched_over = true;
                }
                _ if !switched_over => {
                    // A protocol violation closes the channel.
                    self.monitor.message_dropped(None, "before switchover");
                    return Err(ProtocolViolation::BeforeSwitchover.into());
                }
                _ => {
                    let decoded = codec::decode_raft_body(tag, &mut body)?;
                    let mut inbound = Inbound::new(decoded.from, decoded.message);
                    inbound.sender_cluster_id = Some(decoded.cluster);

                    match self.filter_cluster(inbound) {
                        ControlFlow::Continue(inbound) => {
                            self.monitor.message_enqueued(&inbound.message);
                            if self.raft.inbound(inbound).is_err() {
                                // The core is gone; no point keeping the
                                // connection.
                                return Ok(());
                            }
                        }
                        ControlFlow::Break(()) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// The cluster-id binding filter stage.
    fn filter_cluster(&self, inbound: Inbound) -> ControlFlow<(), Inbound> {
        let local = *self.cluster_binding.borrow();
        match (local, inbound.sender_cluster_id) {
            (None, _) => {
                tracing::info!(
                    from=%inbound.from,
                    msg=%inbound.message.summary(),
                    "dropping message received before cluster binding"
                );
                self.monitor.message_dropped(Some(inbound.from), "unbound");
                ControlFlow::Break(())
            }
            (Some(local), Some(sender)) if local != sender => {
                tracing::warn!(
                    from=%inbound.from,
                    %local,
                    %sender,
                    "dropping message from a different cluster"
                );
                self.monitor.message_dropped(Some(inbound.from), "cluster mismatch");
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(inbound),
        }
    }
}
