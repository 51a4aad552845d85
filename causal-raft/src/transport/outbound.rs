//! Outbound per-peer channels.
//!
//! One lazily created, reconnecting channel per peer address. Sends
//! resolve when the message is accepted by the channel's bounded queue,
//! giving callers back-pressure; the channel task owns the socket,
//! performs the version handshake and reconnects with capped exponential
//! backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing_futures::Instrument;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::message::RaftMessage;
use crate::transport::codec;
use crate::ClusterId;
use crate::MemberId;
use crate::MessageSummary;
use crate::Outbound;

/// Maps member ids to their transport addresses.
#[derive(Debug, Default)]
pub struct AddressBook {
    inner: RwLock<HashMap<MemberId, SocketAddr>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, member: MemberId, addr: SocketAddr) {
        self.inner.write().unwrap().insert(member, addr);
    }

    pub fn get(&self, member: MemberId) -> Option<SocketAddr> {
        self.inner.read().unwrap().get(&member).copied()
    }

    pub fn remove(&self, member: MemberId) {
        self.inner.write().unwrap().remove(&member);
    }
}

struct PeerChannel {
    tx: mpsc::Sender<RaftMessage>,
}

/// The production [`Outbound`] implementation over TCP.
pub struct OutboundChannels {
    me: MemberId,
    cluster: ClusterId,
    config: Arc<Config>,
    addresses: Arc<AddressBook>,
    channels: Mutex<HashMap<MemberId, PeerChannel>>,
}

impl OutboundChannels {
    pub fn new(
        me: MemberId,
        cluster: ClusterId,
        config: Arc<Config>,
        addresses: Arc<AddressBook>,
    ) -> Self {
        Self {
            me,
            cluster,
            config,
            addresses,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Tear down the channel towards one peer; the next send recreates
    /// it.
    pub fn dispose(&self, target: MemberId) {
        self.channels.lock().unwrap().remove(&target);
    }

    fn channel_for(&self, target: MemberId) -> Result<mpsc::Sender<RaftMessage>> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(&target) {
            if !channel.tx.is_closed() {
                return Ok(channel.tx.clone());
            }
            channels.remove(&target);
        }

        let addr = self
            .addresses
            .get(target)
            .ok_or_else(|| anyhow!("no address known for member {}", target))?;
        let (tx, rx) = mpsc::channel(256);
        let task = PeerChannelTask {
            me: self.me,
            cluster: self.cluster,
            target,
            addr,
            rx,
            backoff: Backoff::new(
                Duration::from_millis(self.config.reconnect_backoff_base),
                Duration::from_millis(self.config.reconnect_backoff_upper),
            ),
        };
        tokio::spawn(task.run().instrument(tracing::debug_span!("peer-channel")));
        channels.insert(target, PeerChannel { tx: tx.clone() });
        Ok(tx)
    }
}

#[async_trait]
impl Outbound for OutboundChannels {
    async fn send(&self, target: MemberId, message: RaftMessage) -> Result<()> {
        let tx = self.channel_for(target)?;
        tx.send(message)
            .await
            .map_err(|_| anyhow!("channel to member {} is closed", target))
    }
}

struct PeerChannelTask {
    me: MemberId,
    cluster: ClusterId,
    target: MemberId,
    addr: SocketAddr,
    rx: mpsc::Receiver<RaftMessage>,
    backoff: Backoff,
}

impl PeerChannelTask {
    async fn run(mut self) {
        loop {
            let mut stream = match self.connect().await {
                Some(stream) => stream,
                None => return, // channel dropped while reconnecting
            };
            self.backoff.reset();
            tracing::debug!(target=%self.target, addr=%self.addr, "peer channel established");

            loop {
                let message = match self.rx.recv().await {
                    Some(message) => message,
                    None => return, // disposed
                };
                let body = codec::encode_raft_body(self.cluster, self.me, &message);
                if let Err(err) =
                    codec::write_frame(&mut stream, message.wire_tag(), &body).await
                {
                    tracing::debug!(
                        target=%self.target, error=%err, msg=%message.summary(),
                        "write failed, reconnecting"
                    );
                    // The message is dropped; raft retransmission covers it.
                    break;
                }
            }
        }
    }

    /// Connect and handshake, backing off between attempts. Returns
    /// `None` once the owning channel is dropped.
    async fn connect(&mut self) -> Option<TcpStream> {
        loop {
            if self.rx.is_closed() && self.rx.is_empty() {
                return None;
            }
            match self.try_connect().await {
                Ok(stream) => return Some(stream),
                Err(err) => {
                    let delay = self.backoff.increment();
                    tracing::debug!(
                        target=%self.target, addr=%self.addr, error=%err, ?delay,
                        "connect failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;

        // Two-step version negotiation; nothing else may be sent before
        // the switchover lands.
        let mut hello = bytes::BytesMut::new();
        codec::Hello::current().marshal(&mut hello);
        codec::write_frame(&mut stream, codec::TAG_HELLO, &hello).await?;

        match codec::read_frame(&mut stream).await? {
            Some((codec::TAG_SWITCHOVER, mut body)) => {
                let switchover = codec::Switchover::unmarshal(&mut body)?;
                if !codec::SUPPORTED_APP_VERSIONS.contains(&switchover.chosen_app_version) {
                    return Err(anyhow!(
                        "peer switched to unsupported version {}",
                        switchover.chosen_app_version
                    ));
                }
                Ok(stream)
            }
            Some((tag, _)) => Err(anyhow!("unexpected frame 0x{:02x} during handshake", tag)),
            None => Err(anyhow!("connection closed during handshake")),
        }
    }
}
