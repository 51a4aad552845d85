//! The outbound message seam.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::RaftMessage;
use crate::MemberId;

/// Sends one-way Raft messages towards cluster peers.
///
/// `send` resolves once the message is accepted by the peer's channel
/// (providing back-pressure), not when a response arrives; responses are
/// delivered separately through the inbound dispatcher. Implementations
/// drop messages for unreachable peers after surfacing an error; the core
/// treats send failures as transient and never retries a message itself,
/// retransmission rides on the replication and election protocols.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    async fn send(&self, target: MemberId, message: RaftMessage) -> Result<()>;
}
