//! Typed observer seams, injected into components instead of any global
//! monitor registry.

use crate::message::RaftMessage;
use crate::MemberId;

/// Observes inbound dispatcher decisions.
pub trait InboundMonitor: Send + Sync + 'static {
    /// A message was dropped before reaching the Raft loop.
    fn message_dropped(&self, from: Option<MemberId>, reason: &str) {
        let _ = (from, reason);
    }

    /// A message was accepted and enqueued.
    fn message_enqueued(&self, message: &RaftMessage) {
        let _ = message;
    }
}

/// Observes catch-up runs.
pub trait CatchupMonitor: Send + Sync + 'static {
    fn catchup_started(&self, from: MemberId) {
        let _ = from;
    }

    fn catchup_finished(&self, from: MemberId, last_index: u64) {
        let _ = (from, last_index);
    }

    fn catchup_failed(&self, from: MemberId, reason: &str) {
        let _ = (from, reason);
    }
}

/// The default do-nothing observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl InboundMonitor for NoopMonitor {}
impl CatchupMonitor for NoopMonitor {}
