//! Raft RPC message types.
//!
//! All messages are one-way: responses are themselves messages, routed
//! back by member id. The Raft loop never blocks on a network round-trip.

use std::time::Instant;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::LogEntry;
use crate::ClusterId;
use crate::LogId;
use crate::MemberId;
use crate::MessageSummary;

/// Wire tags of the Raft messages.
pub mod tag {
    pub const VOTE_REQUEST: u8 = 0x01;
    pub const VOTE_RESPONSE: u8 = 0x02;
    pub const APPEND_ENTRIES: u8 = 0x03;
    pub const APPEND_RESPONSE: u8 = 0x04;
    pub const HEARTBEAT: u8 = 0x05;
    pub const PRUNE_REQUEST: u8 = 0x06;
}

/// Sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: u64,
    /// The candidate requesting the vote.
    pub candidate_id: MemberId,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "vote-req term={} candidate={} last=({},{})",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteResponse {
    /// The current term of the responding member.
    pub term: u64,
    /// Whether the vote was granted.
    pub granted: bool,
}

impl MessageSummary for VoteResponse {
    fn summary(&self) -> String {
        format!("vote-rsp term={} granted={}", self.term, self.granted)
    }
}

/// Sent by the leader to replicate log entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's id, useful in redirecting clients.
    pub leader_id: MemberId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new entries to store. May be empty when probing a follower's
    /// log position.
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "append term={} leader={} prev={} commit={} n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an [`AppendEntriesRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    /// The responding member's current term, for the leader to update
    /// itself.
    pub term: u64,
    /// True when the follower held the request's `prev_log_id`.
    pub success: bool,
    /// On success, the highest index the follower now matches with the
    /// leader.
    pub match_index: u64,
    /// The follower's current last index, in either case. On rejection the
    /// leader moves `next_index` down to at most this value plus one,
    /// rather than stepping back one entry at a time.
    pub append_index: u64,
}

impl MessageSummary for AppendResponse {
    fn summary(&self) -> String {
        format!(
            "append-rsp term={} success={} match={} append={}",
            self.term, self.success, self.match_index, self.append_index
        )
    }
}

/// A leader liveness and commit-propagation message.
///
/// Heartbeats carry no entries and receive no response; a follower
/// advances its commit index only when its own log holds
/// `(commit_index, commit_index_term)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// The leader's current term.
    pub term: u64,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The term of the entry at the leader's commit index.
    pub commit_index_term: u64,
}

impl MessageSummary for Heartbeat {
    fn summary(&self) -> String {
        format!(
            "heartbeat term={} commit=({},{})",
            self.term, self.commit_index_term, self.leader_commit
        )
    }
}

/// Informs a follower of the leader's prune horizon.
///
/// A follower whose log ends below `up_to_index` can no longer be served
/// by log shipping and must run catch-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneRequest {
    pub up_to_index: u64,
}

impl MessageSummary for PruneRequest {
    fn summary(&self) -> String {
        format!("prune-req up-to={}", self.up_to_index)
    }
}

/// The one-way Raft messages exchanged between members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendResponse(AppendResponse),
    Heartbeat(Heartbeat),
    PruneRequest(PruneRequest),
}

impl RaftMessage {
    pub fn wire_tag(&self) -> u8 {
        match self {
            RaftMessage::VoteRequest(_) => tag::VOTE_REQUEST,
            RaftMessage::VoteResponse(_) => tag::VOTE_RESPONSE,
            RaftMessage::AppendEntries(_) => tag::APPEND_ENTRIES,
            RaftMessage::AppendResponse(_) => tag::APPEND_RESPONSE,
            RaftMessage::Heartbeat(_) => tag::HEARTBEAT,
            RaftMessage::PruneRequest(_) => tag::PRUNE_REQUEST,
        }
    }

    /// The message's term, used for the observed-higher-term rule.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::VoteRequest(m) => Some(m.term),
            RaftMessage::VoteResponse(m) => Some(m.term),
            RaftMessage::AppendEntries(m) => Some(m.term),
            RaftMessage::AppendResponse(m) => Some(m.term),
            RaftMessage::Heartbeat(m) => Some(m.term),
            RaftMessage::PruneRequest(_) => None,
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        match self {
            RaftMessage::VoteRequest(m) => {
                buf.put_u64(m.term);
                marshal::put_member_id(buf, m.candidate_id);
                buf.put_u64(m.last_log_index);
                buf.put_u64(m.last_log_term);
            }
            RaftMessage::VoteResponse(m) => {
                buf.put_u64(m.term);
                marshal::put_bool(buf, m.granted);
            }
            RaftMessage::AppendEntries(m) => {
                buf.put_u64(m.term);
                marshal::put_member_id(buf, m.leader_id);
                buf.put_u64(m.prev_log_id.term);
                buf.put_u64(m.prev_log_id.index);
                buf.put_u64(m.leader_commit);
                buf.put_u32(m.entries.len() as u32);
                for entry in &m.entries {
                    buf.put_u64(entry.log_id.term);
                    buf.put_u64(entry.log_id.index);
                    marshal::put_bytes(buf, &entry.payload.marshal_to_bytes());
                }
            }
            RaftMessage::AppendResponse(m) => {
                buf.put_u64(m.term);
                marshal::put_bool(buf, m.success);
                buf.put_u64(m.match_index);
                buf.put_u64(m.append_index);
            }
            RaftMessage::Heartbeat(m) => {
                buf.put_u64(m.term);
                buf.put_u64(m.leader_commit);
                buf.put_u64(m.commit_index_term);
            }
            RaftMessage::PruneRequest(m) => {
                buf.put_u64(m.up_to_index);
            }
        }
    }

    pub fn unmarshal(wire_tag: u8, buf: &mut impl Buf) -> MarshalResult<Self> {
        use crate::error::ProtocolViolation;
        use crate::operation::EntryPayload;

        let message = match wire_tag {
            tag::VOTE_REQUEST => RaftMessage::VoteRequest(VoteRequest {
                term: marshal::get_u64(buf)?,
                candidate_id: marshal::get_member_id(buf)?,
                last_log_index: marshal::get_u64(buf)?,
                last_log_term: marshal::get_u64(buf)?,
            }),
            tag::VOTE_RESPONSE => RaftMessage::VoteResponse(VoteResponse {
                term: marshal::get_u64(buf)?,
                granted: marshal::get_bool(buf)?,
            }),
            tag::APPEND_ENTRIES => {
                let term = marshal::get_u64(buf)?;
                let leader_id = marshal::get_member_id(buf)?;
                let prev_term = marshal::get_u64(buf)?;
                let prev_index = marshal::get_u64(buf)?;
                let leader_commit = marshal::get_u64(buf)?;
                let n = marshal::get_u32(buf)?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let entry_term = marshal::get_u64(buf)?;
                    let entry_index = marshal::get_u64(buf)?;
                    let content = marshal::get_bytes(buf)?;
                    entries.push(LogEntry {
                        log_id: LogId::new(entry_term, entry_index),
                        payload: EntryPayload::unmarshal_from_bytes(content)?,
                    });
                }
                RaftMessage::AppendEntries(AppendEntriesRequest {
                    term,
                    leader_id,
                    prev_log_id: LogId::new(prev_term, prev_index),
                    entries,
                    leader_commit,
                })
            }
            tag::APPEND_RESPONSE => RaftMessage::AppendResponse(AppendResponse {
                term: marshal::get_u64(buf)?,
                success: marshal::get_bool(buf)?,
                match_index: marshal::get_u64(buf)?,
                append_index: marshal::get_u64(buf)?,
            }),
            tag::HEARTBEAT => RaftMessage::Heartbeat(Heartbeat {
                term: marshal::get_u64(buf)?,
                leader_commit: marshal::get_u64(buf)?,
                commit_index_term: marshal::get_u64(buf)?,
            }),
            tag::PRUNE_REQUEST => RaftMessage::PruneRequest(PruneRequest {
                up_to_index: marshal::get_u64(buf)?,
            }),
            other => return Err(ProtocolViolation::UnknownTag(other)),
        };
        Ok(message)
    }
}

impl MessageSummary for RaftMessage {
    fn summary(&self) -> String {
        match self {
            RaftMessage::VoteRequest(m) => m.summary(),
            RaftMessage::VoteResponse(m) => m.summary(),
            RaftMessage::AppendEntries(m) => m.summary(),
            RaftMessage::AppendResponse(m) => m.summary(),
            RaftMessage::Heartbeat(m) => m.summary(),
            RaftMessage::PruneRequest(m) => m.summary(),
        }
    }
}

/// A decoded message as handed to the Raft loop by the inbound dispatcher.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// The member the message came from.
    pub from: MemberId,
    /// When the dispatcher decoded the message.
    pub received_at: Instant,
    /// The cluster id the sender stamped on the frame.
    pub sender_cluster_id: Option<ClusterId>,
    /// The message itself.
    pub message: RaftMessage,
}

impl Inbound {
    pub fn new(from: MemberId, message: RaftMessage) -> Self {
        Self {
            from,
            received_at: Instant::now(),
            sender_cluster_id: None,
            message,
        }
    }
}

impl MessageSummary for Inbound {
    fn summary(&self) -> String {
        format!("from={} {}", self.from, self.message.summary())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::operation::EntryPayload;

    fn round_trip(message: RaftMessage) {
        let mut buf = BytesMut::new();
        message.marshal(&mut buf);
        let decoded = RaftMessage::unmarshal(message.wire_tag(), &mut buf.freeze()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn vote_messages_round_trip() {
        round_trip(RaftMessage::VoteRequest(VoteRequest {
            term: 3,
            candidate_id: MemberId::from_u128(1),
            last_log_index: 17,
            last_log_term: 2,
        }));
        round_trip(RaftMessage::VoteResponse(VoteResponse {
            term: 3,
            granted: true,
        }));
    }

    #[test]
    fn append_entries_round_trips_with_entries() {
        round_trip(RaftMessage::AppendEntries(AppendEntriesRequest {
            term: 5,
            leader_id: MemberId::from_u128(2),
            prev_log_id: LogId::new(4, 9),
            entries: vec![
                LogEntry {
                    log_id: LogId::new(5, 10),
                    payload: EntryPayload::Blank,
                },
                LogEntry {
                    log_id: LogId::new(5, 11),
                    payload: EntryPayload::Blank,
                },
            ],
            leader_commit: 9,
        }));
    }

    #[test]
    fn heartbeat_and_prune_round_trip() {
        round_trip(RaftMessage::Heartbeat(Heartbeat {
            term: 2,
            leader_commit: 40,
            commit_index_term: 2,
        }));
        round_trip(RaftMessage::PruneRequest(PruneRequest { up_to_index: 512 }));
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        assert!(RaftMessage::unmarshal(0x0f, &mut buf.freeze()).is_err());
    }
}
