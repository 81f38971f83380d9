//! Raft RPC message types.
//!
//! `RequestVote` drives leader election, `AppendEntries` carries both log
//! replication and heartbeats, and `InstallSnapshot` catches up followers
//! whose next entry has been compacted away. Messages are serialized with
//! bincode inside the transport's frames.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::LogIndex;

/// A Raft term: a monotonically increasing election epoch.
pub type Term = u64;

/// A Raft node identifier.
pub type NodeId = u64;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// A client command for the state machine.
    Command,
    /// Leader-establishment marker appended on election.
    Noop,
    /// A cluster membership change.
    Config,
}

/// One entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that created the entry.
    pub term: Term,
    /// Position in the log.
    pub index: LogIndex,
    /// What the entry carries.
    pub entry_type: EntryType,
    /// Payload; empty for no-ops.
    pub data: Bytes,
}

impl LogEntry {
    /// A client command entry.
    pub fn command(term: Term, index: LogIndex, data: Bytes) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Command,
            data,
        }
    }

    /// A leader-establishment no-op.
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Noop,
            data: Bytes::new(),
        }
    }

    /// A membership change entry.
    pub fn config(term: Term, index: LogIndex, data: Bytes) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Config,
            data,
        }
    }
}

/// Vote solicitation sent by candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    /// Candidate's term.
    pub term: Term,
    /// The candidate asking for the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last entry.
    pub last_log_term: Term,
}

/// Reply to [`RequestVote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's current term.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

impl VoteResponse {
    /// A granted vote.
    pub fn grant(term: Term) -> Self {
        Self {
            term,
            vote_granted: true,
        }
    }

    /// A denied vote.
    pub fn deny(term: Term) -> Self {
        Self {
            term,
            vote_granted: false,
        }
    }
}

/// Replication carrier; empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Leader's term.
    pub term: Term,
    /// The leader, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntries {
    /// True when this message carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reply to [`AppendEntries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Responder's current term.
    pub term: Term,
    /// Whether the follower's log matched at `prev_log_index`.
    pub success: bool,
    /// The follower's last log index after the call.
    pub match_index: LogIndex,
    /// Fast-rollback hint: first index of the conflicting term.
    pub conflict_index: Option<LogIndex>,
}

impl AppendResponse {
    /// A successful response.
    pub fn success(term: Term, match_index: LogIndex) -> Self {
        Self {
            term,
            success: true,
            match_index,
            conflict_index: None,
        }
    }

    /// A rejection without a rollback hint.
    pub fn failure(term: Term, match_index: LogIndex) -> Self {
        Self {
            term,
            success: false,
            match_index,
            conflict_index: None,
        }
    }

    /// A rejection carrying a fast-rollback hint.
    pub fn failure_with_hint(term: Term, match_index: LogIndex, conflict_index: LogIndex) -> Self {
        Self {
            term,
            success: false,
            match_index,
            conflict_index: Some(conflict_index),
        }
    }
}

/// Snapshot chunk pushed to a lagging follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up to and including this index.
    pub last_included_index: LogIndex,
    /// Term of `last_included_index`.
    pub last_included_term: Term,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// Chunk bytes.
    pub data: Bytes,
    /// True on the final chunk.
    pub done: bool,
}

/// Reply to [`InstallSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Responder's current term.
    pub term: Term,
}

/// Any Raft message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RaftMessage {
    RequestVote(RequestVote),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntries),
    AppendResponse(AppendResponse),
    InstallSnapshot(InstallSnapshot),
    SnapshotResponse(SnapshotResponse),
}

impl RaftMessage {
    /// The term the message carries.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendResponse(m) => m.term,
            RaftMessage::InstallSnapshot(m) => m.term,
            RaftMessage::SnapshotResponse(m) => m.term,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "RequestVote",
            RaftMessage::VoteResponse(_) => "VoteResponse",
            RaftMessage::AppendEntries(_) => "AppendEntries",
            RaftMessage::AppendResponse(_) => "AppendResponse",
            RaftMessage::InstallSnapshot(_) => "InstallSnapshot",
            RaftMessage::SnapshotResponse(_) => "SnapshotResponse",
        }
    }
}

impl fmt::Display for RaftMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(term={})", self.kind(), self.term())
    }
}

/// A message addressed to a peer, produced by the node for the driver to
/// hand to the transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// The target node.
    pub to: NodeId,
    /// The message.
    pub message: RaftMessage,
}

impl OutboundMessage {
    /// Addresses `message` to `to`.
    pub fn new(to: NodeId, message: RaftMessage) -> Self {
        Self { to, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_term() {
        let msg = RaftMessage::VoteResponse(VoteResponse::grant(7));
        assert_eq!(msg.term(), 7);
        assert_eq!(msg.kind(), "VoteResponse");
    }

    #[test]
    fn test_heartbeat_detection() {
        let hb = AppendEntries {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        assert!(hb.is_heartbeat());
    }

    #[test]
    fn test_bincode_roundtrip() {
        let msg = RaftMessage::AppendEntries(AppendEntries {
            term: 3,
            leader_id: 1,
            prev_log_index: 9,
            prev_log_term: 2,
            entries: vec![LogEntry::command(3, 10, Bytes::from_static(b"payload"))],
            leader_commit: 9,
        });

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: RaftMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
