//! # strand-raft
//!
//! A compact Raft implementation driving the replicated log service.
//!
//! The core is sans-IO: [`node::RaftNode`] consumes ticks and incoming
//! messages and emits outbound messages, leaving scheduling and networking
//! to the caller. A single driver task is expected to own the node, tick it
//! at a fixed interval, feed it messages from a [`transport::Transport`],
//! and apply committed entries.
//!
//! Log storage is pluggable through [`log::LogStore`]; the service backs it
//! with a segmented on-disk log, while tests use the in-memory
//! [`log::MemLog`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod election;
pub mod log;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod state_machine;
pub mod transport;

use thiserror::Error;

use rpc::NodeId;

/// Position of an entry in the Raft log. Indexing starts at 1; 0 means
/// "before the first entry".
pub type LogIndex = u64;

/// Errors produced by the consensus layer.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A proposal reached a node that is not the leader.
    #[error("not the leader")]
    NotLeader {
        /// The leader this node believes in, if any.
        leader_hint: Option<NodeId>,
    },

    /// The requested range has been compacted into a snapshot.
    #[error("log compacted; first available index is {first_index}")]
    LogCompacted {
        /// First index still present in the log.
        first_index: LogIndex,
    },

    /// The backing log store failed.
    #[error("log storage error: {0}")]
    Storage(String),

    /// A proposal or apply found the node shut down.
    #[error("raft node closed")]
    Closed,

    /// An invariant was violated; indicates a bug or corruption.
    #[error("internal raft error: {0}")]
    Internal(String),
}

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, RaftError>;
