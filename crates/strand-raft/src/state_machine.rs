//! The replicated state machine interface.
//!
//! All voters apply the same committed entries in the same order, so an
//! implementation must be deterministic. The node calls `apply`, `snapshot`,
//! and `restore` from its single driver task; implementations must treat
//! them as serialized and must not call back into consensus from inside
//! them.

use bytes::Bytes;

use crate::log::SnapshotMeta;
use crate::rpc::LogEntry;
use crate::{LogIndex, Result};

/// Outcome of applying one committed entry.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Result bytes handed back to the local proposer.
    pub data: Bytes,
}

impl ApplyResult {
    /// A result carrying data.
    pub fn with_data(data: Bytes) -> Self {
        Self { data }
    }

    /// An empty result.
    pub fn ok() -> Self {
        Self { data: Bytes::new() }
    }
}

/// A captured snapshot: the boundary plus serialized state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The last entry the snapshot covers.
    pub meta: SnapshotMeta,
    /// Serialized state machine contents.
    pub data: Bytes,
}

/// The deterministic machine Raft applies committed entries to.
pub trait StateMachine: Send {
    /// Applies one committed entry.
    ///
    /// Called for every entry in index order, exactly once per entry.
    /// `Noop` and `Config` entries must be treated as state no-ops that
    /// still advance the applied position. Errors propagate to Raft;
    /// never swallow them.
    fn apply(&mut self, entry: &LogEntry) -> Result<ApplyResult>;

    /// Serializes the current state.
    ///
    /// The capture must be consistent with the last applied entry and safe
    /// to stream while new commands keep arriving afterwards.
    fn snapshot(&self) -> Result<Bytes>;

    /// Replaces all state with a snapshot received from the leader.
    fn restore(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// The index of the last entry this machine has applied.
    fn last_applied(&self) -> LogIndex;

    /// Hook invoked when the local node wins an election.
    fn on_become_leader(&mut self) {}

    /// Hook invoked when the local node loses leadership.
    fn on_become_follower(&mut self) {}
}

/// A state machine that does nothing, for consensus tests.
#[derive(Debug, Default)]
pub struct NoOpStateMachine {
    last_applied: LogIndex,
    data: Bytes,
}

impl NoOpStateMachine {
    /// Creates an empty no-op machine.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for NoOpStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> Result<ApplyResult> {
        self.last_applied = entry.index;
        Ok(ApplyResult::ok())
    }

    fn snapshot(&self) -> Result<Bytes> {
        Ok(self.data.clone())
    }

    fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.last_applied = snapshot.meta.last_included_index;
        self.data = snapshot.data.clone();
        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}
