//! Log replication.
//!
//! The leader tracks a `next_index`/`match_index` pair per follower, ships
//! entries with `AppendEntries`, and advances the commit index once a
//! majority has replicated an entry from the current term. Rejections roll
//! `next_index` back, using the follower's conflict hint when present; a
//! follower whose next entry has been compacted away is flagged for a
//! snapshot instead.

use std::collections::HashMap;

use crate::log::LogStore;
use crate::rpc::{AppendEntries, AppendResponse, LogEntry, NodeId, Term};
use crate::LogIndex;

/// Per-follower replication progress.
#[derive(Debug, Clone)]
pub struct FollowerProgress {
    /// Next log index to send.
    pub next_index: LogIndex,
    /// Highest index known replicated on the follower.
    pub match_index: LogIndex,
    /// Whether an RPC to this follower is outstanding.
    pub in_flight: bool,
    /// Whether the follower needs a snapshot instead of entries.
    pub needs_snapshot: bool,
}

impl FollowerProgress {
    fn new(last_log_index: LogIndex) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
            in_flight: false,
            needs_snapshot: false,
        }
    }

    fn on_success(&mut self, match_index: LogIndex) {
        self.match_index = match_index;
        self.next_index = match_index + 1;
        self.in_flight = false;
    }

    fn on_failure(&mut self, conflict_index: Option<LogIndex>, log: &dyn LogStore) {
        self.in_flight = false;

        self.next_index = match conflict_index {
            Some(hint) => hint,
            None => self.next_index.saturating_sub(1).max(1),
        };

        if self.next_index < log.first_index() {
            self.next_index = log.first_index();
            self.needs_snapshot = true;
        }
    }
}

/// Leader-side replication state.
#[derive(Debug)]
pub struct ReplicationState {
    progress: HashMap<NodeId, FollowerProgress>,
    commit_index: LogIndex,
    cluster_size: usize,
}

impl ReplicationState {
    /// Initializes progress for each peer, optimistically assuming they are
    /// caught up.
    pub fn new(peers: &[NodeId], last_log_index: LogIndex, commit_index: LogIndex) -> Self {
        let progress = peers
            .iter()
            .map(|&peer| (peer, FollowerProgress::new(last_log_index)))
            .collect();

        Self {
            progress,
            commit_index,
            cluster_size: peers.len() + 1,
        }
    }

    /// The current commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Progress for one follower.
    pub fn progress(&self, peer: NodeId) -> Option<&FollowerProgress> {
        self.progress.get(&peer)
    }

    /// Mutable progress for one follower.
    pub fn progress_mut(&mut self, peer: NodeId) -> Option<&mut FollowerProgress> {
        self.progress.get_mut(&peer)
    }

    fn quorum_size(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Builds the next `AppendEntries` for `follower`, or `None` when an
    /// RPC is outstanding or a snapshot is pending.
    pub fn prepare_append_entries(
        &mut self,
        follower: NodeId,
        term: Term,
        leader_id: NodeId,
        log: &dyn LogStore,
    ) -> Option<AppendEntries> {
        const MAX_ENTRIES_PER_RPC: usize = 64;

        let progress = self.progress.get_mut(&follower)?;
        if progress.in_flight || progress.needs_snapshot {
            return None;
        }

        match log.entries_for_follower(progress.next_index, MAX_ENTRIES_PER_RPC) {
            Ok((prev_log_index, prev_log_term, entries)) => {
                progress.in_flight = true;
                Some(AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: self.commit_index,
                })
            }
            Err(_) => {
                // The follower's next entry was compacted away.
                progress.needs_snapshot = true;
                None
            }
        }
    }

    /// Processes a follower's response; true when the commit index
    /// advanced.
    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        response: &AppendResponse,
        current_term: Term,
        leader_last_index: LogIndex,
        log: &dyn LogStore,
    ) -> bool {
        let Some(progress) = self.progress.get_mut(&from) else {
            return false;
        };

        if response.success {
            progress.on_success(response.match_index);
            self.maybe_advance_commit(leader_last_index, current_term, log)
        } else {
            progress.on_failure(response.conflict_index, log);
            false
        }
    }

    /// Advances the commit index to the highest entry replicated on a
    /// majority, restricted to entries from the current term.
    fn maybe_advance_commit(
        &mut self,
        leader_last_index: LogIndex,
        current_term: Term,
        log: &dyn LogStore,
    ) -> bool {
        let mut match_indices: Vec<LogIndex> =
            self.progress.values().map(|p| p.match_index).collect();
        match_indices.push(leader_last_index);
        match_indices.sort_unstable();
        match_indices.reverse();

        let quorum_idx = self.quorum_size() - 1;
        let Some(&candidate) = match_indices.get(quorum_idx) else {
            return false;
        };

        if candidate > self.commit_index && log.term_at(candidate) == Some(current_term) {
            self.commit_index = candidate;
            return true;
        }

        false
    }

    /// Re-evaluates the commit index after the leader appends locally.
    ///
    /// Matters when the leader alone forms a quorum (single-node cluster);
    /// returns true when the commit index advanced.
    pub fn note_leader_append(
        &mut self,
        leader_last_index: LogIndex,
        current_term: Term,
        log: &dyn LogStore,
    ) -> bool {
        self.maybe_advance_commit(leader_last_index, current_term, log)
    }

    /// Followers flagged as needing a snapshot and not mid-transfer.
    pub fn followers_needing_snapshots(&self) -> Vec<NodeId> {
        self.progress
            .iter()
            .filter(|(_, p)| p.needs_snapshot && !p.in_flight)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Marks a snapshot transfer finished for `follower`.
    pub fn snapshot_complete(&mut self, follower: NodeId, last_included_index: LogIndex) {
        if let Some(progress) = self.progress.get_mut(&follower) {
            progress.needs_snapshot = false;
            progress.in_flight = false;
            progress.match_index = last_included_index;
            progress.next_index = last_included_index + 1;
        }
    }

    /// Starts tracking a new follower.
    pub fn add_peer(&mut self, peer: NodeId, last_log_index: LogIndex) {
        self.progress
            .insert(peer, FollowerProgress::new(last_log_index));
        self.cluster_size += 1;
    }

    /// Stops tracking a follower.
    pub fn remove_peer(&mut self, peer: NodeId) {
        self.progress.remove(&peer);
        self.cluster_size = self.cluster_size.saturating_sub(1);
    }
}

/// Follower side of `AppendEntries`.
pub fn handle_append_entries(
    request: &AppendEntries,
    log: &dyn LogStore,
    current_term: Term,
) -> AppendResponse {
    if request.term < current_term {
        return AppendResponse::failure(current_term, log.last_index());
    }

    if !log.match_term(request.prev_log_index, request.prev_log_term) {
        // Hint the first index of our conflicting term for fast rollback.
        if let Some(our_term) = log.term_at(request.prev_log_index) {
            if let Some(first_of_term) = log.find_first_index_of_term(our_term) {
                return AppendResponse::failure_with_hint(
                    current_term,
                    log.last_index(),
                    first_of_term,
                );
            }
        }
        return AppendResponse::failure(current_term, log.last_index());
    }

    if log.append_entries(request.entries.clone()).is_err() {
        return AppendResponse::failure(current_term, log.last_index());
    }

    AppendResponse::success(current_term, log.last_index())
}

/// Entries committed but not yet applied, in order.
pub fn entries_to_apply(
    log: &dyn LogStore,
    commit_index: LogIndex,
    last_applied: LogIndex,
) -> Vec<LogEntry> {
    if commit_index <= last_applied {
        return Vec::new();
    }
    log.entries(last_applied + 1, commit_index + 1)
        .unwrap_or_default()
}
