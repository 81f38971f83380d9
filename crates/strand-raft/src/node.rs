//! The Raft node.
//!
//! [`RaftNode`] is sans-IO: a single driver task ticks it at a fixed
//! interval, feeds it incoming messages, hands its outbound messages to the
//! transport, and applies committed entries. The expected loop:
//!
//! ```ignore
//! loop {
//!     for out in node.tick() { transport.send(out.to, out.message); }
//!     while let Some(incoming) = transport.try_recv() {
//!         for out in node.handle_message(incoming.from, incoming.message)? {
//!             transport.send(out.to, out.message);
//!         }
//!     }
//!     for (entry, result) in node.apply_committed()? { /* resolve waiters */ }
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::election::{ElectionState, ElectionTiming};
use crate::log::{LogStore, SnapshotMeta};
use crate::replication::{self, ReplicationState};
use crate::rpc::{
    AppendEntries, AppendResponse, EntryType, InstallSnapshot, LogEntry, NodeId, OutboundMessage,
    RaftMessage, RequestVote, SnapshotResponse, Term, VoteResponse,
};
use crate::state_machine::{ApplyResult, Snapshot, StateMachine};
use crate::{LogIndex, RaftError, Result};

/// Configuration for one Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Peer ids, excluding self.
    pub peers: Vec<NodeId>,
    /// Tick bounds for elections and heartbeats.
    pub timing: ElectionTiming,
}

impl RaftConfig {
    /// A config for `node_id` with no peers.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: Vec::new(),
            timing: ElectionTiming::default(),
        }
    }

    /// Sets the peer set.
    pub fn with_peers(mut self, peers: Vec<NodeId>) -> Self {
        self.peers = peers;
        self
    }

    /// Sets election/heartbeat timing.
    pub fn with_timing(mut self, timing: ElectionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Voter count including self.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

/// The role a node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Following a leader.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Leading the cluster.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot chunks stay below this size.
const SNAPSHOT_CHUNK: usize = 512 * 1024;

/// The Raft node: election, replication, and apply in one state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    role: Role,
    election: ElectionState,
    /// Present only while leading.
    replication: Option<ReplicationState>,
    log: Arc<dyn LogStore>,
    state_machine: S,
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// Chunks of a snapshot being received.
    incoming_snapshot: Option<Vec<u8>>,
    /// Snapshot boundary in flight to each follower.
    outgoing_snapshots: std::collections::HashMap<NodeId, LogIndex>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Creates a node over the given log store and state machine.
    ///
    /// The commit index starts at the machine's `last_applied`, so recovery
    /// never re-applies entries the machine already holds.
    pub fn new(config: RaftConfig, log: Arc<dyn LogStore>, state_machine: S) -> Self {
        let election = ElectionState::new(config.cluster_size(), config.timing);
        let last_applied = state_machine.last_applied();

        Self {
            config,
            role: Role::Follower,
            election,
            replication: None,
            log,
            state_machine,
            commit_index: last_applied,
            last_applied,
            incoming_snapshot: None,
            outgoing_snapshots: std::collections::HashMap::new(),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True when leading.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Current term.
    pub fn current_term(&self) -> Term {
        self.election.current_term()
    }

    /// The leader this node believes in, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.election.leader_id()
    }

    /// Current commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Index of the last applied entry.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// The backing log store.
    pub fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    /// The state machine.
    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Current peer set.
    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    /// Term and vote to persist; save whenever this changes.
    pub fn persistent_state(&self) -> (Term, Option<NodeId>) {
        (self.election.current_term(), self.election.voted_for())
    }

    /// Reinstates persisted term and vote during recovery.
    pub fn restore_state(&mut self, term: Term, voted_for: Option<NodeId>) {
        self.election.restore(term, voted_for);
    }

    /// Advances time one tick; returns messages to send.
    pub fn tick(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();

        match self.role {
            Role::Follower | Role::Candidate => {
                if self.election.tick() {
                    self.start_election(&mut messages);
                }
            }
            Role::Leader => {
                if self.election.should_send_heartbeat() {
                    self.send_heartbeats(&mut messages);
                    self.maybe_send_snapshots(&mut messages);
                    self.election.reset_heartbeat_timer();
                }
                self.election.tick();
            }
        }

        messages
    }

    fn start_election(&mut self, messages: &mut Vec<OutboundMessage>) {
        self.role = Role::Candidate;
        let request = self.election.start_election(self.config.node_id, self.log.as_ref());
        debug!(term = request.term, "election timeout, campaigning");

        for &peer in &self.config.peers {
            messages.push(OutboundMessage::new(
                peer,
                RaftMessage::RequestVote(request.clone()),
            ));
        }

        // A single-node cluster wins instantly.
        if self.election.has_majority() {
            self.become_leader(messages);
        }
    }

    fn become_leader(&mut self, messages: &mut Vec<OutboundMessage>) {
        info!(
            term = self.election.current_term(),
            node = self.config.node_id,
            "won election"
        );

        self.role = Role::Leader;
        self.election.become_leader(self.config.node_id);

        let last_index = self.log.last_index();
        self.replication = Some(ReplicationState::new(
            &self.config.peers,
            last_index,
            self.commit_index,
        ));

        self.state_machine.on_become_leader();

        // Establish leadership with a no-op so the new term has a
        // committable entry.
        let noop = LogEntry::noop(self.election.current_term(), last_index + 1);
        if let Err(e) = self.log.append(noop) {
            warn!("failed to append leadership no-op: {e}");
        }
        self.advance_commit_from_self();

        self.send_heartbeats(messages);
    }

    fn become_follower(&mut self) {
        if self.role != Role::Follower {
            debug!(node = self.config.node_id, "stepping down to follower");
            self.role = Role::Follower;
            self.replication = None;
            self.outgoing_snapshots.clear();
            self.state_machine.on_become_follower();
        }
    }

    /// Steps down voluntarily (used during shutdown).
    pub fn step_down(&mut self) {
        self.become_follower();
    }

    /// Pushes pending entries to followers now instead of waiting for the
    /// next heartbeat round. No-op on non-leaders; in-flight tracking
    /// prevents duplicate sends.
    pub fn replicate_now(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        if self.role == Role::Leader {
            self.send_heartbeats(&mut messages);
        }
        messages
    }

    fn send_heartbeats(&mut self, messages: &mut Vec<OutboundMessage>) {
        let Some(replication) = &mut self.replication else {
            return;
        };

        for &peer in &self.config.peers {
            if let Some(ae) = replication.prepare_append_entries(
                peer,
                self.election.current_term(),
                self.config.node_id,
                self.log.as_ref(),
            ) {
                messages.push(OutboundMessage::new(peer, RaftMessage::AppendEntries(ae)));
            }
        }
    }

    fn maybe_send_snapshots(&mut self, messages: &mut Vec<OutboundMessage>) {
        let Some(replication) = &mut self.replication else {
            return;
        };

        let followers = replication.followers_needing_snapshots();
        if followers.is_empty() {
            return;
        }

        let last_included_index = self.last_applied;
        let Some(last_included_term) = self.log.term_at(last_included_index) else {
            return;
        };
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                warn!("snapshot capture failed: {e}");
                return;
            }
        };

        for peer in followers {
            if let Some(progress) = replication.progress_mut(peer) {
                progress.in_flight = true;
            }
            self.outgoing_snapshots.insert(peer, last_included_index);

            info!(
                peer,
                last_included_index,
                size = data.len(),
                "sending snapshot to lagging follower"
            );

            // Snapshots here are small enough to go in one message; the
            // chunk fields stay wire-compatible with a chunked sender.
            let mut offset = 0usize;
            loop {
                let end = (offset + SNAPSHOT_CHUNK).min(data.len());
                let done = end == data.len();
                messages.push(OutboundMessage::new(
                    peer,
                    RaftMessage::InstallSnapshot(InstallSnapshot {
                        term: self.election.current_term(),
                        leader_id: self.config.node_id,
                        last_included_index,
                        last_included_term,
                        offset: offset as u64,
                        data: data.slice(offset..end),
                        done,
                    }),
                ));
                if done {
                    break;
                }
                offset = end;
            }
        }
    }

    /// Handles one incoming message; returns the responses to send.
    pub fn handle_message(
        &mut self,
        from: NodeId,
        message: RaftMessage,
    ) -> Result<Vec<OutboundMessage>> {
        let mut messages = Vec::new();

        // A node outside the configuration (typically one that was removed
        // and has not noticed) must not depose a working leader with its
        // inflated term: deny its vote requests without adopting the term.
        if let RaftMessage::RequestVote(_) = &message {
            if !self.config.peers.contains(&from) {
                debug!(from, "ignoring vote request from non-member");
                messages.push(OutboundMessage::new(
                    from,
                    RaftMessage::VoteResponse(VoteResponse::deny(self.election.current_term())),
                ));
                return Ok(messages);
            }
        }

        if message.term() > self.election.current_term() {
            self.election.maybe_update_term(message.term());
            self.become_follower();
        }

        match message {
            RaftMessage::RequestVote(rv) => self.handle_request_vote(from, rv, &mut messages),
            RaftMessage::VoteResponse(vr) => self.handle_vote_response(from, vr, &mut messages),
            RaftMessage::AppendEntries(ae) => self.handle_append_entries(from, ae, &mut messages),
            RaftMessage::AppendResponse(ar) => self.handle_append_response(from, ar),
            RaftMessage::InstallSnapshot(is) => {
                self.handle_install_snapshot(from, is, &mut messages)?
            }
            RaftMessage::SnapshotResponse(sr) => self.handle_snapshot_response(from, sr),
        }

        Ok(messages)
    }

    fn handle_request_vote(
        &mut self,
        from: NodeId,
        request: RequestVote,
        messages: &mut Vec<OutboundMessage>,
    ) {
        let (response, term_updated) = self
            .election
            .handle_request_vote(&request, self.log.as_ref());
        if term_updated {
            self.become_follower();
        }

        messages.push(OutboundMessage::new(
            from,
            RaftMessage::VoteResponse(response),
        ));
    }

    fn handle_vote_response(
        &mut self,
        from: NodeId,
        response: VoteResponse,
        messages: &mut Vec<OutboundMessage>,
    ) {
        if self.role != Role::Candidate || response.term != self.election.current_term() {
            return;
        }

        if self.election.record_vote(from, response.vote_granted) {
            self.become_leader(messages);
        }
    }

    fn handle_append_entries(
        &mut self,
        from: NodeId,
        request: AppendEntries,
        messages: &mut Vec<OutboundMessage>,
    ) {
        if request.term >= self.election.current_term() {
            self.become_follower();
            self.election.set_leader(from);
            self.election.reset_election_timer();
        }

        let response = replication::handle_append_entries(
            &request,
            self.log.as_ref(),
            self.election.current_term(),
        );

        if response.success && request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.log.last_index());
        }

        messages.push(OutboundMessage::new(
            from,
            RaftMessage::AppendResponse(response),
        ));
    }

    fn handle_append_response(&mut self, from: NodeId, response: AppendResponse) {
        if self.role != Role::Leader || response.term != self.election.current_term() {
            return;
        }

        if let Some(replication) = &mut self.replication {
            let advanced = replication.handle_append_response(
                from,
                &response,
                self.election.current_term(),
                self.log.last_index(),
                self.log.as_ref(),
            );
            if advanced {
                self.commit_index = replication.commit_index();
            }
        }
    }

    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        request: InstallSnapshot,
        messages: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        if request.term < self.election.current_term() {
            messages.push(OutboundMessage::new(
                from,
                RaftMessage::SnapshotResponse(SnapshotResponse {
                    term: self.election.current_term(),
                }),
            ));
            return Ok(());
        }

        self.become_follower();
        self.election.set_leader(from);
        self.election.reset_election_timer();

        if request.offset == 0 {
            self.incoming_snapshot = Some(Vec::new());
        }

        if let Some(buf) = &mut self.incoming_snapshot {
            buf.extend_from_slice(&request.data);

            if request.done {
                let meta = SnapshotMeta {
                    last_included_index: request.last_included_index,
                    last_included_term: request.last_included_term,
                };
                let data = Bytes::from(std::mem::take(buf));
                self.incoming_snapshot = None;

                info!(
                    last_included_index = meta.last_included_index,
                    size = data.len(),
                    "installing snapshot from leader"
                );

                let snapshot = Snapshot {
                    meta: meta.clone(),
                    data,
                };
                // A corrupt snapshot is fatal for the node; the error
                // propagates to the driver which aborts.
                self.state_machine.restore(&snapshot)?;
                self.log.reset_to_snapshot(meta)?;

                self.last_applied = request.last_included_index;
                self.commit_index = request.last_included_index;
            }
        }

        messages.push(OutboundMessage::new(
            from,
            RaftMessage::SnapshotResponse(SnapshotResponse {
                term: self.election.current_term(),
            }),
        ));
        Ok(())
    }

    fn handle_snapshot_response(&mut self, from: NodeId, response: SnapshotResponse) {
        if self.role != Role::Leader || response.term != self.election.current_term() {
            return;
        }

        let last_included = self
            .outgoing_snapshots
            .remove(&from)
            .unwrap_or_else(|| self.log.snapshot_meta().last_included_index);

        if let Some(replication) = &mut self.replication {
            replication.snapshot_complete(from, last_included);
        }
    }

    /// Proposes a command; only the leader accepts.
    ///
    /// Returns the log index the command was appended at. Commitment is
    /// observed later through [`RaftNode::apply_committed`].
    pub fn propose(&mut self, data: Bytes) -> Result<LogIndex> {
        self.propose_entry(EntryType::Command, data)
    }

    /// Proposes a membership change entry.
    pub fn propose_config(&mut self, data: Bytes) -> Result<LogIndex> {
        self.propose_entry(EntryType::Config, data)
    }

    fn propose_entry(&mut self, entry_type: EntryType, data: Bytes) -> Result<LogIndex> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.election.leader_id(),
            });
        }

        let term = self.election.current_term();
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            term,
            index,
            entry_type,
            data,
        };

        self.log.append(entry)?;
        self.advance_commit_from_self();

        Ok(index)
    }

    /// Commit advancement for clusters where the leader alone is a quorum.
    fn advance_commit_from_self(&mut self) {
        if let Some(replication) = &mut self.replication {
            if replication.note_leader_append(
                self.log.last_index(),
                self.election.current_term(),
                self.log.as_ref(),
            ) {
                self.commit_index = replication.commit_index();
            }
        }
    }

    /// Applies committed entries to the state machine, in order.
    ///
    /// Returns each applied entry with its result so the driver can resolve
    /// pending proposals and observe `Config` entries. Apply errors
    /// propagate: the entry is not marked applied and the driver decides
    /// whether to retry or halt.
    pub fn apply_committed(&mut self) -> Result<Vec<(LogEntry, ApplyResult)>> {
        let entries =
            replication::entries_to_apply(self.log.as_ref(), self.commit_index, self.last_applied);

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.state_machine.apply(&entry)?;
            self.last_applied = entry.index;
            results.push((entry, result));
        }

        Ok(results)
    }

    /// Compacts the log up to the last applied entry.
    pub fn compact_log(&mut self) -> Result<()> {
        let index = self.last_applied;
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };
        self.log.compact(index, term)
    }

    /// Adds a voter.
    pub fn add_peer(&mut self, peer: NodeId) {
        if peer == self.config.node_id || self.config.peers.contains(&peer) {
            return;
        }
        self.config.peers.push(peer);
        self.election.set_cluster_size(self.config.cluster_size());

        if let Some(replication) = &mut self.replication {
            replication.add_peer(peer, self.log.last_index());
        }
    }

    /// Removes a voter.
    pub fn remove_peer(&mut self, peer: NodeId) {
        self.config.peers.retain(|&p| p != peer);
        self.election.set_cluster_size(self.config.cluster_size());

        if let Some(replication) = &mut self.replication {
            replication.remove_peer(peer);
        }
        self.outgoing_snapshots.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use crate::state_machine::NoOpStateMachine;

    fn make_node(id: NodeId, peers: Vec<NodeId>) -> RaftNode<NoOpStateMachine> {
        let config = RaftConfig::new(id).with_peers(peers);
        RaftNode::new(config, Arc::new(MemLog::new()), NoOpStateMachine::new())
    }

    fn campaign(node: &mut RaftNode<NoOpStateMachine>) -> Vec<OutboundMessage> {
        loop {
            let messages = node.tick();
            if node.role() != Role::Follower {
                return messages;
            }
        }
    }

    #[test]
    fn test_new_node_is_follower() {
        let node = make_node(1, vec![2, 3]);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.current_term(), 0);
        assert!(node.leader_id().is_none());
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut node = make_node(1, vec![]);
        campaign(&mut node);

        assert!(node.is_leader());
        assert_eq!(node.leader_id(), Some(1));
    }

    #[test]
    fn test_campaign_broadcasts_vote_requests() {
        let mut node = make_node(1, vec![2, 3]);
        let messages = campaign(&mut node);

        assert_eq!(node.role(), Role::Candidate);
        assert_eq!(messages.len(), 2);
        for msg in &messages {
            assert!(matches!(msg.message, RaftMessage::RequestVote(_)));
        }
    }

    #[test]
    fn test_becomes_leader_with_majority() {
        let mut node = make_node(1, vec![2, 3]);
        campaign(&mut node);

        let messages = node
            .handle_message(2, RaftMessage::VoteResponse(VoteResponse::grant(1)))
            .unwrap();

        assert!(node.is_leader());
        assert!(!messages.is_empty());
    }

    #[test]
    fn test_steps_down_on_higher_term() {
        let mut node = make_node(1, vec![2, 3]);
        campaign(&mut node);
        node.handle_message(2, RaftMessage::VoteResponse(VoteResponse::grant(1)))
            .unwrap();
        assert!(node.is_leader());

        let ae = AppendEntries {
            term: 5,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        node.handle_message(2, RaftMessage::AppendEntries(ae)).unwrap();

        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.current_term(), 5);
        assert_eq!(node.leader_id(), Some(2));
    }

    #[test]
    fn test_propose_requires_leadership() {
        let mut node = make_node(1, vec![2, 3]);
        let result = node.propose(Bytes::from_static(b"cmd"));
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));
    }

    #[test]
    fn test_single_node_commit_and_apply() {
        let mut node = make_node(1, vec![]);
        campaign(&mut node);

        let index = node.propose(Bytes::from_static(b"cmd")).unwrap();
        assert_eq!(index, 2); // index 1 is the leadership no-op

        let applied = node.apply_committed().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].0.index, index);
        assert_eq!(node.last_applied(), index);
    }

    #[test]
    fn test_follower_replicates_and_applies() {
        let mut node = make_node(1, vec![2, 3]);

        let ae = AppendEntries {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::command(1, 1, Bytes::from_static(b"c1")),
                LogEntry::command(1, 2, Bytes::from_static(b"c2")),
            ],
            leader_commit: 2,
        };
        let messages = node.handle_message(2, RaftMessage::AppendEntries(ae)).unwrap();

        match &messages[0].message {
            RaftMessage::AppendResponse(ar) => {
                assert!(ar.success);
                assert_eq!(ar.match_index, 2);
            }
            other => panic!("unexpected response: {other}"),
        }

        assert_eq!(node.commit_index(), 2);
        let applied = node.apply_committed().unwrap();
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_leader_commits_after_quorum_ack() {
        let mut node = make_node(1, vec![2, 3]);
        campaign(&mut node);
        node.handle_message(2, RaftMessage::VoteResponse(VoteResponse::grant(1)))
            .unwrap();

        let index = node.propose(Bytes::from_static(b"cmd")).unwrap();
        assert_eq!(node.commit_index(), 0); // quorum of 3 needs a follower ack

        node.handle_message(
            2,
            RaftMessage::AppendResponse(AppendResponse::success(1, index)),
        )
        .unwrap();

        assert_eq!(node.commit_index(), index);
    }

    #[test]
    fn test_install_snapshot() {
        let mut node = make_node(1, vec![2, 3]);

        let snapshot = InstallSnapshot {
            term: 3,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 2,
            offset: 0,
            data: Bytes::from_static(b"snapshot state"),
            done: true,
        };
        node.handle_message(2, RaftMessage::InstallSnapshot(snapshot))
            .unwrap();

        assert_eq!(node.last_applied(), 10);
        assert_eq!(node.commit_index(), 10);
        assert_eq!(node.log().first_index(), 11);
        assert_eq!(node.state_machine().last_applied(), 10);
    }

    #[test]
    fn test_rejects_stale_append_entries() {
        let mut node = make_node(1, vec![2, 3]);

        let ae = AppendEntries {
            term: 5,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        node.handle_message(2, RaftMessage::AppendEntries(ae)).unwrap();

        let stale = AppendEntries {
            term: 3,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        let messages = node
            .handle_message(3, RaftMessage::AppendEntries(stale))
            .unwrap();

        match &messages[0].message {
            RaftMessage::AppendResponse(ar) => {
                assert!(!ar.success);
                assert_eq!(ar.term, 5);
            }
            other => panic!("unexpected response: {other}"),
        }
    }

    #[test]
    fn test_ignores_vote_request_from_non_member() {
        let mut node = make_node(1, vec![2, 3]);

        let rogue = RequestVote {
            term: 99,
            candidate_id: 9,
            last_log_index: 0,
            last_log_term: 0,
        };
        let messages = node
            .handle_message(9, RaftMessage::RequestVote(rogue))
            .unwrap();

        // The inflated term is not adopted and the vote is denied.
        assert_eq!(node.current_term(), 0);
        match &messages[0].message {
            RaftMessage::VoteResponse(vr) => assert!(!vr.vote_granted),
            other => panic!("unexpected response: {other}"),
        }
    }

    #[test]
    fn test_add_remove_peer_updates_quorum() {
        let mut node = make_node(1, vec![2]);

        node.add_peer(3);
        assert_eq!(node.peers(), &[2, 3]);
        // Duplicate adds are ignored.
        node.add_peer(3);
        assert_eq!(node.peers(), &[2, 3]);

        node.remove_peer(2);
        assert_eq!(node.peers(), &[3]);
    }

    #[test]
    fn test_persistent_state_roundtrip() {
        let mut node = make_node(1, vec![2, 3]);
        campaign(&mut node);

        let (term, voted_for) = node.persistent_state();
        assert_eq!(term, 1);
        assert_eq!(voted_for, Some(1));

        let mut fresh = make_node(1, vec![2, 3]);
        fresh.restore_state(term, voted_for);
        assert_eq!(fresh.current_term(), 1);
    }
}
