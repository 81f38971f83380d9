//! Leader election.
//!
//! Timing is tick-based for testability: the driver calls
//! [`ElectionState::tick`] at a fixed interval and the state counts ticks
//! against a randomized election timeout (or the heartbeat interval when
//! leading). Randomized timeouts keep split votes rare.

use std::collections::HashSet;

use rand::Rng;

use crate::log::LogStore;
use crate::rpc::{NodeId, RequestVote, Term, VoteResponse};

/// Tick bounds for elections and heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    /// Minimum election timeout, in ticks.
    pub min_election_ticks: u64,
    /// Maximum election timeout, in ticks.
    pub max_election_ticks: u64,
    /// Heartbeat interval, in ticks.
    pub heartbeat_ticks: u64,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            min_election_ticks: 10,
            max_election_ticks: 20,
            heartbeat_ticks: 3,
        }
    }
}

/// Election bookkeeping for one node.
#[derive(Debug)]
pub struct ElectionState {
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    votes_received: HashSet<NodeId>,
    /// Ticks since the last reset; measures the election timeout for
    /// followers/candidates and the heartbeat interval for leaders.
    ticks_since_reset: u64,
    election_timeout: u64,
    timing: ElectionTiming,
    cluster_size: usize,
}

impl ElectionState {
    /// Creates state for a cluster of `cluster_size` voters.
    pub fn new(cluster_size: usize, timing: ElectionTiming) -> Self {
        let election_timeout = Self::random_timeout(&timing);
        Self {
            current_term: 0,
            voted_for: None,
            leader_id: None,
            votes_received: HashSet::new(),
            ticks_since_reset: 0,
            election_timeout,
            timing,
            cluster_size,
        }
    }

    fn random_timeout(timing: &ElectionTiming) -> u64 {
        rand::thread_rng().gen_range(timing.min_election_ticks..=timing.max_election_ticks)
    }

    /// Current term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Vote cast in the current term, if any.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Leader known for the current term, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Records the leader for the current term.
    pub fn set_leader(&mut self, leader_id: NodeId) {
        self.leader_id = Some(leader_id);
    }

    /// Updates the voter count after a membership change.
    pub fn set_cluster_size(&mut self, cluster_size: usize) {
        self.cluster_size = cluster_size;
    }

    /// Votes needed for a majority.
    pub fn quorum_size(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Restarts the election timer with a fresh randomized timeout.
    pub fn reset_election_timer(&mut self) {
        self.ticks_since_reset = 0;
        self.election_timeout = Self::random_timeout(&self.timing);
    }

    /// Restarts the heartbeat timer.
    pub fn reset_heartbeat_timer(&mut self) {
        self.ticks_since_reset = 0;
    }

    /// Advances one tick; true when the election timeout has elapsed.
    pub fn tick(&mut self) -> bool {
        self.ticks_since_reset += 1;
        self.ticks_since_reset >= self.election_timeout
    }

    /// True when a leader should send its next heartbeat round.
    pub fn should_send_heartbeat(&self) -> bool {
        self.ticks_since_reset >= self.timing.heartbeat_ticks
    }

    /// Adopts a higher term, clearing vote and leader state.
    ///
    /// Returns true when the term changed (the caller steps down).
    pub fn maybe_update_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.votes_received.clear();
        self.reset_election_timer();
        true
    }

    /// Enters a new election: bumps the term, votes for self, and returns
    /// the vote request to broadcast.
    pub fn start_election(&mut self, node_id: NodeId, log: &dyn LogStore) -> RequestVote {
        self.current_term += 1;
        self.voted_for = Some(node_id);
        self.votes_received.clear();
        self.votes_received.insert(node_id);
        self.leader_id = None;
        self.reset_election_timer();

        RequestVote {
            term: self.current_term,
            candidate_id: node_id,
            last_log_index: log.last_index(),
            last_log_term: log.last_term(),
        }
    }

    /// Records a vote response; true when a majority is reached.
    pub fn record_vote(&mut self, from: NodeId, granted: bool) -> bool {
        if granted {
            self.votes_received.insert(from);
        }
        granted && self.has_majority()
    }

    /// True when the received votes form a majority.
    pub fn has_majority(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Handles a vote solicitation.
    ///
    /// Grants when we have not voted for someone else this term and the
    /// candidate's log is at least as up-to-date as ours. Returns the
    /// response and whether our term advanced (the caller steps down).
    pub fn handle_request_vote(
        &mut self,
        request: &RequestVote,
        log: &dyn LogStore,
    ) -> (VoteResponse, bool) {
        let term_updated = self.maybe_update_term(request.term);

        if request.term < self.current_term {
            return (VoteResponse::deny(self.current_term), term_updated);
        }

        let can_vote = match self.voted_for {
            None => true,
            Some(id) => id == request.candidate_id,
        };
        let log_ok = log.is_up_to_date(request.last_log_index, request.last_log_term);

        if can_vote && log_ok {
            self.voted_for = Some(request.candidate_id);
            self.reset_election_timer();
            (VoteResponse::grant(self.current_term), term_updated)
        } else {
            (VoteResponse::deny(self.current_term), term_updated)
        }
    }

    /// Marks this node as the leader of the current term.
    pub fn become_leader(&mut self, node_id: NodeId) {
        self.leader_id = Some(node_id);
        self.reset_heartbeat_timer();
    }

    /// Reinstates persisted term and vote during recovery.
    pub fn restore(&mut self, term: Term, voted_for: Option<NodeId>) {
        self.current_term = term;
        self.voted_for = voted_for;
    }
}
