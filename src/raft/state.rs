//! Raft node state and role transitions.

use crate::types::{LogIndex, NodeId, Role, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State that must survive restarts (term and vote).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate voted for in the current term, if any.
    pub voted_for: Option<NodeId>,
}

/// Replication bookkeeping the leader keeps per follower.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each follower.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each follower.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }
        Self {
            next_index,
            match_index,
        }
    }

    pub fn update_match(&mut self, peer: NodeId, index: LogIndex) {
        self.match_index.insert(peer, index);
        self.next_index.insert(peer, index + 1);
    }

    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }
}

/// Complete in-memory consensus state for one node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    /// Highest entry known committed.
    pub commit_index: LogIndex,
    /// Highest entry applied to the state machine.
    pub last_applied: LogIndex,
    /// Only populated while this node is leader.
    pub leader: Option<LeaderState>,
    pub peers: Vec<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            role: Role::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            peers,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Majority size for this cluster (peers plus self).
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.role = Role::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(node_id = self.node_id, term, leader = ?leader_id, "became follower");
    }

    pub fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    /// Highest index replicated on a majority, never below the current
    /// commit index.
    pub fn calculate_commit_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable();
        indices.reverse();

        let quorum_idx = self.quorum_size() - 1;
        if quorum_idx < indices.len() {
            indices[quorum_idx].max(self.commit_index)
        } else {
            self.commit_index
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_follower() {
        let state = RaftState::new(1, vec![2, 3]);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn candidate_votes_for_self() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        assert_eq!(state.role, Role::Candidate);
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn leader_initializes_follower_indices() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_leader(5);

        assert!(state.is_leader());
        assert_eq!(state.leader_id, Some(1));
        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&6));
        assert_eq!(leader.match_index.get(&2), Some(&0));
    }

    #[test]
    fn higher_term_resets_vote() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        assert_eq!(state.persistent.voted_for, Some(1));

        state.become_follower(5, Some(2));
        assert_eq!(state.persistent.voted_for, None);
        assert_eq!(state.current_term(), 5);
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(RaftState::new(1, vec![]).quorum_size(), 1);
        assert_eq!(RaftState::new(1, vec![2, 3]).quorum_size(), 2);
        assert_eq!(RaftState::new(1, vec![2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn commit_index_needs_majority() {
        let mut state = RaftState::new(1, vec![2, 3, 4, 5]);
        state.become_candidate();
        state.become_leader(10);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);

        // Indices sorted: [10, 9, 8, 7, 6]; quorum of 3 covers index 8.
        assert_eq!(state.calculate_commit_index(10), 8);
    }

    #[test]
    fn single_node_commits_own_log() {
        let mut state = RaftState::new(1, vec![]);
        state.become_candidate();
        state.become_leader(0);
        assert_eq!(state.calculate_commit_index(4), 4);
    }
}
