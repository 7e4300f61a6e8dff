use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

#[derive(Debug)]
pub struct RaftState {
    // Persistent state (mirrored into the log's hard state)
    pub current_term: AtomicU64,
    pub voted_for: RwLock<Option<u64>>,

    // Volatile state
    pub role: RwLock<RaftRole>,
    pub leader_id: RwLock<Option<u64>>,
    pub commit_index: AtomicU64,

    // Leader volatile state
    pub next_index: RwLock<HashMap<u64, u64>>,
    pub match_index: RwLock<HashMap<u64, u64>>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: AtomicU64::new(0),
            voted_for: RwLock::new(None),
            role: RwLock::new(RaftRole::Follower),
            leader_id: RwLock::new(None),
            commit_index: AtomicU64::new(0),
            next_index: RwLock::new(HashMap::new()),
            match_index: RwLock::new(HashMap::new()),
        }
    }

    /// Steps down. The vote is only cleared when the term actually advances.
    pub fn become_follower(&self, term: u64) {
        let previous = self.current_term.swap(term, Ordering::AcqRel);
        if term > previous {
            *self.voted_for.write() = None;
            *self.leader_id.write() = None;
        }
        *self.role.write() = RaftRole::Follower;
    }

    /// Starts a new term and votes for `self_id`. Returns the new term.
    pub fn become_candidate(&self, self_id: u64) -> u64 {
        let new_term = self.current_term.fetch_add(1, Ordering::AcqRel) + 1;
        *self.role.write() = RaftRole::Candidate;
        *self.voted_for.write() = Some(self_id);
        *self.leader_id.write() = None;
        new_term
    }

    /// Takes leadership for the current term.
    pub fn become_leader(&self, self_id: u64, peer_ids: &[u64], last_log_index: u64) {
        *self.role.write() = RaftRole::Leader;
        *self.leader_id.write() = Some(self_id);

        let mut next_idx = HashMap::new();
        let mut match_idx = HashMap::new();
        for &peer_id in peer_ids.iter().filter(|&&id| id != self_id) {
            next_idx.insert(peer_id, last_log_index + 1);
            match_idx.insert(peer_id, 0);
        }
        *self.next_index.write() = next_idx;
        *self.match_index.write() = match_idx;
    }

    pub fn is_leader(&self) -> bool {
        *self.role.read() == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        *self.role.read()
    }

    pub fn term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    pub fn voted_for(&self) -> Option<u64> {
        *self.voted_for.read()
    }

    pub fn vote_for(&self, candidate_id: u64) {
        *self.voted_for.write() = Some(candidate_id);
    }

    pub fn leader_id(&self) -> Option<u64> {
        *self.leader_id.read()
    }

    pub fn set_leader_id(&self, leader_id: u64) {
        *self.leader_id.write() = Some(leader_id);
    }

    /// Restores persisted term and vote after a restart.
    pub fn restore(&self, term: u64, voted_for: Option<u64>, commit_index: u64) {
        self.current_term.store(term, Ordering::Release);
        *self.voted_for.write() = voted_for;
        self.commit_index.store(commit_index, Ordering::Release);
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Raises the commit index; it never moves backwards.
    pub fn advance_commit_index(&self, index: u64) -> bool {
        self.commit_index.fetch_max(index, Ordering::AcqRel) < index
    }

    pub fn next_index(&self, peer_id: u64) -> Option<u64> {
        self.next_index.read().get(&peer_id).copied()
    }

    pub fn set_next_index(&self, peer_id: u64, index: u64) {
        self.next_index.write().insert(peer_id, index.max(1));
    }

    pub fn match_index(&self, peer_id: u64) -> Option<u64> {
        self.match_index.read().get(&peer_id).copied()
    }

    /// Records replication progress; stale acknowledgements never lower it.
    pub fn update_match_index(&self, peer_id: u64, index: u64) {
        let mut match_idx = self.match_index.write();
        let current = match_idx.entry(peer_id).or_insert(0);
        if index > *current {
            *current = index;
        }
    }

    /// Starts tracking a peer that joined after this node became leader.
    pub fn track_peer(&self, peer_id: u64, last_log_index: u64) {
        self.next_index
            .write()
            .entry(peer_id)
            .or_insert(last_log_index + 1);
        self.match_index.write().entry(peer_id).or_insert(0);
    }

    /// Highest index replicated on a majority of `voters`.
    ///
    /// The leader counts with its own last log index.
    pub fn quorum_match_index(&self, voters: &[u64], self_id: u64, self_last_index: u64) -> u64 {
        if voters.is_empty() {
            return 0;
        }

        let mut indices: Vec<u64> = voters
            .iter()
            .map(|&id| {
                if id == self_id {
                    self_last_index
                } else {
                    self.match_index(id).unwrap_or(0)
                }
            })
            .collect();
        indices.sort_by(|a, b| b.cmp(a)); // Sort descending

        indices[voters.len() / 2]
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_and_leader_terms() {
        let state = RaftState::new();
        assert_eq!(state.become_candidate(1), 1);
        assert_eq!(state.voted_for(), Some(1));

        state.become_leader(1, &[1, 2, 3], 0);
        assert_eq!(state.term(), 1);
        assert!(state.is_leader());
        assert_eq!(state.next_index(2), Some(1));
        assert_eq!(state.match_index(1), None);
    }

    #[test]
    fn test_follower_keeps_vote_within_term() {
        let state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(1);
        assert_eq!(state.voted_for(), Some(1));

        state.become_follower(2);
        assert_eq!(state.voted_for(), None);
        assert_eq!(state.role(), RaftRole::Follower);
    }

    #[test]
    fn test_quorum_match_index() {
        let state = RaftState::new();
        state.become_leader(1, &[1, 2, 3], 0);

        assert_eq!(state.quorum_match_index(&[1, 2, 3], 1, 10), 0);

        state.update_match_index(2, 7);
        assert_eq!(state.quorum_match_index(&[1, 2, 3], 1, 10), 7);

        state.update_match_index(3, 10);
        assert_eq!(state.quorum_match_index(&[1, 2, 3], 1, 10), 10);

        state.update_match_index(3, 4);
        assert_eq!(state.match_index(3), Some(10));

        // Single voter commits on its own.
        assert_eq!(state.quorum_match_index(&[1], 1, 12), 12);
        // Four voters need three.
        assert_eq!(state.quorum_match_index(&[1, 2, 3, 4], 1, 12), 7);
    }

    #[test]
    fn test_commit_index_monotonic() {
        let state = RaftState::new();
        assert!(state.advance_commit_index(5));
        assert!(!state.advance_commit_index(3));
        assert_eq!(state.commit_index(), 5);
    }
}
