use std::collections::{HashMap, HashSet};

use crate::types::{ClusterConfig, LogIndex, NodeId};

/// Coarse role reported to callers outside the consensus core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// §5.1: followers are passive: they issue no requests, only respond to RPCs from
/// leaders and candidates. If a follower receives no communication, it starts an election.
#[derive(Default)]
pub struct Follower {
    pub leader_id: Option<NodeId>,
}

impl Follower {
    pub fn new() -> Self {
        Self { leader_id: None }
    }

    pub fn set_leader(&mut self, leader_id: NodeId) {
        self.leader_id = Some(leader_id);
    }
}

/// §5.2: a candidate requests votes from peers to win an election. It votes for itself
/// and wins if it receives votes from a majority of the voters in the configuration.
pub struct Candidate {
    votes_received: HashSet<NodeId>,
}

impl Candidate {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            votes_received: HashSet::from([self_id]),
        }
    }

    pub fn record_vote(&mut self, from: NodeId) {
        self.votes_received.insert(from);
    }

    // Only votes from current voters count; a strict majority of them is required.
    pub fn has_majority(&self, config: &ClusterConfig) -> bool {
        let granted = config
            .voter_ids()
            .filter(|id| self.votes_received.contains(id))
            .count();
        granted >= config.quorum()
    }
}

/// §5.3, Figure 2, Volatile state on leaders (reinitialized after election).
/// The leader maintains next_index and match_index for each follower to track replication.
pub struct Leader {
    next_index: HashMap<NodeId, LogIndex>,  // next log index to send to each server
    match_index: HashMap<NodeId, LogIndex>, // highest log index known to be replicated
    snapshot_progress: HashMap<NodeId, (LogIndex, u64)>, // snapshot being sent, bytes acknowledged
}

impl Leader {
    // nextIndex initialized to leader last log index + 1 (optimistic).
    // matchIndex initialized to 0 (conservative, increases monotonically).
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut leader = Self {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            snapshot_progress: HashMap::new(),
        };
        for &peer in peers {
            leader.track(peer, last_log_index);
        }
        leader
    }

    /// Start tracking a peer that joined after the election. No-op for known peers.
    pub fn track(&mut self, peer: NodeId, last_log_index: LogIndex) {
        self.next_index.entry(peer).or_insert(last_log_index.next());
        self.match_index.entry(peer).or_insert(LogIndex::ZERO);
    }

    /// Get next_index for a peer.
    pub fn next_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    /// Get match_index for a peer.
    pub fn match_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }

    /// Update follower progress after successful replication. Responses can
    /// arrive out of order, so progress never moves backwards.
    pub fn record_success(&mut self, from: NodeId, match_index: LogIndex) {
        self.snapshot_progress.remove(&from);
        let current = self.match_index.entry(from).or_insert(LogIndex::ZERO);
        if match_index > *current {
            *current = match_index;
        }
        let matched = *current;
        let next = self.next_index.entry(from).or_insert(matched.next());
        if *next <= matched {
            *next = matched.next();
        }
    }

    /// Bytes of the snapshot ending at `snapshot` that `peer` already holds.
    pub fn snapshot_offset(&self, peer: NodeId, snapshot: LogIndex) -> u64 {
        match self.snapshot_progress.get(&peer) {
            Some(&(index, offset)) if index == snapshot => offset,
            _ => 0,
        }
    }

    /// Record how much of `snapshot` a peer holds. False if nothing changed,
    /// e.g. for a reply to a duplicate chunk.
    pub fn record_snapshot_progress(&mut self, peer: NodeId, snapshot: LogIndex, offset: u64) -> bool {
        self.snapshot_progress.insert(peer, (snapshot, offset)) != Some((snapshot, offset))
    }

    /// Move next_index back after failed replication. `follower_last` is the
    /// follower's last log index; next_index jumps just past it when that is
    /// further back than a single step.
    pub fn record_failure(&mut self, from: NodeId, follower_last: LogIndex) {
        if let Some(current) = self.next_index.get_mut(&from) {
            if let Some(prev) = current.prev() {
                let floor = self.match_index.get(&from).copied().unwrap_or_default().next();
                *current = prev.min(follower_last.next()).max(floor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Member;

    fn config(ids: &[u64]) -> ClusterConfig {
        ClusterConfig::new(ids.iter().map(|&id| Member {
            id: NodeId::from(id),
            raft_addr: format!("127.0.0.1:{}", 7000 + id).parse().unwrap(),
            api_addr: format!("127.0.0.1:{}", 8000 + id).parse().unwrap(),
        }))
    }

    #[test]
    fn leader_new_initializes_correctly() {
        let peers = vec![NodeId::from(1), NodeId::from(2), NodeId::from(3)];
        let leader = Leader::new(&peers, LogIndex::from(5));

        for peer in &peers {
            assert_eq!(leader.next_index_for(*peer), Some(LogIndex::from(6)));
            assert_eq!(leader.match_index_for(*peer), Some(LogIndex::ZERO));
        }
    }

    #[test]
    fn next_index_for_returns_none_for_unknown_peer() {
        let leader = Leader::new(&[NodeId::from(1)], LogIndex::ZERO);

        assert_eq!(leader.next_index_for(NodeId::from(99)), None);
    }

    #[test]
    fn record_success_updates_only_target_peer() {
        let peers = vec![NodeId::from(1), NodeId::from(2)];
        let mut leader = Leader::new(&peers, LogIndex::ZERO);

        leader.record_success(NodeId::from(1), LogIndex::from(5));

        assert_eq!(leader.match_index_for(NodeId::from(1)), Some(LogIndex::from(5)));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(6)));
        assert_eq!(leader.next_index_for(NodeId::from(2)), Some(LogIndex::from(1)));
    }

    #[test]
    fn stale_success_does_not_regress_progress() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::ZERO);

        leader.record_success(NodeId::from(1), LogIndex::from(8));
        leader.record_success(NodeId::from(1), LogIndex::from(3));

        assert_eq!(leader.match_index_for(NodeId::from(1)), Some(LogIndex::from(8)));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(9)));
    }

    #[test]
    fn record_failure_decrements_next_index() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::from(10));

        leader.record_failure(NodeId::from(1), LogIndex::from(10));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(10)));

        leader.record_failure(NodeId::from(1), LogIndex::from(10));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(9)));
    }

    #[test]
    fn snapshot_progress_tracks_one_snapshot_per_peer() {
        let mut leader = Leader::new(&[NodeId::from(2)], LogIndex::from(10));
        let peer = NodeId::from(2);

        assert!(leader.record_snapshot_progress(peer, LogIndex::from(8), 1024));
        assert!(!leader.record_snapshot_progress(peer, LogIndex::from(8), 1024));
        assert_eq!(leader.snapshot_offset(peer, LogIndex::from(8)), 1024);
        // A newer snapshot starts from the beginning.
        assert_eq!(leader.snapshot_offset(peer, LogIndex::from(9)), 0);

        leader.record_success(peer, LogIndex::from(8));
        assert_eq!(leader.snapshot_offset(peer, LogIndex::from(8)), 0);
    }

    #[test]
    fn record_failure_jumps_to_follower_hint() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::from(10));

        leader.record_failure(NodeId::from(1), LogIndex::from(2));

        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(3)));
    }

    #[test]
    fn record_failure_never_drops_below_match() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::from(10));
        leader.record_success(NodeId::from(1), LogIndex::from(4));

        leader.record_failure(NodeId::from(1), LogIndex::ZERO);

        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(5)));
    }

    #[test]
    fn record_failure_for_unknown_peer_does_nothing() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::from(5));

        leader.record_failure(NodeId::from(99), LogIndex::ZERO);

        assert_eq!(leader.next_index_for(NodeId::from(99)), None);
    }

    #[test]
    fn track_adds_new_peer_once() {
        let mut leader = Leader::new(&[NodeId::from(1)], LogIndex::from(3));
        leader.track(NodeId::from(4), LogIndex::from(7));
        leader.track(NodeId::from(4), LogIndex::from(9));

        assert_eq!(leader.next_index_for(NodeId::from(4)), Some(LogIndex::from(8)));
    }

    #[test]
    fn candidate_counts_only_voters() {
        let mut candidate = Candidate::new(NodeId::from(1));
        let voters = config(&[1, 2, 3]);

        assert!(!candidate.has_majority(&voters));

        candidate.record_vote(NodeId::from(42));
        assert!(!candidate.has_majority(&voters));

        candidate.record_vote(NodeId::from(2));
        assert!(candidate.has_majority(&voters));
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut candidate = Candidate::new(NodeId::from(1));
        let voters = config(&[1, 2, 3, 4, 5]);

        candidate.record_vote(NodeId::from(2));
        candidate.record_vote(NodeId::from(2));

        assert!(!candidate.has_majority(&voters));
    }

    #[test]
    fn single_voter_elects_itself() {
        let candidate = Candidate::new(NodeId::from(1));
        assert!(candidate.has_majority(&config(&[1])));
    }
}
