use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, NodeId, Term};

/// One cluster member: its identity, the address peers use for consensus
/// traffic, and the client-facing address requests are forwarded to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub raft_addr: SocketAddr,
    pub api_addr: SocketAddr,
}

/// The voting membership in effect. Only ever changed by a replicated
/// configuration entry; every member is a voter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    members: Vec<Member>,
}

impl ClusterConfig {
    /// Builds a configuration, keeping the last occurrence of a duplicated id.
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        let mut config = ClusterConfig::default();
        for member in members {
            config.upsert(member);
        }
        config
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.member(id).is_some()
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    /// Smallest number of voters that forms a strict majority.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Returns a copy with `member` added or its addresses replaced.
    pub fn with_member(&self, member: Member) -> Self {
        let mut next = self.clone();
        next.upsert(member);
        next
    }

    fn upsert(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => *existing = member,
            None => {
                self.members.push(member);
                self.members.sort_by_key(|m| m.id);
            }
        }
    }
}

/// Describes the state captured by a snapshot: the last log entry it covers
/// and the configuration in effect at that entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub config: ClusterConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64) -> Member {
        Member {
            id: NodeId::from(id),
            raft_addr: format!("127.0.0.1:{}", 7000 + id).parse().unwrap(),
            api_addr: format!("127.0.0.1:{}", 8000 + id).parse().unwrap(),
        }
    }

    #[test]
    fn members_are_sorted_and_unique() {
        let config = ClusterConfig::new([member(3), member(1), member(3)]);
        let ids: Vec<_> = config.voter_ids().collect();
        assert_eq!(ids, vec![NodeId::from(1), NodeId::from(3)]);
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(ClusterConfig::new([member(1)]).quorum(), 1);
        assert_eq!(ClusterConfig::new([member(1), member(2)]).quorum(), 2);
        assert_eq!(ClusterConfig::new([member(1), member(2), member(3)]).quorum(), 2);
        assert_eq!(
            ClusterConfig::new([member(1), member(2), member(3), member(4)]).quorum(),
            3
        );
    }

    #[test]
    fn with_member_replaces_addresses() {
        let config = ClusterConfig::new([member(1)]);
        let mut moved = member(1);
        moved.api_addr = "127.0.0.1:9999".parse().unwrap();

        let next = config.with_member(moved.clone());

        assert_eq!(next.len(), 1);
        assert_eq!(next.member(NodeId::from(1)), Some(&moved));
        assert_eq!(config.member(NodeId::from(1)), Some(&member(1)));
    }
}
