use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::action::Action;
use crate::command::Command;
use crate::fsm::KvStateMachine;
use crate::replica::{MembershipChange, Replica};
use crate::runtime::{Event, Runtime, TimerConfig};
use crate::state::RoleKind;
use crate::storage::MemoryStorage;
use crate::store::KvStore;
use crate::types::{ClusterConfig, LogIndex, Member, Message, NodeId, Term};

type SimRuntime = Runtime<MemoryStorage, KvStateMachine>;

/// A message in flight between nodes.
struct InFlight {
    from: NodeId,
    to: NodeId,
    message: Message,
}

/// Simulated cluster for testing. Messages are queued and delivered only when
/// asked to, so every interleaving is explicit.
pub struct Cluster {
    _dirs: Vec<TempDir>,
    runtimes: Vec<SimRuntime>,
    messages: VecDeque<InFlight>,
    /// Traffic to or from these nodes is dropped.
    isolated: HashSet<NodeId>,
    snapshot_threshold: u64,
    /// InstallSnapshot messages delivered so far.
    snapshot_chunks: usize,
}

pub fn member(id: u64) -> Member {
    Member {
        id: NodeId::from(id),
        raft_addr: format!("127.0.0.1:{}", 17000 + id).parse().unwrap(),
        api_addr: format!("127.0.0.1:{}", 18000 + id).parse().unwrap(),
    }
}

impl Cluster {
    /// Create a bootstrapped cluster of `size` voters with ids 1..=size.
    pub fn new(size: usize, snapshot_threshold: u64) -> Self {
        let mut cluster = Self {
            _dirs: Vec::new(),
            runtimes: Vec::new(),
            messages: VecDeque::new(),
            isolated: HashSet::new(),
            snapshot_threshold,
            snapshot_chunks: 0,
        };
        let config = ClusterConfig::new((1..=size as u64).map(member));
        for _ in 0..size {
            let index = cluster.add_node();
            assert!(cluster.runtimes[index].bootstrap(config.clone()).unwrap());
        }
        cluster
    }

    /// Add a node with no configuration. Returns its index.
    pub fn add_node(&mut self) -> usize {
        let id = NodeId::from(self.runtimes.len() as u64 + 1);
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(&dir.path().join("kv.redb")).unwrap();
        let replica = Replica::new(id, MemoryStorage::new()).unwrap();
        let runtime = Runtime::new(
            replica,
            KvStateMachine::new(Arc::new(store)),
            TimerConfig::default(),
            self.snapshot_threshold,
        )
        .unwrap();
        self._dirs.push(dir);
        self.runtimes.push(runtime);
        self.runtimes.len() - 1
    }

    /// Get a reference to a node's runtime by index (0-based).
    pub fn runtime(&self, index: usize) -> &SimRuntime {
        &self.runtimes[index]
    }

    pub fn store(&self, index: usize) -> &KvStore {
        self.runtimes[index].fsm().store()
    }

    fn id(&self, index: usize) -> NodeId {
        self.runtimes[index].replica().id()
    }

    /// Trigger election timeout on a specific node.
    pub fn election_timeout(&mut self, index: usize) {
        let actions = self.runtimes[index].handle(Event::ElectionTimeout).unwrap();
        self.queue_actions(index, actions);
    }

    /// Trigger heartbeat timeout on a specific node.
    pub fn heartbeat_timeout(&mut self, index: usize) {
        let actions = self.runtimes[index].handle(Event::HeartbeatTimeout).unwrap();
        self.queue_actions(index, actions);
    }

    /// Submit `key = value` on a node; the index if it is leader.
    pub fn submit(&mut self, index: usize, key: &str, value: &str) -> Option<LogIndex> {
        let data = Command::set(key, value).encode().unwrap();
        let (log_index, actions) = self.runtimes[index].submit(data).unwrap()?;
        self.queue_actions(index, actions);
        Some(log_index)
    }

    pub fn add_member(&mut self, index: usize, new_member: Member) -> MembershipChange {
        match self.runtimes[index].add_member(new_member).unwrap() {
            MembershipChange::Proposed { index: log_index, actions } => {
                self.queue_actions(index, actions);
                MembershipChange::Proposed {
                    index: log_index,
                    actions: Vec::new(),
                }
            }
            other => other,
        }
    }

    pub fn isolate(&mut self, index: usize) {
        let id = self.id(index);
        self.isolated.insert(id);
    }

    pub fn heal(&mut self, index: usize) {
        let id = self.id(index);
        self.isolated.remove(&id);
    }

    /// Deliver all pending messages.
    pub fn deliver_all(&mut self) {
        while let Some(msg) = self.messages.pop_front() {
            self.deliver(msg);
        }
    }

    /// Two heartbeat rounds from the leader: one replicates, one spreads the commit index.
    pub fn settle(&mut self) {
        for _ in 0..2 {
            if let Some(leader) = self.leader() {
                self.heartbeat_timeout(leader);
            }
            self.deliver_all();
        }
    }

    /// Collect background snapshots on every node.
    pub fn finish_snapshots(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for runtime in &mut self.runtimes {
                runtime.poll_snapshot().unwrap();
            }
            if self.runtimes.iter().all(|rt| !rt.snapshot_in_progress()) || Instant::now() > deadline {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Deliver a single message and queue any responses.
    fn deliver(&mut self, inflight: InFlight) {
        if self.isolated.contains(&inflight.from) || self.isolated.contains(&inflight.to) {
            return;
        }
        if let Some(index) = self.node_index(inflight.to) {
            if matches!(inflight.message, Message::InstallSnapshot(_)) {
                self.snapshot_chunks += 1;
            }
            let actions = self.runtimes[index]
                .handle(Event::Message {
                    from: inflight.from,
                    message: inflight.message,
                })
                .unwrap();
            self.queue_actions(index, actions);
        }
    }

    /// Queue outgoing messages from a node.
    fn queue_actions(&mut self, from_index: usize, actions: Vec<Action>) {
        let from = self.id(from_index);
        for action in actions {
            if let Action::Send { to, message } = action {
                self.messages.push_back(InFlight { from, to, message });
            }
        }
    }

    /// Find runtime index by node ID.
    fn node_index(&self, id: NodeId) -> Option<usize> {
        self.runtimes.iter().position(|rt| rt.replica().id() == id)
    }

    /// Find the current leader, if any. With several (stale) leaders the one
    /// with the highest term wins.
    pub fn leader(&self) -> Option<usize> {
        (0..self.runtimes.len())
            .filter(|&i| self.runtimes[i].replica().is_leader())
            .max_by_key(|&i| self.runtimes[i].replica().current_term())
    }

    /// Count nodes in each role.
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for rt in &self.runtimes {
            match rt.replica().role_kind() {
                RoleKind::Follower => counts.0 += 1,
                RoleKind::Candidate => counts.1 += 1,
                RoleKind::Leader => counts.2 += 1,
            }
        }
        counts
    }

    /// Leaders per term across the cluster.
    pub fn leaders_by_term(&self) -> HashMap<Term, usize> {
        let mut leaders = HashMap::new();
        for rt in &self.runtimes {
            if rt.replica().is_leader() {
                *leaders.entry(rt.replica().current_term()).or_insert(0) += 1;
            }
        }
        leaders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::SNAPSHOT_CHUNK_SIZE;
    use crate::storage::Storage;

    fn elected(size: usize, threshold: u64) -> Cluster {
        let mut cluster = Cluster::new(size, threshold);
        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));
        cluster
    }

    #[test]
    fn single_node_becomes_leader() {
        let mut cluster = Cluster::new(1, 0);

        cluster.election_timeout(0);

        assert_eq!(cluster.leader(), Some(0));
    }

    #[test]
    fn three_node_leader_election() {
        let mut cluster = Cluster::new(3, 0);

        // Node 0 starts election.
        cluster.election_timeout(0);
        assert_eq!(cluster.role_counts(), (2, 1, 0));

        // Deliver vote requests and responses.
        cluster.deliver_all();

        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.role_counts(), (2, 0, 1));
    }

    #[test]
    fn split_vote_yields_at_most_one_leader_per_term() {
        let mut cluster = Cluster::new(3, 0);

        // Two candidates in the same term.
        cluster.election_timeout(0);
        cluster.election_timeout(1);
        cluster.deliver_all();
        assert!(cluster.leaders_by_term().values().all(|&n| n <= 1));

        // Retry until somebody wins.
        for round in 0..5 {
            if cluster.leader().is_some() {
                break;
            }
            cluster.election_timeout(round % 3);
            cluster.deliver_all();
        }
        assert!(cluster.leader().is_some());
        assert!(cluster.leaders_by_term().values().all(|&n| n <= 1));
    }

    #[test]
    fn leader_replicates_to_followers() {
        let mut cluster = elected(3, 0);

        let index = cluster.submit(0, "x", "1");
        // Bootstrap config, then the leader's blank entry.
        assert_eq!(index, Some(LogIndex::from(3)));
        cluster.deliver_all();

        for i in 0..3 {
            assert_eq!(
                cluster.runtime(i).replica().storage().last_log_index().unwrap(),
                LogIndex::from(3)
            );
        }
        assert_eq!(cluster.runtime(0).replica().commit_index(), LogIndex::from(3));
        assert_eq!(cluster.store(0).get(b"x").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn followers_commit_on_leader_heartbeat() {
        let mut cluster = elected(3, 0);
        cluster.submit(0, "y", "2");
        cluster.deliver_all();
        assert_eq!(cluster.store(1).get(b"y").unwrap(), None);

        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        for i in 1..3 {
            assert_eq!(cluster.runtime(i).replica().commit_index(), LogIndex::from(3));
            assert_eq!(cluster.store(i).get(b"y").unwrap(), Some(b"2".to_vec()));
        }
    }

    #[test]
    fn follower_cannot_submit() {
        let mut cluster = elected(3, 0);

        assert_eq!(cluster.submit(1, "k", "v"), None);
    }

    #[test]
    fn new_leader_overwrites_uncommitted_entries() {
        let mut cluster = elected(3, 0);
        cluster.isolate(0);
        // Never reaches a majority.
        cluster.submit(0, "lost", "1");
        cluster.deliver_all();

        cluster.election_timeout(1);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(1));
        cluster.submit(1, "kept", "2");
        cluster.deliver_all();

        cluster.heal(0);
        cluster.settle();

        assert_eq!(cluster.runtime(0).replica().role_kind(), RoleKind::Follower);
        for i in 0..3 {
            assert_eq!(cluster.store(i).get(b"lost").unwrap(), None);
            assert_eq!(cluster.store(i).get(b"kept").unwrap(), Some(b"2".to_vec()));
        }
    }

    #[test]
    fn lagging_follower_catches_up_from_snapshot() {
        let mut cluster = elected(3, 3);
        cluster.isolate(2);
        for i in 0..6 {
            cluster.submit(0, &format!("k{i}"), &i.to_string());
            cluster.deliver_all();
        }
        cluster.finish_snapshots();
        let leader_snapshot = cluster.runtime(0).replica().storage().snapshot_index().unwrap();
        assert!(leader_snapshot > LogIndex::from(2));

        cluster.heal(2);
        cluster.settle();
        cluster.settle();

        assert_eq!(cluster.store(2).entries().unwrap(), cluster.store(0).entries().unwrap());
        assert_eq!(
            cluster.runtime(2).replica().commit_index(),
            cluster.runtime(0).replica().commit_index()
        );
        assert_eq!(cluster.runtime(2).replica().config().len(), 3);
    }

    #[test]
    fn large_snapshot_reaches_lagging_follower_in_chunks() {
        let mut cluster = elected(3, 3);
        cluster.isolate(2);
        let value = "x".repeat(1 << 20);
        for i in 0..4 {
            cluster.submit(0, &format!("big{i}"), &value);
            cluster.deliver_all();
        }
        cluster.finish_snapshots();
        for i in 0..3 {
            cluster.submit(0, &format!("small{i}"), "1");
            cluster.deliver_all();
        }
        cluster.finish_snapshots();

        let (_, blob, _) = cluster
            .runtime(0)
            .replica()
            .storage()
            .snapshot_chunk(0, usize::MAX)
            .unwrap()
            .expect("leader has a snapshot");
        assert!(blob.len() > 4 << 20);
        assert!(blob.len() < (4 << 20) + 4096, "snapshot is {} bytes", blob.len());

        cluster.heal(2);
        cluster.settle();
        cluster.settle();

        assert!(cluster.snapshot_chunks >= blob.len().div_ceil(SNAPSHOT_CHUNK_SIZE));
        assert_eq!(cluster.store(2).entries().unwrap(), cluster.store(0).entries().unwrap());
        assert_eq!(
            cluster.runtime(2).replica().commit_index(),
            cluster.runtime(0).replica().commit_index()
        );
    }

    #[test]
    fn leader_adds_member_and_replicates_to_it() {
        let mut cluster = elected(3, 0);
        cluster.settle();
        let newcomer = cluster.add_node();

        assert!(matches!(
            cluster.add_member(0, member(4)),
            MembershipChange::Proposed { .. }
        ));
        cluster.deliver_all();
        cluster.settle();

        assert_eq!(cluster.runtime(0).replica().config().len(), 4);
        assert!(cluster.runtime(newcomer).replica().config().contains(NodeId::from(4)));

        cluster.submit(0, "after", "join");
        cluster.settle();
        assert_eq!(
            cluster.store(newcomer).get(b"after").unwrap(),
            Some(b"join".to_vec())
        );
    }

    #[test]
    fn replicas_converge_to_identical_state() {
        let mut cluster = elected(5, 4);
        for i in 0..20u32 {
            let key = format!("key{}", i % 7);
            cluster.submit(0, &key, &format!("v{i}"));
            if i % 3 == 0 {
                cluster.deliver_all();
            }
        }
        cluster.finish_snapshots();
        cluster.settle();

        let expected = cluster.store(0).entries().unwrap();
        assert_eq!(expected.len(), 7);
        for i in 1..5 {
            assert_eq!(cluster.store(i).entries().unwrap(), expected);
        }
    }
}
