use tracing::{debug, info};

use crate::action::Action;
use crate::state::{Candidate, Follower, Leader, RoleKind};
use crate::storage::{Storage, StorageError};
use crate::types::{
    AppendEntries, AppendEntriesResponse, ClusterConfig, EntryPayload, InstallSnapshot,
    InstallSnapshotResponse, LogEntry, LogIndex, Member, Message, NodeId, RequestVote,
    RequestVoteResponse, SnapshotMeta, Term,
};

/// Upper bound on entries carried by one AppendEntries message.
pub const MAX_ENTRIES_PER_MESSAGE: usize = 64;

/// Snapshot bytes carried by one InstallSnapshot message.
pub const SNAPSHOT_CHUNK_SIZE: usize = 1024 * 1024;

/// Server role with associated state.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// Outcome of asking the replica to add a voter.
pub enum MembershipChange {
    Proposed { index: LogIndex, actions: Vec<Action> },
    AlreadyMember,
    NotLeader,
    /// An earlier configuration entry has not committed yet.
    InProgress,
}

/// A snapshot being received from the leader, chunk by chunk.
struct IncomingSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// A Raft replica: the protocol state machine of one server. It never touches
/// the network or clocks; every input returns the actions to perform.
pub struct Replica<S> {
    id: NodeId,
    storage: S,
    current_term: Term,
    voted_for: Option<NodeId>,
    config: ClusterConfig,
    config_index: LogIndex,
    commit_index: LogIndex,
    last_applied: LogIndex,
    role: Role,
    incoming: Option<IncomingSnapshot>,
}

impl<S: Storage> Replica<S> {
    /// Restore a replica from storage. Starts as follower with no known leader.
    pub fn new(id: NodeId, storage: S) -> Result<Self, StorageError> {
        let snapshot_index = storage.snapshot_index()?;
        let mut replica = Self {
            id,
            current_term: storage.current_term()?,
            voted_for: storage.voted_for()?,
            storage,
            config: ClusterConfig::default(),
            config_index: LogIndex::ZERO,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            role: Role::Follower(Follower::new()),
            incoming: None,
        };
        replica.reload_config()?;
        Ok(replica)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_kind(&self) -> RoleKind {
        match self.role {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The leader this replica currently believes in, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader(_) => Some(self.id),
            Role::Follower(follower) => follower.leader_id,
            Role::Candidate(_) => None,
        }
    }

    /// The believed leader's member record, if it is in the configuration.
    pub fn leader(&self) -> Option<&Member> {
        self.leader_id().and_then(|id| self.config.member(id))
    }

    fn peers(&self) -> Vec<NodeId> {
        self.config.voter_ids().filter(|&id| id != self.id).collect()
    }

    fn last_log_term(&self) -> Result<Term, StorageError> {
        let last = self.storage.last_log_index()?;
        Ok(self.storage.term_at(last)?.unwrap_or_default())
    }

    /// The configuration in effect at `limit`: the latest configuration entry
    /// at or before it, falling back to the snapshot's.
    pub fn config_at(&self, limit: LogIndex) -> Result<ClusterConfig, StorageError> {
        Ok(self.scan_config(Some(limit))?.0)
    }

    fn scan_config(&self, limit: Option<LogIndex>) -> Result<(ClusterConfig, LogIndex), StorageError> {
        let (mut config, mut config_index) = match self.storage.snapshot_meta()? {
            Some(meta) => (meta.config, meta.last_index),
            None => (ClusterConfig::default(), LogIndex::ZERO),
        };
        let first = self.storage.snapshot_index()?.next();
        for (i, entry) in self.storage.entries_from(first, usize::MAX)?.into_iter().enumerate() {
            let index = first.advance(i);
            if limit.is_some_and(|limit| index > limit) {
                break;
            }
            if let EntryPayload::Config(next) = entry.payload {
                config = next;
                config_index = index;
            }
        }
        Ok((config, config_index))
    }

    // §6: a server uses the latest configuration in its log, committed or not.
    fn reload_config(&mut self) -> Result<(), StorageError> {
        let (config, config_index) = self.scan_config(None)?;
        if config != self.config {
            debug!(node = %self.id, members = config.len(), at = %config_index, "configuration changed");
        }
        self.config = config;
        self.config_index = config_index;
        Ok(())
    }

    fn persist_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<(), StorageError> {
        if term != self.current_term {
            self.storage.set_current_term(term)?;
            self.current_term = term;
        }
        if vote != self.voted_for {
            self.storage.set_voted_for(vote)?;
            self.voted_for = vote;
        }
        Ok(())
    }

    // §5.1: if a server sees a larger term it updates its own and reverts to follower.
    fn step_down(&mut self, term: Term) -> Result<(), StorageError> {
        if term > self.current_term {
            self.persist_term(term, None)?;
        }
        if self.is_leader() {
            info!(node = %self.id, term = %self.current_term, "stepping down as leader");
        }
        if !matches!(self.role, Role::Follower(_)) {
            self.role = Role::Follower(Follower::new());
        }
        Ok(())
    }

    /// Seed the configuration of a brand-new cluster. Returns false without
    /// changing anything if this replica already has state.
    pub fn bootstrap(&mut self, config: ClusterConfig) -> Result<bool, StorageError> {
        if !self.config.is_empty()
            || self.storage.last_log_index()? > LogIndex::ZERO
            || self.current_term > Term::ZERO
        {
            return Ok(false);
        }
        let term = Term::from(1);
        self.persist_term(term, None)?;
        self.storage.append(LogEntry {
            term,
            payload: EntryPayload::Config(config),
        })?;
        self.reload_config()?;
        info!(node = %self.id, members = self.config.len(), "bootstrapped cluster configuration");
        Ok(true)
    }

    /// Called when election timer fires. Follower/Candidate starts new election.
    pub fn election_timeout(&mut self) -> Result<Vec<Action>, StorageError> {
        // A server that is not a voter in its own configuration never campaigns.
        if self.is_leader() || !self.config.contains(self.id) {
            return Ok(vec![Action::ResetElectionTimer]);
        }
        self.start_election()
    }

    fn start_election(&mut self) -> Result<Vec<Action>, StorageError> {
        let term = self.current_term.increment();
        self.persist_term(term, Some(self.id))?;

        let candidate = Candidate::new(self.id);
        if candidate.has_majority(&self.config) {
            let mut actions = self.become_leader()?;
            actions.push(Action::ResetElectionTimer);
            return Ok(actions);
        }
        self.role = Role::Candidate(candidate);
        debug!(node = %self.id, term = %term, "starting election");

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.storage.last_log_index()?,
            last_log_term: self.last_log_term()?,
        };

        let mut actions: Vec<Action> = self
            .peers()
            .into_iter()
            .map(|peer| Action::Send {
                to: peer,
                message: Message::RequestVote(request.clone()),
            })
            .collect();
        actions.push(Action::ResetElectionTimer);
        Ok(actions)
    }

    // Figure 2, Rules for Servers (Leaders): upon election send initial empty
    // AppendEntries. §8: a blank entry from the new term lets earlier entries commit.
    fn become_leader(&mut self) -> Result<Vec<Action>, StorageError> {
        let last = self.storage.last_log_index()?;
        self.role = Role::Leader(Leader::new(&self.peers(), last));
        info!(node = %self.id, term = %self.current_term, "became leader");

        self.storage.append(LogEntry {
            term: self.current_term,
            payload: EntryPayload::Blank,
        })?;
        self.advance_commit()?;

        let mut actions = self.broadcast()?;
        actions.push(Action::ResetHeartbeatTimer);
        Ok(actions)
    }

    /// Called when the heartbeat timer fires. Leaders replicate to every peer.
    pub fn heartbeat_timeout(&mut self) -> Result<Vec<Action>, StorageError> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }
        let mut actions = self.broadcast()?;
        actions.push(Action::ResetHeartbeatTimer);
        Ok(actions)
    }

    fn broadcast(&mut self) -> Result<Vec<Action>, StorageError> {
        let mut actions = Vec::new();
        for peer in self.peers() {
            if let Some(action) = self.replicate_to(peer)? {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    /// Build the next replication message for `peer`: AppendEntries from its
    /// next_index, or InstallSnapshot when that index has been compacted away.
    fn replicate_to(&mut self, peer: NodeId) -> Result<Option<Action>, StorageError> {
        let last = self.storage.last_log_index()?;
        let next = match &mut self.role {
            Role::Leader(leader) => {
                leader.track(peer, last);
                leader.next_index_for(peer).unwrap_or(last.next())
            }
            _ => return Ok(None),
        };

        let prev = next.prev().unwrap_or(LogIndex::ZERO);
        let prev_term = self.storage.term_at(prev)?;
        if next <= self.storage.snapshot_index()? || prev_term.is_none() {
            return self.snapshot_chunk_for(peer);
        }

        Ok(Some(Action::Send {
            to: peer,
            message: Message::AppendEntries(AppendEntries {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index: prev,
                prev_log_term: prev_term.unwrap_or_default(),
                entries: self.storage.entries_from(next, MAX_ENTRIES_PER_MESSAGE)?,
                leader_commit: self.commit_index,
            }),
        }))
    }

    /// The next chunk of the latest snapshot for `peer`, resuming after the
    /// bytes it has acknowledged.
    fn snapshot_chunk_for(&self, peer: NodeId) -> Result<Option<Action>, StorageError> {
        let Role::Leader(leader) = &self.role else {
            return Ok(None);
        };
        let offset = leader.snapshot_offset(peer, self.storage.snapshot_index()?);
        let chunk = self.storage.snapshot_chunk(offset, SNAPSHOT_CHUNK_SIZE)?;
        Ok(chunk.map(|(meta, data, done)| Action::Send {
            to: peer,
            message: Message::InstallSnapshot(InstallSnapshot {
                term: self.current_term,
                leader_id: self.id,
                meta,
                offset,
                data,
                done,
            }),
        }))
    }

    // §5.3, §5.4.2: commit the highest index replicated on a majority, but only
    // by counting replicas of an entry from the leader's current term.
    fn advance_commit(&mut self) -> Result<(), StorageError> {
        let Role::Leader(leader) = &self.role else {
            return Ok(());
        };
        let mut candidate = self.storage.last_log_index()?;
        while candidate > self.commit_index {
            if self.storage.term_at(candidate)? != Some(self.current_term) {
                // Terms never decrease along the log; nothing earlier qualifies.
                break;
            }
            let replicated = self
                .config
                .voter_ids()
                .filter(|&id| {
                    id == self.id || leader.match_index_for(id).is_some_and(|m| m >= candidate)
                })
                .count();
            if replicated >= self.config.quorum() {
                debug!(node = %self.id, commit = %candidate, "advanced commit index");
                self.commit_index = candidate;
                break;
            }
            candidate = candidate.prev().unwrap_or(LogIndex::ZERO);
        }
        Ok(())
    }

    /// Append a new entry if this replica is leader. Returns its index and the
    /// replication messages to send, or None when not leader.
    pub fn submit(
        &mut self,
        payload: EntryPayload,
    ) -> Result<Option<(LogIndex, Vec<Action>)>, StorageError> {
        if !self.is_leader() {
            return Ok(None);
        }
        let is_config = matches!(payload, EntryPayload::Config(_));
        let index = self.storage.append(LogEntry {
            term: self.current_term,
            payload,
        })?;
        if is_config {
            self.reload_config()?;
        }
        self.advance_commit()?;
        let actions = self.broadcast()?;
        Ok(Some((index, actions)))
    }

    /// Propose adding `member` as a voter. One configuration change may be
    /// outstanding at a time.
    pub fn add_member(&mut self, member: Member) -> Result<MembershipChange, StorageError> {
        if !self.is_leader() {
            return Ok(MembershipChange::NotLeader);
        }
        if self.config.member(member.id) == Some(&member) {
            return Ok(MembershipChange::AlreadyMember);
        }
        if self.config_index > self.commit_index {
            return Ok(MembershipChange::InProgress);
        }
        info!(node = %self.id, new_member = %member.id, "proposing configuration change");
        let next = self.config.with_member(member);
        match self.submit(EntryPayload::Config(next))? {
            Some((index, actions)) => Ok(MembershipChange::Proposed { index, actions }),
            None => Ok(MembershipChange::NotLeader),
        }
    }

    /// Handle an incoming message and return the resulting actions.
    pub fn handle_message(&mut self, from: NodeId, message: Message) -> Result<Vec<Action>, StorageError> {
        match message {
            Message::RequestVote(req) => self.handle_request_vote(from, req),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp),
            Message::AppendEntries(req) => self.handle_append_entries(from, req),
            Message::AppendEntriesResponse(resp) => self.handle_append_entries_response(from, resp),
            Message::InstallSnapshot(req) => self.handle_install_snapshot(from, req),
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, resp)
            }
        }
    }

    // §5.2, §5.4.1: grant at most one vote per term, and only to a candidate
    // whose log is at least as up-to-date as ours.
    fn handle_request_vote(&mut self, from: NodeId, req: RequestVote) -> Result<Vec<Action>, StorageError> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        let ours = (self.last_log_term()?, self.storage.last_log_index()?);
        let up_to_date = (req.last_log_term, req.last_log_index) >= ours;
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let vote_granted = req.term == self.current_term && can_vote && up_to_date;

        let mut actions = Vec::new();
        if vote_granted {
            self.persist_term(self.current_term, Some(req.candidate_id))?;
            actions.push(Action::ResetElectionTimer);
        }
        actions.push(Action::Send {
            to: from,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                vote_granted,
            }),
        });
        Ok(actions)
    }

    fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
    ) -> Result<Vec<Action>, StorageError> {
        if resp.term > self.current_term {
            self.step_down(resp.term)?;
            return Ok(Vec::new());
        }
        let won = match &mut self.role {
            Role::Candidate(candidate) if resp.term == self.current_term && resp.vote_granted => {
                candidate.record_vote(from);
                candidate.has_majority(&self.config)
            }
            _ => false,
        };
        if won {
            self.become_leader()
        } else {
            Ok(Vec::new())
        }
    }

    /// Accept the sender as leader for `term`, stepping down if needed.
    fn follow(&mut self, term: Term, leader_id: NodeId) -> Result<(), StorageError> {
        if term > self.current_term || !matches!(self.role, Role::Follower(_)) {
            self.step_down(term)?;
        }
        if let Role::Follower(follower) = &mut self.role {
            if follower.leader_id != Some(leader_id) {
                debug!(node = %self.id, leader = %leader_id, term = %term, "following leader");
            }
            follower.set_leader(leader_id);
        }
        Ok(())
    }

    // Figure 2, AppendEntries RPC receiver implementation.
    fn handle_append_entries(&mut self, from: NodeId, req: AppendEntries) -> Result<Vec<Action>, StorageError> {
        if req.term < self.current_term {
            return Ok(vec![self.append_reply(from, false, self.storage.last_log_index()?)]);
        }
        self.follow(req.term, req.leader_id)?;
        let mut actions = vec![Action::ResetElectionTimer];

        // Anything at or before the snapshot is committed, hence matches.
        let matches = req.prev_log_index <= self.storage.snapshot_index()?
            || self.storage.term_at(req.prev_log_index)? == Some(req.prev_log_term);
        if !matches {
            actions.push(self.append_reply(from, false, self.storage.last_log_index()?));
            return Ok(actions);
        }

        let count = req.entries.len();
        let has_config = req.entries.iter().any(|e| e.config().is_some());
        let truncated = self.storage.append_entries(req.prev_log_index, req.entries)?;
        if truncated || has_config {
            self.reload_config()?;
        }

        let match_index = req.prev_log_index.advance(count);
        if req.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(req.leader_commit.min(match_index));
        }
        actions.push(self.append_reply(from, true, match_index));
        Ok(actions)
    }

    fn append_reply(&self, to: NodeId, success: bool, match_index: LogIndex) -> Action {
        Action::Send {
            to,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index,
            }),
        }
    }

    fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> Result<Vec<Action>, StorageError> {
        if resp.term > self.current_term {
            self.step_down(resp.term)?;
            return Ok(Vec::new());
        }
        if resp.term < self.current_term {
            return Ok(Vec::new());
        }
        match &mut self.role {
            Role::Leader(leader) if resp.success => leader.record_success(from, resp.match_index),
            Role::Leader(leader) => leader.record_failure(from, resp.match_index),
            _ => return Ok(Vec::new()),
        }
        if resp.success {
            self.advance_commit()?;
        }
        self.catch_up(from, !resp.success)
    }

    /// Send `peer` more entries right away if it is still behind.
    fn catch_up(&mut self, peer: NodeId, force: bool) -> Result<Vec<Action>, StorageError> {
        let last = self.storage.last_log_index()?;
        let behind = match &self.role {
            Role::Leader(leader) => leader.match_index_for(peer).is_some_and(|m| m < last),
            _ => false,
        };
        if !(force || behind) {
            return Ok(Vec::new());
        }
        Ok(self.replicate_to(peer)?.into_iter().collect())
    }

    // §7: InstallSnapshot RPC receiver implementation. Chunks are accepted
    // strictly in order; anything else is answered with the offset we hold.
    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        req: InstallSnapshot,
    ) -> Result<Vec<Action>, StorageError> {
        let last_index = req.meta.last_index;
        if req.term < self.current_term {
            return Ok(vec![self.snapshot_reply(from, last_index, 0, false)]);
        }
        self.follow(req.term, req.leader_id)?;
        let mut actions = vec![Action::ResetElectionTimer];

        if last_index <= self.commit_index {
            self.incoming = None;
            let end = req.offset + req.data.len() as u64;
            actions.push(self.snapshot_reply(from, last_index, end, true));
            return Ok(actions);
        }

        let mut incoming = match self.incoming.take() {
            Some(incoming) if incoming.meta.last_index == last_index => incoming,
            _ => IncomingSnapshot {
                meta: req.meta,
                data: Vec::new(),
            },
        };
        let held = incoming.data.len() as u64;
        if req.offset != held {
            debug!(node = %self.id, offset = req.offset, held, "out of order snapshot chunk");
            if held > 0 {
                self.incoming = Some(incoming);
            }
            actions.push(self.snapshot_reply(from, last_index, held, false));
            return Ok(actions);
        }
        incoming.data.extend_from_slice(&req.data);
        let held = incoming.data.len() as u64;
        if !req.done {
            self.incoming = Some(incoming);
            actions.push(self.snapshot_reply(from, last_index, held, false));
            return Ok(actions);
        }

        let IncomingSnapshot { meta, data } = incoming;
        info!(
            node = %self.id,
            index = %last_index,
            term = %meta.last_term,
            bytes = held,
            "installing snapshot from leader"
        );
        self.storage.save_snapshot(meta.clone(), data.clone())?;
        self.commit_index = last_index;
        self.last_applied = last_index;
        self.reload_config()?;
        actions.push(Action::RestoreSnapshot { meta, data });
        actions.push(self.snapshot_reply(from, last_index, held, true));
        Ok(actions)
    }

    fn snapshot_reply(&self, to: NodeId, last_index: LogIndex, next_offset: u64, done: bool) -> Action {
        Action::Send {
            to,
            message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.current_term,
                last_index,
                next_offset,
                done,
            }),
        }
    }

    fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        resp: InstallSnapshotResponse,
    ) -> Result<Vec<Action>, StorageError> {
        if resp.term > self.current_term {
            self.step_down(resp.term)?;
            return Ok(Vec::new());
        }
        if resp.term < self.current_term {
            return Ok(Vec::new());
        }
        let Role::Leader(leader) = &mut self.role else {
            return Ok(Vec::new());
        };
        if resp.done {
            leader.record_success(from, resp.last_index);
            self.advance_commit()?;
            return self.catch_up(from, false);
        }
        if leader.record_snapshot_progress(from, resp.last_index, resp.next_offset) {
            return Ok(self.snapshot_chunk_for(from)?.into_iter().collect());
        }
        Ok(Vec::new())
    }

    /// The next committed entry waiting to be applied, without consuming it.
    pub fn next_to_apply(&self) -> Result<Option<(LogIndex, LogEntry)>, StorageError> {
        if self.last_applied >= self.commit_index {
            return Ok(None);
        }
        let index = self.last_applied.next();
        Ok(self.storage.entry(index)?.map(|entry| (index, entry)))
    }

    /// Record that the entry at `index` has been applied.
    pub fn advance_applied(&mut self, index: LogIndex) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }

    /// After a restart, skip entries the state machine reports as already
    /// applied. Only applied entries were ever committed, so commit moves too.
    pub fn resume_from(&mut self, applied: LogIndex) -> Result<(), StorageError> {
        let applied = applied.min(self.storage.last_log_index()?);
        if applied > self.last_applied {
            self.last_applied = applied;
        }
        if applied > self.commit_index {
            self.commit_index = applied;
        }
        Ok(())
    }

    /// Persist a locally built snapshot and drop the log prefix it covers.
    pub fn compact(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        if meta.last_index > self.last_applied || meta.last_index <= self.storage.snapshot_index()? {
            return Ok(());
        }
        info!(node = %self.id, index = %meta.last_index, "compacting log up to snapshot");
        self.storage.save_snapshot(meta, data)
    }
}
