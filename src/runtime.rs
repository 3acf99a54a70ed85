use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::fsm::{FsmError, SnapshotHandle, StateMachine};
use crate::replica::{MembershipChange, Replica};
use crate::storage::{Storage, StorageError};
use crate::types::{
    ClusterConfig, EntryPayload, LogIndex, Member, Message, NodeId, SnapshotMeta, Term,
};

/// Error type for the runtime. Any of these leaves the node unable to make
/// progress safely.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("state machine: {0}")]
    StateMachine(#[from] FsmError),
}

/// Events that drive the runtime.
pub enum Event {
    ElectionTimeout,
    HeartbeatTimeout,
    Message { from: NodeId, message: Message },
}

/// Timer configuration.
#[derive(Clone, Debug)]
pub struct TimerConfig {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

/// Result of applying one committed entry.
#[derive(Debug)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    /// `Err` carries the reason a command was rejected by the state machine.
    pub result: Result<(), String>,
}

/// A snapshot being serialized on a background thread.
struct SnapshotJob {
    meta: SnapshotMeta,
    cancel: Arc<AtomicBool>,
    rx: mpsc::Receiver<Result<Vec<u8>, FsmError>>,
}

/// Runtime that wraps a replica with timer management, applies committed
/// entries to a state machine and compacts the log.
pub struct Runtime<S, M> {
    replica: Replica<S>,
    fsm: M,
    config: TimerConfig,
    snapshot_threshold: u64,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    snapshot_job: Option<SnapshotJob>,
    applied: Vec<Applied>,
}

impl<S: Storage, M: StateMachine> Runtime<S, M> {
    /// Wrap `replica`, skipping entries `fsm` already holds. A
    /// `snapshot_threshold` of zero disables compaction.
    pub fn new(
        mut replica: Replica<S>,
        mut fsm: M,
        config: TimerConfig,
        snapshot_threshold: u64,
    ) -> Result<Self, RuntimeError> {
        let mut applied = fsm.applied_index()?;
        if applied < replica.storage().snapshot_index()? {
            if let Some((meta, data)) = replica.storage().snapshot()? {
                info!(node = %replica.id(), index = %meta.last_index, "state machine behind log snapshot, restoring");
                fsm.restore(meta.last_index, &mut &data[..])?;
                applied = meta.last_index;
            }
        }
        replica.resume_from(applied)?;
        if applied > LogIndex::ZERO {
            debug!(node = %replica.id(), applied = %applied, "resuming after applied entries");
        }
        let now = Instant::now();
        Ok(Self {
            replica,
            fsm,
            election_deadline: now + config.election_timeout,
            heartbeat_deadline: now + config.heartbeat_interval,
            config,
            snapshot_threshold,
            snapshot_job: None,
            applied: Vec::new(),
        })
    }

    pub fn replica(&self) -> &Replica<S> {
        &self.replica
    }

    pub fn fsm(&self) -> &M {
        &self.fsm
    }

    /// Process an event and return actions to execute.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, RuntimeError> {
        let actions = match event {
            Event::ElectionTimeout => self.replica.election_timeout()?,
            Event::HeartbeatTimeout => self.replica.heartbeat_timeout()?,
            Event::Message { from, message } => self.replica.handle_message(from, message)?,
        };
        self.finish(actions)
    }

    /// Seed a new cluster. False if the replica already had state.
    pub fn bootstrap(&mut self, config: ClusterConfig) -> Result<bool, RuntimeError> {
        Ok(self.replica.bootstrap(config)?)
    }

    /// Submit a client command. Returns the log index and actions if leader.
    pub fn submit(&mut self, data: Vec<u8>) -> Result<Option<(LogIndex, Vec<Action>)>, RuntimeError> {
        match self.replica.submit(EntryPayload::Command(data))? {
            Some((index, actions)) => Ok(Some((index, self.finish(actions)?))),
            None => Ok(None),
        }
    }

    /// Propose adding a voter. Proposal actions have already been processed.
    pub fn add_member(&mut self, member: Member) -> Result<MembershipChange, RuntimeError> {
        match self.replica.add_member(member)? {
            MembershipChange::Proposed { index, actions } => Ok(MembershipChange::Proposed {
                index,
                actions: self.finish(actions)?,
            }),
            other => Ok(other),
        }
    }

    /// Entries applied since the last call, in log order.
    pub fn take_applied(&mut self) -> Vec<Applied> {
        std::mem::take(&mut self.applied)
    }

    /// §5.2: if election timeout elapses without receiving AppendEntries or granting a vote,
    /// the server starts an election. Leaders suppress elections by sending heartbeats
    /// within each interval. Timeouts should be randomized in [T, 2T] to avoid split votes.
    pub fn poll_timers(&self) -> Option<Event> {
        let now = Instant::now();

        if now >= self.election_deadline {
            return Some(Event::ElectionTimeout);
        }

        if self.replica.is_leader() && now >= self.heartbeat_deadline {
            return Some(Event::HeartbeatTimeout);
        }

        None
    }

    /// Time until next timer fires.
    pub fn next_deadline(&self) -> Instant {
        if self.replica.is_leader() {
            self.election_deadline.min(self.heartbeat_deadline)
        } else {
            self.election_deadline
        }
    }

    /// Collect a finished background snapshot and compact the log with it.
    pub fn poll_snapshot(&mut self) -> Result<(), RuntimeError> {
        let Some(job) = self.snapshot_job.take() else {
            return Ok(());
        };
        match job.rx.try_recv() {
            Ok(Ok(data)) => {
                info!(
                    node = %self.replica.id(),
                    index = %job.meta.last_index,
                    bytes = data.len(),
                    "snapshot written"
                );
                self.replica.compact(job.meta, data)?;
            }
            Ok(Err(FsmError::Cancelled)) => {
                debug!(node = %self.replica.id(), "snapshot cancelled");
            }
            Ok(Err(err)) => {
                warn!(node = %self.replica.id(), error = %err, "snapshot failed");
            }
            Err(mpsc::TryRecvError::Empty) => self.snapshot_job = Some(job),
            Err(mpsc::TryRecvError::Disconnected) => {
                warn!(node = %self.replica.id(), "snapshot worker exited without a result");
            }
        }
        Ok(())
    }

    /// Whether a background snapshot is currently being serialized.
    pub fn snapshot_in_progress(&self) -> bool {
        self.snapshot_job.is_some()
    }

    fn finish(&mut self, actions: Vec<Action>) -> Result<Vec<Action>, RuntimeError> {
        self.process_actions(&actions)?;
        self.apply_committed()?;
        Ok(actions)
    }

    fn process_actions(&mut self, actions: &[Action]) -> Result<(), RuntimeError> {
        for action in actions {
            match action {
                Action::ResetElectionTimer => {
                    // §5.2: randomize in [T, 2T] so nodes time out at different moments,
                    // preventing repeated split votes when multiple candidates start at once.
                    let base = self.config.election_timeout;
                    let jitter_ms = rand::rng().random_range(0..(base.as_millis() as u64).max(1));
                    self.election_deadline = Instant::now() + base + Duration::from_millis(jitter_ms);
                }
                Action::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
                }
                Action::RestoreSnapshot { meta, data } => self.restore(meta, data)?,
                Action::Send { .. } => {
                    // Sending is handled by caller.
                }
            }
        }
        Ok(())
    }

    fn restore(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), RuntimeError> {
        if let Some(job) = self.snapshot_job.take() {
            job.cancel.store(true, Ordering::Relaxed);
        }
        info!(node = %self.replica.id(), index = %meta.last_index, "restoring state machine from snapshot");
        self.fsm.restore(meta.last_index, &mut &data[..])?;
        Ok(())
    }

    // Figure 2, Rules for Servers (All Servers): if commitIndex > lastApplied, apply the
    // next entry to the state machine. §5.3: state machines process entries in log order.
    fn apply_committed(&mut self) -> Result<(), RuntimeError> {
        while let Some((index, entry)) = self.replica.next_to_apply()? {
            let result = match &entry.payload {
                EntryPayload::Command(data) => match self.fsm.apply(index, data) {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_fatal() => {
                        error!(node = %self.replica.id(), index = %index, error = %err, "state machine failed, halting");
                        return Err(err.into());
                    }
                    Err(err) => {
                        warn!(node = %self.replica.id(), index = %index, error = %err, "skipping rejected entry");
                        Err(err.to_string())
                    }
                },
                EntryPayload::Blank | EntryPayload::Config(_) => Ok(()),
            };
            self.replica.advance_applied(index);
            self.applied.push(Applied {
                index,
                term: entry.term,
                result,
            });
        }
        self.maybe_snapshot()
    }

    /// Start a background snapshot once enough entries have been applied
    /// since the last one.
    fn maybe_snapshot(&mut self) -> Result<(), RuntimeError> {
        if self.snapshot_threshold == 0 || self.snapshot_job.is_some() {
            return Ok(());
        }
        let storage = self.replica.storage();
        let applied = self.replica.last_applied();
        let since = applied.get().saturating_sub(storage.snapshot_index()?.get());
        if since < self.snapshot_threshold {
            return Ok(());
        }
        let Some(last_term) = storage.term_at(applied)? else {
            return Ok(());
        };
        let meta = SnapshotMeta {
            last_index: applied,
            last_term,
            config: self.replica.config_at(applied)?,
        };

        let handle = match self.fsm.snapshot() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(node = %self.replica.id(), error = %err, "could not capture snapshot");
                return Ok(());
            }
        };
        debug!(node = %self.replica.id(), index = %applied, "starting snapshot");

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let worker_cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            let mut buf = Vec::new();
            let result = handle.persist(&mut buf, &worker_cancel).map(|()| buf);
            let _ = tx.send(result);
        });
        self.snapshot_job = Some(SnapshotJob { meta, cancel, rx });
        Ok(())
    }
}
