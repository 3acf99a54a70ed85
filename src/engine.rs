use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

use crate::action::Action;
use crate::fsm::StateMachine;
use crate::replica::MembershipChange;
use crate::runtime::{Event, Runtime, RuntimeError};
use crate::state::RoleKind;
use crate::storage::Storage;
use crate::transport::{Incoming, Transport};
use crate::types::{ClusterConfig, LogIndex, Member, NodeId, Term};

/// Longest the event loop blocks on the network before re-checking timers and requests.
const MAX_POLL_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Why a proposal did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposeError {
    #[error("not the leader")]
    NotLeader,
    #[error("timed out waiting for commit")]
    Timeout,
    /// The entry may or may not commit later.
    #[error("leadership lost before the entry committed")]
    LeadershipLost,
    #[error("cluster is already configured")]
    AlreadyConfigured,
    #[error("a membership change is already in progress")]
    ChangeInProgress,
    #[error("consensus engine has stopped")]
    Halted,
    #[error("entry committed but was rejected: {0}")]
    Apply(String),
}

type Reply = oneshot::Sender<Result<(), ProposeError>>;

/// Requests from the async side to the event loop.
enum Request {
    Propose { data: Vec<u8>, reply: Reply },
    Bootstrap { config: ClusterConfig, reply: Reply },
    AddVoter { member: Member, reply: Reply },
}

/// A client waiting for the entry it proposed at some index.
struct Pending {
    term: Term,
    reply: Reply,
}

/// Point-in-time view of the engine, published after every step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<Member>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub members: Vec<Member>,
    /// Proposals still waiting for their entry to be applied.
    pub pending: usize,
    /// Set once the engine has stopped on an unrecoverable error.
    pub fault: Option<String>,
}

/// The consensus event loop: owns the runtime and transport on a dedicated
/// thread, feeding it timers, peer messages and client requests.
pub struct Engine<S, M> {
    runtime: Runtime<S, M>,
    transport: Transport,
    requests: mpsc::Receiver<Request>,
    pending: HashMap<LogIndex, Pending>,
    /// Consensus addresses learned from incoming envelopes, for peers that are
    /// not (yet) in the configuration.
    addresses: HashMap<NodeId, SocketAddr>,
    status: watch::Sender<Status>,
}

impl<S, M> Engine<S, M>
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
{
    /// Start the event loop on its own thread.
    pub fn spawn(runtime: Runtime<S, M>, transport: Transport) -> Result<EngineHandle, EngineError> {
        let id = runtime.replica().id();
        let (tx, rx) = mpsc::channel();
        let (status_tx, status_rx) = watch::channel(snapshot_status(&runtime, 0, None));
        let engine = Engine {
            runtime,
            transport,
            requests: rx,
            pending: HashMap::new(),
            addresses: HashMap::new(),
            status: status_tx,
        };
        thread::Builder::new()
            .name(format!("raft-{}", id.get()))
            .spawn(move || engine.run())?;
        Ok(EngineHandle {
            id,
            requests: tx,
            status: status_rx,
        })
    }

    fn run(mut self) {
        let id = self.runtime.replica().id();
        info!(node = %id, addr = %self.transport.local_addr(), "consensus engine started");
        match self.run_loop() {
            Ok(()) => debug!(node = %id, "consensus engine shut down"),
            Err(err) => {
                error!(node = %id, error = %err, "consensus engine halted");
                self.halt(err.to_string());
            }
        }
    }

    /// Returns when every handle has been dropped, or on error.
    fn run_loop(&mut self) -> Result<(), EngineError> {
        loop {
            if !self.drain_requests()? {
                return Ok(());
            }
            self.runtime.poll_snapshot()?;

            // Drain fired timers before blocking; back-to-back timeouts must not be skipped.
            if let Some(event) = self.runtime.poll_timers() {
                let actions = self.runtime.handle(event)?;
                self.dispatch(actions);
                self.after_step();
                continue;
            }

            // Block until the next timer deadline or an incoming message, whichever comes first.
            let wait = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_WAIT);

            if let Some(Incoming {
                from,
                from_addr,
                message,
            }) = self.transport.recv_timeout(wait)
            {
                self.addresses.insert(from, from_addr);
                let actions = self.runtime.handle(Event::Message { from, message })?;
                self.dispatch(actions);
                self.after_step();
            }
        }
    }

    /// Handle queued client requests. False once all handles are gone.
    fn drain_requests(&mut self) -> Result<bool, EngineError> {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.handle_request(request)?,
                Err(mpsc::TryRecvError::Empty) => return Ok(true),
                Err(mpsc::TryRecvError::Disconnected) => return Ok(false),
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<(), EngineError> {
        match request {
            Request::Propose { data, reply } => match self.runtime.submit(data)? {
                Some((index, actions)) => self.track(index, reply, actions),
                None => {
                    let _ = reply.send(Err(ProposeError::NotLeader));
                }
            },
            Request::Bootstrap { config, reply } => {
                let result = if self.runtime.bootstrap(config)? {
                    Ok(())
                } else {
                    Err(ProposeError::AlreadyConfigured)
                };
                let _ = reply.send(result);
                self.publish_status();
            }
            Request::AddVoter { member, reply } => match self.runtime.add_member(member)? {
                MembershipChange::Proposed { index, actions } => self.track(index, reply, actions),
                MembershipChange::AlreadyMember => {
                    let _ = reply.send(Ok(()));
                }
                MembershipChange::NotLeader => {
                    let _ = reply.send(Err(ProposeError::NotLeader));
                }
                MembershipChange::InProgress => {
                    let _ = reply.send(Err(ProposeError::ChangeInProgress));
                }
            },
        }
        Ok(())
    }

    fn track(&mut self, index: LogIndex, reply: Reply, actions: Vec<Action>) {
        let term = self.runtime.replica().current_term();
        self.pending.insert(index, Pending { term, reply });
        self.dispatch(actions);
        self.after_step();
    }

    fn address_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.runtime
            .replica()
            .config()
            .member(id)
            .map(|m| m.raft_addr)
            .or_else(|| self.addresses.get(&id).copied())
    }

    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            if let Action::Send { to, message } = action {
                match self.address_of(to) {
                    Some(addr) => self.transport.send(addr, message),
                    None => debug!(peer = %to, "no address for peer, dropping message"),
                }
            }
        }
    }

    /// Resolve waiting clients and publish the new status.
    fn after_step(&mut self) {
        for applied in self.runtime.take_applied() {
            let Some(pending) = self.pending.remove(&applied.index) else {
                continue;
            };
            let result = if applied.term != pending.term {
                // Another leader's entry landed at this index.
                Err(ProposeError::LeadershipLost)
            } else {
                applied.result.map_err(ProposeError::Apply)
            };
            let _ = pending.reply.send(result);
        }

        // Callers that gave up waiting have dropped their receiver.
        self.pending.retain(|_, pending| !pending.reply.is_closed());

        if !self.pending.is_empty() && !self.runtime.replica().is_leader() {
            debug!(count = self.pending.len(), "failing proposals after losing leadership");
            for (_, pending) in self.pending.drain() {
                let _ = pending.reply.send(Err(ProposeError::LeadershipLost));
            }
        }

        self.publish_status();
    }

    fn publish_status(&self) {
        let next = snapshot_status(&self.runtime, self.pending.len(), None);
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn halt(&mut self, reason: String) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ProposeError::Halted));
        }
        let status = snapshot_status(&self.runtime, 0, Some(reason));
        self.status.send_replace(status);
    }
}

fn snapshot_status<S: Storage, M: StateMachine>(
    runtime: &Runtime<S, M>,
    pending: usize,
    fault: Option<String>,
) -> Status {
    let replica = runtime.replica();
    Status {
        id: replica.id(),
        role: replica.role_kind(),
        term: replica.current_term(),
        leader: replica.leader().cloned(),
        commit_index: replica.commit_index(),
        applied_index: replica.last_applied(),
        members: replica.config().members().to_vec(),
        pending,
        fault,
    }
}

/// Cloneable handle to a running engine, usable from async code.
#[derive(Clone)]
pub struct EngineHandle {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<Status>,
}

impl EngineHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Append `data` to the log and wait until it is applied or `timeout` elapses.
    /// A timed-out proposal is not withdrawn and may still commit.
    pub async fn propose(&self, data: Vec<u8>, timeout: Duration) -> Result<(), ProposeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Propose { data, reply })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProposeError::Halted),
            Err(_) => Err(ProposeError::Timeout),
        }
    }

    /// Seed the configuration of a new cluster. Fails with
    /// `AlreadyConfigured` if this node already has state.
    pub async fn bootstrap(&self, config: ClusterConfig) -> Result<(), ProposeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Bootstrap { config, reply })?;
        rx.await.unwrap_or(Err(ProposeError::Halted))
    }

    /// Add `member` as a voter, waiting until the change is applied.
    pub async fn add_voter(&self, member: Member, timeout: Duration) -> Result<(), ProposeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::AddVoter { member, reply })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProposeError::Halted),
            Err(_) => Err(ProposeError::Timeout),
        }
    }

    /// The leader as last seen by this node. May be stale.
    pub fn current_leader(&self) -> Option<Member> {
        self.status.borrow().leader.clone()
    }

    pub fn local_role(&self) -> RoleKind {
        self.status.borrow().role
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// A receiver that is notified whenever the status changes.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    fn send(&self, request: Request) -> Result<(), ProposeError> {
        self.requests.send(request).map_err(|_| ProposeError::Halted)
    }
}
