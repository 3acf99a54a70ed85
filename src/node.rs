use std::iter;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::{ConfigError, NodeConfig};
use crate::engine::{Engine, EngineError, EngineHandle, ProposeError, Status};
use crate::file_storage::FileStorage;
use crate::fsm::KvStateMachine;
use crate::replica::Replica;
use crate::runtime::{Runtime, RuntimeError};
use crate::state::RoleKind;
use crate::storage::StorageError;
use crate::store::{KvStore, StoreError};
use crate::transport::{Transport, TransportError};
use crate::types::{ClusterConfig, Member, NodeId};

/// Header marking a request that has already been forwarded once.
pub const FORWARDED_HEADER: &str = "x-raftkv-forwarded";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("log storage: {0}")]
    Storage(#[from] StorageError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bootstrap failed: {0}")]
    Bootstrap(ProposeError),
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("consensus halted: {0}")]
    Halted(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// One member of the replicated store: the consensus engine, the state
/// machine it drives and the durable store behind it.
pub struct KvNode {
    config: NodeConfig,
    store: Arc<KvStore>,
    engine: EngineHandle,
    http: reqwest::Client,
}

impl KvNode {
    /// Open the store under the configured data directory and start the node.
    pub async fn open(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let store = KvStore::open(&config.store_path())?;
        Self::start(config, KvStateMachine::new(Arc::new(store))).await
    }

    /// Start consensus for `fsm`. Bootstraps a new cluster when configured to,
    /// otherwise asks the configured peers to add this node in the background.
    pub async fn start(config: NodeConfig, fsm: KvStateMachine) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let store = Arc::clone(fsm.store());

        let storage = FileStorage::open(&config.log_dir())?;
        let replica = Replica::new(config.id, storage)?;
        let runtime = Runtime::new(replica, fsm, config.timers.clone(), config.snapshot_threshold)?;
        let transport = Transport::bind(config.id, config.raft_addr)?;
        let engine = Engine::spawn(runtime, transport)?;

        let http = reqwest::Client::builder()
            .timeout(config.propose_timeout + Duration::from_secs(2))
            .build()?;

        let node = Arc::new(Self {
            config,
            store,
            engine,
            http,
        });
        info!(
            node = %node.id(),
            raft = %node.config.raft_addr,
            api = %node.config.api_addr,
            "node started"
        );

        if node.config.bootstrap {
            node.bootstrap().await?;
        } else if !node.is_member() {
            tokio::spawn(Arc::clone(&node).join_cluster());
        }
        Ok(node)
    }

    async fn bootstrap(&self) -> Result<(), NodeError> {
        let members = iter::once(self.config.local_member())
            .chain(self.config.remote_peers().cloned());
        match self.engine.bootstrap(ClusterConfig::new(members)).await {
            Ok(()) => {
                info!(node = %self.id(), "bootstrapped new cluster");
                Ok(())
            }
            Err(ProposeError::AlreadyConfigured) => {
                info!(node = %self.id(), "existing state found, skipping bootstrap");
                Ok(())
            }
            Err(err) => Err(NodeError::Bootstrap(err)),
        }
    }

    fn is_member(&self) -> bool {
        self.engine.status().members.iter().any(|m| m.id == self.id())
    }

    /// Ask each peer in turn to add this node as a voter. Peers forward the
    /// request to their leader. Failures are logged; an operator can still
    /// add the node later.
    async fn join_cluster(self: Arc<Self>) {
        let local = self.config.local_member();
        for attempt in 1..=self.config.join_attempts {
            for peer in self.config.remote_peers() {
                let url = format!("http://{}/cluster/join", peer.api_addr);
                match self.http.post(&url).json(&local).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(node = %self.id(), via = %peer.id, "joined cluster");
                        return;
                    }
                    Ok(resp) => {
                        debug!(node = %self.id(), peer = %peer.id, status = %resp.status(), "join refused")
                    }
                    Err(err) => debug!(node = %self.id(), peer = %peer.id, error = %err, "join request failed"),
                }
            }
            if self.is_member() {
                return;
            }
            debug!(node = %self.id(), attempt, "join attempt failed, retrying");
            tokio::time::sleep(self.config.join_backoff).await;
        }
        warn!(
            node = %self.id(),
            attempts = self.config.join_attempts,
            "could not join cluster, waiting to be added"
        );
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role(&self) -> RoleKind {
        self.engine.local_role()
    }

    /// Local store for reads that bypass consensus. May lag the leader.
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn current_leader(&self) -> Option<Member> {
        self.engine.current_leader()
    }

    pub fn status(&self) -> Status {
        self.engine.status()
    }

    /// Client used to forward requests to the leader.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Replicate `key = value` and wait for it to be applied locally.
    pub async fn propose_set(&self, key: &str, value: &str) -> Result<(), ProposeError> {
        let data = Command::set(key, value)
            .encode()
            .map_err(|e| ProposeError::Apply(e.to_string()))?;
        self.engine.propose(data, self.config.propose_timeout).await
    }

    pub async fn add_voter(&self, member: Member) -> Result<(), ProposeError> {
        self.engine.add_voter(member, self.config.propose_timeout).await
    }

    /// Healthy while the engine runs and the store answers reads.
    pub fn health(&self) -> Result<(), HealthError> {
        if let Some(fault) = self.engine.status().fault {
            return Err(HealthError::Halted(fault));
        }
        self.store.ping()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    use crate::fsm::testing::FailingMachine;
    use crate::router;
    use crate::runtime::TimerConfig;
    use crate::storage::MemoryStorage;
    use tempfile::TempDir;

    async fn wait_for(node: &KvNode, check: impl Fn(&Status) -> bool) {
        let mut rx = node.engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| check(s)))
            .await
            .expect("condition not reached in time")
            .expect("engine stopped");
    }

    /// A bootstrapped single-node cluster whose state machine fails every write.
    async fn failing_node(dir: &TempDir) -> Arc<KvNode> {
        let raft = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = NodeConfig::new(
            NodeId::from(1),
            raft.local_addr().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
            dir.path().to_path_buf(),
        );
        config.bootstrap = true;
        config.timers = TimerConfig {
            election_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(15),
        };
        config.propose_timeout = Duration::from_secs(5);

        let store = Arc::new(KvStore::open(&config.store_path()).unwrap());
        let fsm = FailingMachine(KvStateMachine::new(Arc::clone(&store)));
        let replica = Replica::new(config.id, MemoryStorage::new()).unwrap();
        let runtime = Runtime::new(replica, fsm, config.timers.clone(), 0).unwrap();
        let engine = Engine::spawn(runtime, Transport::start(config.id, raft).unwrap()).unwrap();
        let node = Arc::new(KvNode {
            config,
            store,
            engine,
            http: reqwest::Client::new(),
        });
        node.bootstrap().await.unwrap();
        wait_for(&node, |s| s.role == RoleKind::Leader).await;
        node
    }

    #[tokio::test]
    async fn store_failure_makes_node_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let node = failing_node(&dir).await;
        assert!(node.health().is_ok());

        assert_eq!(node.propose_set("k", "v").await, Err(ProposeError::Halted));
        wait_for(&node, |s| s.fault.is_some()).await;
        assert!(matches!(node.health(), Err(HealthError::Halted(_))));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router::router(node)).await });

        let resp = reqwest::get(format!("http://{addr}/healthcheck")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("consensus halted"));
    }
}
