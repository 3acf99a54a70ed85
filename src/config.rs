use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::TimerConfig;
use crate::types::{Member, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid peer '{peer}': {reason}")]
    InvalidPeer { peer: String, reason: String },
    #[error("node id must be non-zero")]
    ZeroId,
    #[error("peer {0} listed more than once")]
    DuplicatePeer(NodeId),
    #[error("peer {0} uses this node's id with different addresses")]
    ConflictingSelf(NodeId),
    #[error("a node that does not bootstrap needs at least one peer to join through")]
    NoPeers,
}

/// Everything needed to start one node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Consensus traffic is accepted here, and advertised to peers.
    pub raft_addr: SocketAddr,
    /// Client HTTP API.
    pub api_addr: SocketAddr,
    /// Other known members. Used as the initial configuration when
    /// bootstrapping and as join targets otherwise.
    pub peers: Vec<Member>,
    pub bootstrap: bool,
    pub data_dir: PathBuf,
    pub timers: TimerConfig,
    /// Applied entries between snapshots; zero disables compaction.
    pub snapshot_threshold: u64,
    pub propose_timeout: Duration,
    pub join_attempts: u32,
    pub join_backoff: Duration,
}

impl NodeConfig {
    pub fn new(id: NodeId, raft_addr: SocketAddr, api_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            id,
            raft_addr,
            api_addr,
            peers: Vec::new(),
            bootstrap: false,
            data_dir,
            timers: TimerConfig::default(),
            snapshot_threshold: 1024,
            propose_timeout: Duration::from_secs(10),
            join_attempts: 5,
            join_backoff: Duration::from_secs(1),
        }
    }

    pub fn local_member(&self) -> Member {
        Member {
            id: self.id,
            raft_addr: self.raft_addr,
            api_addr: self.api_addr,
        }
    }

    /// Directory of the consensus log, hard state and snapshots.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(format!("raft-{}", self.id.get()))
    }

    /// File of the key-value store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("kv-{}.redb", self.id.get()))
    }

    /// Peers other than this node.
    pub fn remote_peers(&self) -> impl Iterator<Item = &Member> {
        self.peers.iter().filter(move |m| m.id != self.id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.get() == 0 {
            return Err(ConfigError::ZeroId);
        }
        let local = self.local_member();
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].iter().any(|p| p.id == peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
            if peer.id == self.id && *peer != local {
                return Err(ConfigError::ConflictingSelf(peer.id));
            }
        }
        if !self.bootstrap && self.remote_peers().next().is_none() {
            return Err(ConfigError::NoPeers);
        }
        Ok(())
    }
}

/// Parse `ID=RAFT_ADDR/API_ADDR`, e.g. `2=127.0.0.1:7002/127.0.0.1:8002`.
pub fn parse_peer(raw: &str) -> Result<Member, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPeer {
        peer: raw.to_string(),
        reason,
    };
    let (id, addrs) = raw
        .trim()
        .split_once('=')
        .ok_or_else(|| invalid("expected ID=RAFT_ADDR/API_ADDR".into()))?;
    let id = id
        .trim()
        .parse::<u64>()
        .map_err(|e| invalid(format!("bad id: {e}")))?;
    let (raft_addr, api_addr) = addrs
        .split_once('/')
        .ok_or_else(|| invalid("missing /API_ADDR".into()))?;
    let raft_addr = raft_addr
        .trim()
        .parse::<SocketAddr>()
        .map_err(|e| invalid(format!("bad raft address: {e}")))?;
    let api_addr = api_addr
        .trim()
        .parse::<SocketAddr>()
        .map_err(|e| invalid(format!("bad api address: {e}")))?;
    Ok(Member {
        id: NodeId::from(id),
        raft_addr,
        api_addr,
    })
}

/// Parse a comma-separated peer list. Empty items are ignored.
pub fn parse_peers(raw: &str) -> Result<Vec<Member>, ConfigError> {
    raw.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(parse_peer)
        .collect()
}
