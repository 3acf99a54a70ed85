use serde::{Deserialize, Serialize};

use super::cluster::ClusterConfig;
use super::primitives::Term;

/// What a log entry carries. Commands are opaque to the consensus layer and
/// only interpreted by the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so entries from its own term can commit.
    Blank,
    Command(Vec<u8>),
    Config(ClusterConfig),
}

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn command(term: Term, data: Vec<u8>) -> Self {
        Self {
            term,
            payload: EntryPayload::Command(data),
        }
    }

    pub fn config(&self) -> Option<&ClusterConfig> {
        match &self.payload {
            EntryPayload::Config(config) => Some(config),
            _ => None,
        }
    }
}
