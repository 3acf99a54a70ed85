//! Replicated key-value store on a Raft consensus core.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation (§4 membership changes, §5 log compaction)
//!
//! Layers, leaves first: `store` (durable map), `fsm` (applies commands and
//! snapshots), `replica` (protocol core), `runtime` (timers, application,
//! compaction), `engine` (event loop thread), `node` and `router`.

pub mod action;
pub mod command;
pub mod config;
pub mod engine;
pub mod file_storage;
pub mod fsm;
pub mod node;
pub mod replica;
pub mod router;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod cluster;

pub use engine::{EngineHandle, ProposeError, Status};
pub use node::KvNode;
pub use types::{LogIndex, Member, NodeId, Term};
