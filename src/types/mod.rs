mod cluster;
mod log;
mod message;
mod primitives;

pub use cluster::{ClusterConfig, Member, SnapshotMeta};
pub use log::{EntryPayload, LogEntry};
pub use message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, Message,
    RequestVote, RequestVoteResponse,
};
pub use primitives::{LogIndex, NodeId, Term};
