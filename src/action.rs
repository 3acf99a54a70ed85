use crate::types::{Message, NodeId, SnapshotMeta};

/// Actions that the replica asks the runtime to perform.
pub enum Action {
    /// Send a message to a specific peer.
    Send { to: NodeId, message: Message },
    /// Reset the election timer.
    ResetElectionTimer,
    /// Reset the heartbeat timer (leader only).
    ResetHeartbeatTimer,
    /// Replace the state machine's contents with a snapshot received from the
    /// leader. The replica has already moved its applied index to `meta.last_index`.
    RestoreSnapshot { meta: SnapshotMeta, data: Vec<u8> },
}
