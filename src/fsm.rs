use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bincode::error::{DecodeError, EncodeError};

use crate::command::Command;
use crate::store::{KvStore, StoreError, StoreView};
use crate::types::LogIndex;

/// Error type for state machine operations.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("malformed command at {index}: {source}")]
    Decode {
        index: LogIndex,
        #[source]
        source: serde_json::Error,
    },
    #[error("command at {index} has an empty key")]
    EmptyKey { index: LogIndex },
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("snapshot i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding failed: {0}")]
    SnapshotEncode(#[from] EncodeError),
    #[error("malformed snapshot: {0}")]
    SnapshotDecode(#[from] DecodeError),
    #[error("snapshot serialization cancelled")]
    Cancelled,
    #[error("state machine is {0}")]
    NotReady(Phase),
}

impl FsmError {
    /// A fatal error means local state may have diverged from the log.
    /// Everything else leaves the state untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsmError::Store(_))
    }
}

/// Lifecycle of a state machine. Construction binds it to a store, so it
/// starts out `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Restoring,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Ready => f.write_str("ready"),
            Phase::Restoring => f.write_str("restoring"),
        }
    }
}

/// A deterministic state machine driven by committed log entries.
///
/// Entries are applied one at a time in log order. Given the same sequence of
/// entries every replica must end up with identical state.
pub trait StateMachine {
    type Snapshot: SnapshotHandle;

    /// Index of the last entry reflected in durable state.
    fn applied_index(&self) -> Result<LogIndex, FsmError>;

    /// Apply the command at `index`.
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<(), FsmError>;

    /// Capture the current state. Serialization happens later through the handle.
    fn snapshot(&self) -> Result<Self::Snapshot, FsmError>;

    /// Replace all state with a snapshot covering entries up to `index`.
    fn restore(&mut self, index: LogIndex, input: &mut dyn Read) -> Result<(), FsmError>;
}

/// A captured point-in-time state, serializable off the apply path.
pub trait SnapshotHandle: Send + 'static {
    /// Write the snapshot to `sink`, giving up with `FsmError::Cancelled`
    /// once `cancel` is set.
    fn persist(&self, sink: &mut dyn Write, cancel: &AtomicBool) -> Result<(), FsmError>;
}

/// Snapshots are a sequence of bincode-encoded `Some((key, value))` records
/// in key order, closed by a single `None`.
type SnapshotRecord = Option<(Vec<u8>, Vec<u8>)>;

/// Key-value state machine over a durable `KvStore`.
pub struct KvStateMachine {
    store: Arc<KvStore>,
    phase: Phase,
}

impl KvStateMachine {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            phase: Phase::Ready,
        }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn ensure_ready(&self) -> Result<(), FsmError> {
        match self.phase {
            Phase::Ready => Ok(()),
            phase => Err(FsmError::NotReady(phase)),
        }
    }

    fn read_snapshot(input: &mut dyn Read) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FsmError> {
        let mut reader = BufReader::new(input);
        let mut entries = Vec::new();
        while let Some(entry) =
            bincode::serde::decode_from_std_read::<SnapshotRecord, _, _>(&mut reader, bincode::config::standard())?
        {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl StateMachine for KvStateMachine {
    type Snapshot = KvSnapshot;

    fn applied_index(&self) -> Result<LogIndex, FsmError> {
        Ok(self.store.applied_index()?)
    }

    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<(), FsmError> {
        self.ensure_ready()?;
        let command = match Command::decode(data) {
            Ok(command) => command,
            Err(source) => {
                // The entry is consumed even though it has no effect.
                self.store.mark_applied(index)?;
                return Err(FsmError::Decode { index, source });
            }
        };
        match command {
            Command::Set { key, .. } if key.is_empty() => {
                self.store.mark_applied(index)?;
                Err(FsmError::EmptyKey { index })
            }
            Command::Set { key, value } => {
                self.store.apply_set(index, key.as_bytes(), value.as_bytes())?;
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> Result<KvSnapshot, FsmError> {
        self.ensure_ready()?;
        Ok(KvSnapshot {
            view: self.store.view()?,
        })
    }

    fn restore(&mut self, index: LogIndex, input: &mut dyn Read) -> Result<(), FsmError> {
        self.phase = Phase::Restoring;
        let result = Self::read_snapshot(input)
            .and_then(|entries| Ok(self.store.replace_all(entries, index)?));
        self.phase = Phase::Ready;
        result
    }
}

/// The key space as of the moment the snapshot was taken. Reading it happens
/// in `persist`, off the apply path.
pub struct KvSnapshot {
    view: StoreView,
}

impl SnapshotHandle for KvSnapshot {
    fn persist(&self, sink: &mut dyn Write, cancel: &AtomicBool) -> Result<(), FsmError> {
        let config = bincode::config::standard();
        let mut writer = BufWriter::new(sink);
        self.view.for_each(|key, value| {
            if cancel.load(Ordering::Relaxed) {
                return Err(FsmError::Cancelled);
            }
            bincode::serde::encode_into_std_write(Some((key, value)), &mut writer, config)?;
            Ok(())
        })?;
        bincode::serde::encode_into_std_write(None::<(&[u8], &[u8])>, &mut writer, config)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Behaves like the wrapped machine except that every command fails as
    /// if the disk had gone away.
    pub(crate) struct FailingMachine(pub KvStateMachine);

    impl StateMachine for FailingMachine {
        type Snapshot = KvSnapshot;

        fn applied_index(&self) -> Result<LogIndex, FsmError> {
            self.0.applied_index()
        }

        fn apply(&mut self, _index: LogIndex, _data: &[u8]) -> Result<(), FsmError> {
            Err(StoreError::Io(io::Error::other("disk unavailable")).into())
        }

        fn snapshot(&self) -> Result<KvSnapshot, FsmError> {
            self.0.snapshot()
        }

        fn restore(&mut self, index: LogIndex, input: &mut dyn Read) -> Result<(), FsmError> {
            self.0.restore(index, input)
        }
    }
}
