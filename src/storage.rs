use std::io;

use crate::types::{LogEntry, LogIndex, NodeId, SnapshotMeta, Term};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("log is not contiguous: expected {expected}, found {found}")]
    Gap { expected: LogIndex, found: LogIndex },
}

/// Storage abstraction for Raft persistent state. §5.1, Figure 2 (Persistent state on all
/// servers): currentTerm, votedFor, and log must be stored on stable storage and survive
/// crashes. Implementations must flush to durable media before returning from any mutating
/// method. Responding to an RPC before persisting violates Raft's safety guarantees.
///
/// The log may be compacted: entries up to and including the latest snapshot's
/// `last_index` are gone and only the snapshot's metadata stands in for them.
pub trait Storage {
    /// Get the current term.
    fn current_term(&self) -> Result<Term, StorageError>;

    /// Set the current term. Must be durable before returning.
    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError>;

    /// Get the node this server voted for in the current term.
    fn voted_for(&self) -> Result<Option<NodeId>, StorageError>;

    /// Set the voted_for field. Must be durable before returning.
    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> Result<(), StorageError>;

    /// Index of the last entry covered by the latest snapshot, or zero.
    fn snapshot_index(&self) -> Result<LogIndex, StorageError>;

    /// Get the last log index (the snapshot index when the log is empty).
    fn last_log_index(&self) -> Result<LogIndex, StorageError>;

    /// Get the term at a specific log index. Index zero has term zero, the
    /// snapshot index has the snapshot's term, and compacted or missing
    /// indices return None.
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, StorageError>;

    /// Get a log entry by index.
    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError>;

    /// Get up to `max` log entries starting from an index.
    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<LogEntry>, StorageError>;

    /// Append an entry to the log. Returns the index of the new entry.
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, StorageError>;

    /// Truncate the log from the given index (inclusive).
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;

    /// Append multiple entries, handling conflicts per Raft rules.
    /// If an existing entry conflicts with a new one (same index, different term),
    /// delete the existing entry and all that follow it. Returns whether
    /// anything was truncated.
    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
    ) -> Result<bool, StorageError>;

    /// Metadata of the latest snapshot.
    fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, StorageError>;

    /// The latest snapshot with its serialized state.
    fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, StorageError>;

    /// Up to `max` bytes of the latest snapshot starting at `offset`, with
    /// its metadata and whether the chunk reaches the end.
    fn snapshot_chunk(
        &self,
        offset: u64,
        max: usize,
    ) -> Result<Option<(SnapshotMeta, Vec<u8>, bool)>, StorageError>;

    /// Persist a snapshot, replacing the previous one, and discard the log
    /// prefix it covers. §7: if the log holds an entry at `meta.last_index`
    /// with `meta.last_term`, the entries after it are kept; otherwise the
    /// whole log is discarded. A snapshot no newer than the current one is ignored.
    fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError>;
}

/// Resolves where `append_entries` should write each entry, shared by both
/// storage implementations. Returns the entries that remain after skipping the
/// ones already present, along with the index of the first one and whether
/// the existing suffix from that point must be truncated first.
pub(crate) fn plan_append<S: Storage + ?Sized>(
    storage: &S,
    prev_log_index: LogIndex,
    entries: Vec<LogEntry>,
) -> Result<(LogIndex, Vec<LogEntry>, bool), StorageError> {
    let last = storage.last_log_index()?;
    let snapshot = storage.snapshot_index()?;
    let mut index = prev_log_index.next();
    let mut remaining = entries.into_iter().peekable();

    while let Some(entry) = remaining.peek() {
        if index <= snapshot {
            // Already covered by the snapshot, hence committed and identical.
        } else if index <= last {
            match storage.term_at(index)? {
                Some(term) if term == entry.term => {}
                _ => return Ok((index, remaining.collect(), true)),
            }
        } else {
            break;
        }
        remaining.next();
        index = index.next();
    }

    Ok((index, remaining.collect(), false))
}

/// Slice `data` from `offset`, at most `max` bytes. True when the slice ends the data.
pub(crate) fn chunk_at(data: &[u8], offset: u64, max: usize) -> (Vec<u8>, bool) {
    let start = usize::try_from(offset).map_or(data.len(), |o| o.min(data.len()));
    let end = start.saturating_add(max).min(data.len());
    (data[start..end].to_vec(), end == data.len())
}

/// In-memory storage for testing.
#[derive(Default)]
pub struct MemoryStorage {
    current_term: Term,
    voted_for: Option<NodeId>,
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
    log: Vec<LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map_or(LogIndex::ZERO, |(meta, _)| meta.last_index)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        index.distance_after(self.offset())
    }
}

impl Storage for MemoryStorage {
    fn current_term(&self) -> Result<Term, StorageError> {
        Ok(self.current_term)
    }

    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.current_term = term;
        Ok(())
    }

    fn voted_for(&self) -> Result<Option<NodeId>, StorageError> {
        Ok(self.voted_for)
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> Result<(), StorageError> {
        self.voted_for = candidate;
        Ok(())
    }

    fn snapshot_index(&self) -> Result<LogIndex, StorageError> {
        Ok(self.offset())
    }

    fn last_log_index(&self) -> Result<LogIndex, StorageError> {
        Ok(self.offset().advance(self.log.len()))
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, StorageError> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term::ZERO));
        }
        if let Some((meta, _)) = &self.snapshot {
            if index == meta.last_index {
                return Ok(Some(meta.last_term));
            }
        }
        Ok(self
            .position(index)
            .and_then(|pos| self.log.get(pos))
            .map(|e| e.term))
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        Ok(self.position(index).and_then(|pos| self.log.get(pos)).cloned())
    }

    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        let from = self.position(start).unwrap_or(0);
        Ok(self.log.iter().skip(from).take(max).cloned().collect())
    }

    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, StorageError> {
        self.log.push(entry);
        self.last_log_index()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        match self.position(index) {
            Some(pos) => self.log.truncate(pos),
            None => self.log.clear(),
        }
        Ok(())
    }

    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
    ) -> Result<bool, StorageError> {
        let (start, entries, conflict) = plan_append(self, prev_log_index, entries)?;
        if conflict {
            self.truncate_from(start)?;
        }
        self.log.extend(entries);
        Ok(conflict)
    }

    fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, StorageError> {
        Ok(self.snapshot.as_ref().map(|(meta, _)| meta.clone()))
    }

    fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn snapshot_chunk(
        &self,
        offset: u64,
        max: usize,
    ) -> Result<Option<(SnapshotMeta, Vec<u8>, bool)>, StorageError> {
        Ok(self.snapshot.as_ref().map(|(meta, data)| {
            let (chunk, done) = chunk_at(data, offset, max);
            (meta.clone(), chunk, done)
        }))
    }

    fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        if self.snapshot.is_some() && meta.last_index <= self.offset() {
            return Ok(());
        }
        let keep_suffix = self.term_at(meta.last_index)? == Some(meta.last_term);
        if keep_suffix {
            let covered = self
                .position(meta.last_index)
                .map_or(0, |pos| pos + 1)
                .min(self.log.len());
            self.log.drain(..covered);
        } else {
            self.log.clear();
        }
        self.snapshot = Some((meta, data));
        Ok(())
    }
}
