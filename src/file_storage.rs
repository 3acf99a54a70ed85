use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{chunk_at, plan_append, Storage, StorageError};
use crate::types::{LogEntry, LogIndex, NodeId, SnapshotMeta, Term};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".snap";

#[derive(Serialize, Deserialize)]
struct Meta {
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// One line of log.jsonl. The index is stored explicitly so a log file left
/// behind by a crash mid-compaction is still read correctly.
#[derive(Serialize, Deserialize)]
struct Record {
    index: LogIndex,
    entry: LogEntry,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    index: LogIndex,
    entry: &'a LogEntry,
}

/// Disk-backed storage. Persistent state lives in files inside `dir`:
///   meta.json              current term and voted_for, written atomically via rename
///   log.jsonl              one JSON object per log entry after the snapshot
///   snapshot-<index>.snap  latest snapshot: a JSON metadata line, then the raw state
///
/// The in-memory log acts as a write-through cache: reads are served from
/// memory, writes update memory then flush to disk with fsync before returning.
/// This satisfies the durability requirement of §5.1 (respond only after
/// persisting state).
pub struct FileStorage {
    dir: PathBuf,
    current_term: Term,
    voted_for: Option<NodeId>,
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
    log: Vec<LogEntry>,
}

impl FileStorage {
    /// Open (or create) storage rooted at `dir`. On first use the directory
    /// is created and everything starts empty (term=0, no vote, empty log).
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let meta = Self::read_meta(dir)?;
        let snapshot = Self::read_latest_snapshot(dir)?;
        let offset = snapshot
            .as_ref()
            .map_or(LogIndex::ZERO, |(meta, _)| meta.last_index);
        let log = Self::read_log(dir, offset)?;
        debug!(
            dir = %dir.display(),
            term = %meta.current_term,
            snapshot = %offset,
            entries = log.len(),
            "opened raft storage"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            snapshot,
            log,
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn offset(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map_or(LogIndex::ZERO, |(meta, _)| meta.last_index)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        index.distance_after(self.offset())
    }

    fn read_meta(dir: &Path) -> Result<Meta, StorageError> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(Meta {
                current_term: Term::default(),
                voted_for: None,
            });
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn snapshot_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
        let mut found = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let index = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(index) = index {
                found.push((index, path));
            }
        }
        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }

    fn read_latest_snapshot(dir: &Path) -> Result<Option<(SnapshotMeta, Vec<u8>)>, StorageError> {
        let Some((_, path)) = Self::snapshot_files(dir)?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&path)?;
        let split = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
        let meta: SnapshotMeta = serde_json::from_slice(&bytes[..split])?;
        let data = bytes.get(split + 1..).unwrap_or_default().to_vec();
        Ok(Some((meta, data)))
    }

    fn read_log(dir: &Path, offset: LogIndex) -> Result<Vec<LogEntry>, StorageError> {
        let path = dir.join(LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut expected = offset.next();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)?;
            if record.index <= offset {
                continue;
            }
            if record.index != expected {
                return Err(StorageError::Gap {
                    expected,
                    found: record.index,
                });
            }
            entries.push(record.entry);
            expected = expected.next();
        }
        Ok(entries)
    }

    fn encode_record(index: LogIndex, entry: &LogEntry) -> Result<String, StorageError> {
        let mut line = serde_json::to_string(&RecordRef { index, entry })?;
        line.push('\n');
        Ok(line)
    }

    /// Fsync the directory so a rename is visible after a crash.
    fn sync_dir(&self) -> Result<(), StorageError> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Atomically overwrite meta.json: write temp file → fsync → rename → fsync dir.
    fn flush_meta(&self) -> Result<(), StorageError> {
        let tmp = self.dir.join("meta.json.tmp");
        let meta = Meta {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        let bytes = serde_json::to_vec(&meta)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.meta_path())?;
        self.sync_dir()
    }

    /// Append serialised entries to log.jsonl and fsync once.
    fn append_to_log_file(&self, first: LogIndex, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for (i, entry) in entries.iter().enumerate() {
            buf.push_str(&Self::encode_record(first.advance(i), entry)?);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite log.jsonl from the in-memory cache atomically and fsync.
    fn rewrite_log_file(&self) -> Result<(), StorageError> {
        let tmp = self.dir.join("log.jsonl.tmp");
        let mut file = File::create(&tmp)?;
        let first = self.offset().next();
        for (i, entry) in self.log.iter().enumerate() {
            file.write_all(Self::encode_record(first.advance(i), entry)?.as_bytes())?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.log_path())?;
        self.sync_dir()
    }

    fn write_snapshot_file(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), StorageError> {
        let tmp = self.dir.join("snapshot.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(meta)?)?;
        file.write_all(b"\n")?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        let name = format!(
            "{SNAPSHOT_PREFIX}{:020}{SNAPSHOT_SUFFIX}",
            meta.last_index.get()
        );
        fs::rename(&tmp, self.dir.join(name))?;
        self.sync_dir()
    }

    /// Delete snapshot files older than the one covering `keep`.
    fn remove_superseded_snapshots(&self, keep: LogIndex) -> Result<(), StorageError> {
        for (index, path) in Self::snapshot_files(&self.dir)? {
            if index < keep.get() {
                fs::remove_file(&path)?;
                debug!(path = %path.display(), "removed superseded snapshot");
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn current_term(&self) -> Result<Term, StorageError> {
        Ok(self.current_term)
    }

    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.current_term = term;
        self.flush_meta()
    }

    fn voted_for(&self) -> Result<Option<NodeId>, StorageError> {
        Ok(self.voted_for)
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> Result<(), StorageError> {
        self.voted_for = candidate;
        self.flush_meta()
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
        let index = self.last_log_index()?.next();
        self.append_to_log_file(index, std::slice::from_ref(&entry))?;
        self.log.push(entry);
        Ok(index)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        match self.position(index) {
            Some(pos) => self.log.truncate(pos),
            None => self.log.clear(),
        }
        self.rewrite_log_file()
    }

    /// Append entries per Raft rules (§5.3): if an existing entry conflicts with
    /// a new one (same index, different term), delete it and everything after.
    /// On a conflict the whole log is rewritten atomically; on a pure append
    /// the new entries are written with a single fsync.
    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
    ) -> Result<bool, StorageError> {
        let (start, entries, conflict) = plan_append(&*self, prev_log_index, entries)?;
        if conflict {
            if let Some(pos) = self.position(start) {
                self.log.truncate(pos);
            }
            self.log.extend(entries);
            self.rewrite_log_file()?;
        } else {
            self.append_to_log_file(start, &entries)?;
            self.log.extend(entries);
        }
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
        // The snapshot file must be durable before the log prefix is dropped.
        self.write_snapshot_file(&meta, &data)?;

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
        let last_index = meta.last_index;
        self.snapshot = Some((meta, data));
        self.rewrite_log_file()?;
        self.remove_superseded_snapshots(last_index)
    }
}
