use std::fs;
use std::io;
use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};
use tracing::debug;

use crate::types::LogIndex;

const KV_TABLE: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<'_, &str, u64> = TableDefinition::new("meta");

const APPLIED_INDEX_KEY: &str = "applied_index";

/// Error type for durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

/// An ordered, byte-keyed persistent map backed by redb.
///
/// Every write is its own transaction committed with redb's default
/// (immediate) durability, so a write that returned is on stable storage.
/// redb readers see a consistent snapshot and never block the writer, which
/// makes the store safe to share between threads without extra locking.
///
/// Alongside the data the store remembers the last log index whose command
/// was written, updated atomically with that write.
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(KV_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;

        debug!(path = %path.display(), "opened key-value store");
        Ok(Self { db })
    }

    /// Store `value` under `key`, durable once this returns.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Look up `key`; `None` when it has never been set.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Confirms the database can still serve reads.
    pub fn ping(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        txn.open_table(KV_TABLE)?;
        Ok(())
    }

    /// Index of the last log entry written through `apply_set` or `mark_applied`.
    pub fn applied_index(&self) -> Result<LogIndex, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let applied = table
            .get(APPLIED_INDEX_KEY)?
            .map_or(0, |guard| guard.value());
        Ok(LogIndex::from(applied))
    }

    /// Write `key` and record `index` as applied, in one transaction.
    pub(crate) fn apply_set(&self, index: LogIndex, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.insert(key, value)?;
            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(APPLIED_INDEX_KEY, index.get())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Record `index` as applied without touching the data.
    pub(crate) fn mark_applied(&self, index: LogIndex) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(APPLIED_INDEX_KEY, index.get())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// A consistent view of the store as of now. Later writes do not show
    /// through it, and holding it does not block them.
    pub fn view(&self) -> Result<StoreView, StoreError> {
        Ok(StoreView {
            txn: self.db.begin_read()?,
        })
    }

    /// Every key/value pair in key order, read from a single consistent snapshot.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        self.view()?.for_each(|key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok::<_, StoreError>(())
        })?;
        Ok(entries)
    }

    /// Replace the whole content with `entries` and record `applied`, atomically.
    pub(crate) fn replace_all(
        &self,
        entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
        applied: LogIndex,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(KV_TABLE)?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            for (key, value) in entries {
                table.insert(key.as_slice(), value.as_slice())?;
            }
            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(APPLIED_INDEX_KEY, applied.get())?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Read-only point-in-time view of a `KvStore`, backed by a redb read
/// transaction. It can be moved to another thread.
pub struct StoreView {
    txn: ReadTransaction,
}

impl StoreView {
    /// Visit every pair in key order, stopping at the first error.
    pub fn for_each<E>(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<(), E>) -> Result<(), E>
    where
        E: From<StoreError>,
    {
        let table = self.txn.open_table(KV_TABLE).map_err(StoreError::from)?;
        for item in table.iter().map_err(StoreError::from)? {
            let (key, value) = item.map_err(StoreError::from)?;
            f(key.value(), value.value())?;
        }
        Ok(())
    }
}
