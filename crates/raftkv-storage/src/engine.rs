//! Storage engines
//!
//! The consensus layer only needs a small synchronous key-value surface:
//! point reads and writes, atomic batches, range deletion and "last key in a
//! range" (to find the log tail). Two engines implement it: RocksDB for real
//! deployments and an in-memory ordered map for tests.

use parking_lot::RwLock;
use raftkv_core::{RaftKvError, Result};
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single mutation inside an atomic batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Synchronous, crash-consistent key-value engine
///
/// Every mutating call must be durable when it returns.
pub trait Engine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply all operations atomically
    fn write(&self, batch: Vec<WriteOp>) -> Result<()>;

    /// Delete every key in `[start, end)`
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Greatest key (with its value) in `[start, end)`
    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Shared engine handle
pub type EngineHandle = Arc<dyn Engine>;

fn persistence(e: rocksdb::Error) -> RaftKvError {
    RaftKvError::Persistence(e.to_string())
}

/// RocksDB-backed engine
pub struct RocksEngine {
    db: DB,
}

impl RocksEngine {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(persistence)?;
        tracing::debug!(path = %path.display(), "opened rocksdb engine");
        Ok(Self { db })
    }

    fn sync_options() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl Engine for RocksEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(persistence)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put_opt(key, value, &Self::sync_options())
            .map_err(persistence)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete_opt(key, &Self::sync_options())
            .map_err(persistence)
    }

    fn write(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch {
            match op {
                WriteOp::Put { key, value } => wb.put(key, value),
                WriteOp::Delete { key } => wb.delete(key),
            }
        }
        self.db
            .write_opt(wb, &Self::sync_options())
            .map_err(persistence)
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut wb = WriteBatch::default();
        wb.delete_range(start, end);
        self.db
            .write_opt(wb, &Self::sync_options())
            .map_err(persistence)
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.db.raw_iterator();
        iter.seek_for_prev(end);
        if iter.valid() && iter.key() == Some(end) {
            iter.prev();
        }
        iter.status().map_err(persistence)?;

        if !iter.valid() {
            return Ok(None);
        }
        match (iter.key(), iter.value()) {
            (Some(key), Some(value)) if key >= start && key < end => {
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            _ => Ok(None),
        }
    }
}

/// In-memory engine
///
/// Optionally fails every write, which lets tests exercise persistence
/// failure paths.
#[derive(Default)]
pub struct MemEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RaftKvError::Persistence("injected write failure".into()));
        }
        Ok(())
    }
}

impl Engine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn write(&self, batch: Vec<WriteOp>) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        for op in batch {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            data.remove(&key);
        }
        Ok(())
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}
