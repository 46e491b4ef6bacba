//! Key-value state machine
//!
//! Committed log entries are applied here; reads are served from here.

use crate::engine::{EngineHandle, MemEngine};
use raftkv_core::{RaftKvError, Result};
use std::sync::Arc;

/// Engine-backed key-value store used as the replicated state machine
pub struct KvStore {
    engine: EngineHandle,
}

impl KvStore {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    /// Store backed by a fresh in-memory engine
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemEngine::new()))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.engine.put(key.as_bytes(), value.as_bytes())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.engine.delete(key.as_bytes())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.engine.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| RaftKvError::Serialization(format!("value of {}: {}", key, e))),
            None => Ok(None),
        }
    }
}

/// Thread-safe store handle
pub type KvStoreHandle = Arc<KvStore>;
