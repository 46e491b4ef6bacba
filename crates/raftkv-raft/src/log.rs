//! Durable raft log
//!
//! Entries are stored under `log:<big-endian index>` so that key order is
//! index order and the tail can be found with a single reverse seek. The
//! (last index, last term) tail marker is cached and guarded by the same lock
//! that serialises all mutations.

use crate::types::{EntryPayload, LogEntry};
use parking_lot::Mutex;
use raftkv_core::{LogIndex, RaftKvError, Result, Term};
use raftkv_storage::{EngineHandle, WriteOp};

const LOG_PREFIX: &[u8] = b"log:";
/// First key past every log key (`;` sorts right after `:`)
const LOG_END: &[u8] = b"log;";

fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOG_PREFIX.len() + 8);
    key.extend_from_slice(LOG_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn encode(entry: &LogEntry) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entry)?)
}

fn decode(data: &[u8]) -> Result<LogEntry> {
    Ok(serde_json::from_slice(data)?)
}

#[derive(Clone, Copy, Debug, Default)]
struct Tail {
    index: LogIndex,
    term: Term,
}

/// Append-only (modulo conflict truncation) log of entries
pub struct RaftLog {
    engine: EngineHandle,
    tail: Mutex<Tail>,
}

impl RaftLog {
    /// Open the log stored in `engine`, recovering the tail marker
    pub fn open(engine: EngineHandle) -> Result<Self> {
        let tail = match engine.last_in_range(LOG_PREFIX, LOG_END)? {
            Some((_, data)) => {
                let entry = decode(&data)?;
                Tail {
                    index: entry.index,
                    term: entry.term,
                }
            }
            None => Tail::default(),
        };

        tracing::debug!(last_index = tail.index, last_term = tail.term, "opened raft log");
        Ok(Self {
            engine,
            tail: Mutex::new(tail),
        })
    }

    pub fn last_index_and_term(&self) -> (LogIndex, Term) {
        let tail = self.tail.lock();
        (tail.index, tail.term)
    }

    pub fn last_index(&self) -> LogIndex {
        self.tail.lock().index
    }

    /// Entry at `index`, or `NotFound`
    pub fn entry(&self, index: LogIndex) -> Result<LogEntry> {
        if index == 0 {
            return Err(RaftKvError::NotFound(index));
        }
        match self.engine.get(&log_key(index))? {
            Some(data) => decode(&data),
            None => Err(RaftKvError::NotFound(index)),
        }
    }

    /// Term of the entry at `index` (0 for the empty prefix at index 0)
    pub fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        {
            let tail = self.tail.lock();
            if index == tail.index {
                return Ok(tail.term);
            }
            if index > tail.index {
                return Err(RaftKvError::NotFound(index));
            }
        }
        Ok(self.entry(index)?.term)
    }

    /// Up to `max` consecutive entries starting at `start`
    pub fn entries_from(&self, start: LogIndex, max: u64) -> Result<Vec<LogEntry>> {
        let last = self.last_index();
        if start == 0 || start > last {
            return Ok(Vec::new());
        }
        let end = last.min(start.saturating_add(max).saturating_sub(1));
        (start..=end).map(|index| self.entry(index)).collect()
    }

    /// Append a new entry at the tail (leader path)
    ///
    /// Never truncates: a leader's own log is append-only.
    pub fn append_new(&self, term: Term, payload: EntryPayload) -> Result<LogEntry> {
        let mut tail = self.tail.lock();
        if term < tail.term {
            return Err(RaftKvError::Internal(format!(
                "append in term {} behind log tail term {}",
                term, tail.term
            )));
        }

        let entry = LogEntry::new(tail.index + 1, term, payload);
        self.engine.put(&log_key(entry.index), &encode(&entry)?)?;
        tail.index = entry.index;
        tail.term = entry.term;
        Ok(entry)
    }

    /// Store a contiguous run of entries received from a leader (follower path)
    ///
    /// Entries already present with the same term are skipped. The first entry
    /// whose index holds a different term discards that entry and every entry
    /// after it before the new suffix is written.
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let mut tail = self.tail.lock();
        if first.index == 0 || first.index > tail.index + 1 {
            tracing::warn!(index = first.index, last = tail.index, "append would leave a gap");
            return Err(RaftKvError::LogConflict { index: first.index });
        }

        // Find where the incoming entries start to differ from ours.
        let mut start = entries.len();
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index > tail.index {
                start = pos;
                break;
            }
            let existing = self.entry(entry.index)?;
            if existing.term != entry.term {
                tracing::info!(
                    index = entry.index,
                    ours = existing.term,
                    theirs = entry.term,
                    "log conflict, truncating suffix"
                );
                self.truncate_locked(&mut tail, entry.index)?;
                start = pos;
                break;
            }
        }

        let fresh = &entries[start..];
        let Some(last) = fresh.last() else {
            return Ok(());
        };

        let batch = fresh
            .iter()
            .map(|entry| Ok(WriteOp::put(log_key(entry.index), encode(entry)?)))
            .collect::<Result<Vec<_>>>()?;
        self.engine.write(batch)?;

        tail.index = last.index;
        tail.term = last.term;
        Ok(())
    }

    /// Remove every entry with index >= `index`
    pub fn truncate_suffix(&self, index: LogIndex) -> Result<()> {
        let mut tail = self.tail.lock();
        self.truncate_locked(&mut tail, index)
    }

    fn truncate_locked(&self, tail: &mut Tail, index: LogIndex) -> Result<()> {
        if index == 0 {
            return Err(RaftKvError::Internal("cannot truncate at index 0".into()));
        }
        if index > tail.index {
            return Ok(());
        }

        self.engine.delete_range(&log_key(index), LOG_END)?;

        let new_last = index - 1;
        tail.term = if new_last == 0 {
            0
        } else {
            self.entry(new_last)?.term
        };
        tail.index = new_last;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftkv_storage::{MemEngine, RocksEngine};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(key: &str) -> EntryPayload {
        EntryPayload::Write {
            key: key.to_string(),
            value: "v".to_string(),
        }
    }

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, write(&format!("k{}", index)))
    }

    fn mem_log() -> RaftLog {
        RaftLog::open(Arc::new(MemEngine::new())).unwrap()
    }

    #[test]
    fn test_empty_log() {
        let log = mem_log();
        assert_eq!(log.last_index_and_term(), (0, 0));
        assert_eq!(log.term_at(0).unwrap(), 0);
        assert!(matches!(log.entry(1), Err(RaftKvError::NotFound(1))));
        assert!(log.entries_from(1, 10).unwrap().is_empty());
    }

    #[test]
    fn test_append_new_assigns_indices() {
        let log = mem_log();
        let a = log.append_new(1, write("a")).unwrap();
        let b = log.append_new(2, EntryPayload::Noop).unwrap();

        assert_eq!((a.index, a.term), (1, 1));
        assert_eq!((b.index, b.term), (2, 2));
        assert_eq!(log.last_index_and_term(), (2, 2));
        assert_eq!(log.entry(1).unwrap(), a);
        assert_eq!(log.term_at(1).unwrap(), 1);
    }

    #[test]
    fn test_append_is_idempotent() {
        let log = mem_log();
        log.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        log.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(log.last_index_and_term(), (2, 1));

        // A heartbeat-sized prefix must not shorten the log.
        log.append(&[entry(1, 1)]).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let log = mem_log();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();

        log.append(&[entry(2, 1), entry(3, 2)]).unwrap();

        assert_eq!(log.last_index_and_term(), (3, 2));
        assert_eq!(log.term_at(3).unwrap(), 2);
        assert!(matches!(log.entry(4), Err(RaftKvError::NotFound(4))));
    }

    #[test]
    fn test_append_rejects_gap() {
        let log = mem_log();
        log.append(&[entry(1, 1)]).unwrap();
        assert!(matches!(
            log.append(&[entry(3, 1)]),
            Err(RaftKvError::LogConflict { index: 3 })
        ));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_truncate_suffix() {
        let log = mem_log();
        log.append(&[entry(1, 1), entry(2, 2), entry(3, 3)]).unwrap();

        log.truncate_suffix(2).unwrap();
        assert_eq!(log.last_index_and_term(), (1, 1));

        log.truncate_suffix(5).unwrap();
        assert_eq!(log.last_index(), 1);

        log.truncate_suffix(1).unwrap();
        assert_eq!(log.last_index_and_term(), (0, 0));
    }

    #[test]
    fn test_entries_from_respects_limit() {
        let log = mem_log();
        for term in 1..=5 {
            log.append_new(term, EntryPayload::Noop).unwrap();
        }

        let batch = log.entries_from(2, 2).unwrap();
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);

        let batch = log.entries_from(4, 100).unwrap();
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5]);

        assert!(log.entries_from(6, 100).unwrap().is_empty());
    }

    #[test]
    fn test_append_new_persists_before_returning() {
        let engine = Arc::new(MemEngine::new());
        let log = RaftLog::open(engine.clone()).unwrap();
        engine.set_fail_writes(true);

        assert!(matches!(
            log.append_new(1, EntryPayload::Noop),
            Err(RaftKvError::Persistence(_))
        ));
        assert_eq!(log.last_index(), 0);
    }

    #[test]
    fn test_reopen_recovers_tail() {
        let temp_dir = TempDir::new().unwrap();
        {
            let log = RaftLog::open(Arc::new(RocksEngine::open(temp_dir.path()).unwrap())).unwrap();
            log.append_new(1, write("a")).unwrap();
            log.append_new(1, write("b")).unwrap();
            log.append_new(2, write("c")).unwrap();
        }

        let log = RaftLog::open(Arc::new(RocksEngine::open(temp_dir.path()).unwrap())).unwrap();
        assert_eq!(log.last_index_and_term(), (3, 2));
        assert_eq!(log.entry(2).unwrap().payload, write("b"));
    }
}
