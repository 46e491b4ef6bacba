//! Apply engine
//!
//! Applies committed entries to the key-value state machine strictly in
//! index order, persisting `last_applied` after each one.

use crate::raft::RaftCore;
use crate::types::{EntryPayload, LogEntry};
use raftkv_core::{LogIndex, Result, Role};
use std::sync::Arc;

impl RaftCore {
    /// Apply everything in `(last_applied, commit_index]`; returns how many entries
    pub(crate) fn apply_committed(&self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let next: LogIndex = self.context().last_applied() + 1;
            if next > self.context().commit_index() {
                return Ok(applied);
            }

            let entry = self.log().entry(next)?;
            self.apply_entry(&entry)?;
            self.context().mark_applied(entry.index)?;
            applied += 1;
        }
    }

    fn apply_entry(&self, entry: &LogEntry) -> Result<()> {
        tracing::debug!(index = entry.index, term = entry.term, kind = entry.kind(), "applying");
        match &entry.payload {
            EntryPayload::Write { key, value } => self.kv().put(key, value),
            EntryPayload::Delete { key } => self.kv().delete(key),
            EntryPayload::AddServer { addr } => self.add_member(addr),
            EntryPayload::Noop => Ok(()),
        }
    }
}

/// Long-running apply task; exits on shutdown
///
/// A failed apply is published to waiting clients and retried after a
/// heartbeat interval. A leader that cannot apply steps down.
pub(crate) async fn run(core: Arc<RaftCore>) {
    let mut commit = core.context().subscribe_commit();
    let mut shutdown = core.shutdown_signal();
    let retry = core.config().heartbeat_interval;

    loop {
        commit.borrow_and_update();
        let failing = match core.apply_committed() {
            Ok(_) => {
                core.context().set_apply_error(None);
                false
            }
            Err(e) => {
                let view = core.context().view();
                tracing::error!(
                    last_applied = view.last_applied,
                    commit_index = view.commit_index,
                    error = %e,
                    "apply failed, retrying"
                );
                core.context().set_apply_error(Some(e.to_string()));
                if view.role == Role::Leader {
                    core.step_down(view.current_term);
                }
                true
            }
        };

        tokio::select! {
            changed = commit.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(retry), if failing => {}
            _ = shutdown.changed() => return,
        }
    }
}
