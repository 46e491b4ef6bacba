//! Durable raft metadata
//!
//! Holds the term/vote pair that must survive a crash, plus the commit index,
//! the last applied index and the cluster membership so a restarted node can
//! resume where it stopped.

use parking_lot::Mutex;
use raftkv_core::{LogIndex, NodeAddr, RaftKvError, Result, Term};
use raftkv_storage::{EngineHandle, WriteOp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const KEY_TERM: &[u8] = b"meta:current_term";
const KEY_VOTED_FOR: &[u8] = b"meta:voted_for";
const KEY_COMMIT_INDEX: &[u8] = b"meta:commit_index";
const KEY_LAST_APPLIED: &[u8] = b"meta:last_applied";
const KEY_MEMBERS: &[u8] = b"meta:members";

/// The vote cast in a term
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermVote {
    pub term: Term,
    pub voted_for: Option<NodeAddr>,
}

#[derive(Clone, Debug, Default)]
struct MetaState {
    vote: TermVote,
    commit_index: LogIndex,
    last_applied: LogIndex,
    members: Option<Vec<NodeAddr>>,
}

/// Raft metadata store, write-through to the engine
pub struct RaftMeta {
    engine: EngineHandle,
    state: Mutex<MetaState>,
}

fn load<T: DeserializeOwned>(engine: &EngineHandle, key: &[u8]) -> Result<Option<T>> {
    match engine.get(key)? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

impl RaftMeta {
    pub fn open(engine: EngineHandle) -> Result<Self> {
        let state = MetaState {
            vote: TermVote {
                term: load(&engine, KEY_TERM)?.unwrap_or(0),
                voted_for: load::<Option<NodeAddr>>(&engine, KEY_VOTED_FOR)?.flatten(),
            },
            commit_index: load(&engine, KEY_COMMIT_INDEX)?.unwrap_or(0),
            last_applied: load(&engine, KEY_LAST_APPLIED)?.unwrap_or(0),
            members: load(&engine, KEY_MEMBERS)?,
        };

        tracing::debug!(
            term = state.vote.term,
            voted_for = ?state.vote.voted_for,
            commit_index = state.commit_index,
            last_applied = state.last_applied,
            "opened raft meta"
        );
        Ok(Self {
            engine,
            state: Mutex::new(state),
        })
    }

    pub fn term_and_vote(&self) -> TermVote {
        self.state.lock().vote.clone()
    }

    /// Persist a term and the vote cast in it, atomically
    ///
    /// Refuses to move the term backwards or to change an existing vote
    /// within the same term.
    pub fn set_term_and_vote(&self, term: Term, voted_for: Option<&NodeAddr>) -> Result<()> {
        let mut state = self.state.lock();
        let current = &state.vote;
        if term < current.term {
            return Err(RaftKvError::StaleTerm {
                current_term: current.term,
            });
        }
        if term == current.term {
            if let (Some(previous), Some(next)) = (&current.voted_for, voted_for) {
                if previous != next {
                    return Err(RaftKvError::Internal(format!(
                        "already voted for {} in term {}",
                        previous, term
                    )));
                }
            }
        }

        let voted_for = voted_for.cloned();
        self.engine.write(vec![
            WriteOp::put(KEY_TERM, serde_json::to_vec(&term)?),
            WriteOp::put(KEY_VOTED_FOR, serde_json::to_vec(&voted_for)?),
        ])?;
        state.vote = TermVote { term, voted_for };
        Ok(())
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    pub fn set_commit_index(&self, index: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        self.engine
            .put(KEY_COMMIT_INDEX, &serde_json::to_vec(&index)?)?;
        state.commit_index = index;
        Ok(())
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.lock().last_applied
    }

    pub fn set_last_applied(&self, index: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        self.engine
            .put(KEY_LAST_APPLIED, &serde_json::to_vec(&index)?)?;
        state.last_applied = index;
        Ok(())
    }

    /// Membership persisted by the last applied membership change
    pub fn members(&self) -> Option<Vec<NodeAddr>> {
        self.state.lock().members.clone()
    }

    pub fn set_members(&self, members: &[NodeAddr]) -> Result<()> {
        let mut state = self.state.lock();
        self.engine.put(KEY_MEMBERS, &serde_json::to_vec(members)?)?;
        state.members = Some(members.to_vec());
        Ok(())
    }
}
