//! Process-wide consensus state
//!
//! Role, term, vote, known leader, commit index and last applied index live
//! behind a single mutex. Every transition goes through a method here; other
//! components never cache any of these values. The lock is never held across
//! an `.await`.
//!
//! Commit and applied indices are also published on watch channels so the
//! apply engine and waiting clients can park until they move.

use crate::meta::RaftMeta;
use parking_lot::Mutex;
use rand::Rng;
use raftkv_core::{LogIndex, NodeAddr, Result, Role, Term};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug)]
struct ContextState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeAddr>,
    leader: Option<NodeAddr>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    election_deadline: Instant,
    /// Votes granted to us in the current election, self included
    votes: HashSet<NodeAddr>,
    /// Last error of the apply engine, cleared once applying succeeds again
    apply_error: Option<String>,
}

/// Copy of the context taken under the lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextView {
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeAddr>,
    pub leader: Option<NodeAddr>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

pub struct RaftContext {
    local: NodeAddr,
    meta: Arc<RaftMeta>,
    election_timeout: (Duration, Duration),
    state: Mutex<ContextState>,
    commit_tx: watch::Sender<LogIndex>,
    applied_tx: watch::Sender<LogIndex>,
}

fn random_timeout((min, max): (Duration, Duration)) -> Duration {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

impl RaftContext {
    /// Rebuild the context from persisted metadata; always starts as follower
    pub fn new(
        local: NodeAddr,
        meta: Arc<RaftMeta>,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
    ) -> Self {
        let election_timeout = (election_timeout_min, election_timeout_max);
        let vote = meta.term_and_vote();
        let commit_index = meta.commit_index();
        let last_applied = meta.last_applied();

        let state = ContextState {
            role: Role::Follower,
            current_term: vote.term,
            voted_for: vote.voted_for,
            leader: None,
            commit_index,
            last_applied,
            election_deadline: Instant::now() + random_timeout(election_timeout),
            votes: HashSet::new(),
            apply_error: None,
        };

        let (commit_tx, _) = watch::channel(commit_index);
        let (applied_tx, _) = watch::channel(last_applied);

        Self {
            local,
            meta,
            election_timeout,
            state: Mutex::new(state),
            commit_tx,
            applied_tx,
        }
    }

    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    pub fn view(&self) -> ContextView {
        let state = self.state.lock();
        ContextView {
            role: state.role,
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
            leader: state.leader.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
        }
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    pub fn leader(&self) -> Option<NodeAddr> {
        self.state.lock().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// True while we are still leader of exactly `term`
    pub fn is_leader_in(&self, term: Term) -> bool {
        let state = self.state.lock();
        state.role == Role::Leader && state.current_term == term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.lock().last_applied
    }

    pub fn election_deadline(&self) -> Instant {
        self.state.lock().election_deadline
    }

    pub fn reset_election_deadline(&self) {
        let mut state = self.state.lock();
        state.election_deadline = Instant::now() + random_timeout(self.election_timeout);
    }

    /// Step down to follower of `term`
    ///
    /// A newer term clears the vote (persisted before the change is visible).
    /// A `term` older than ours is ignored.
    pub fn become_follower(&self, term: Term, leader: Option<NodeAddr>) -> Result<()> {
        let mut state = self.state.lock();
        if term < state.current_term {
            return Ok(());
        }

        let old_role = state.role;
        let old_term = state.current_term;
        if term > state.current_term {
            self.meta.set_term_and_vote(term, None)?;
            state.current_term = term;
            state.voted_for = None;
            state.leader = None;
        }
        if leader.is_some() {
            state.leader = leader;
        } else if state.leader.as_ref() == Some(&self.local) {
            state.leader = None;
        }
        state.role = Role::Follower;
        state.votes.clear();
        state.election_deadline = Instant::now() + random_timeout(self.election_timeout);

        if old_role != Role::Follower || old_term != term {
            tracing::info!(
                term,
                old_term,
                was = %old_role,
                leader = ?state.leader,
                "became follower"
            );
        }
        Ok(())
    }

    /// Start a new election: bump the term and vote for ourselves
    ///
    /// Returns the new term, or `None` if we are leader (no-op).
    pub fn become_candidate(&self) -> Result<Option<Term>> {
        let mut state = self.state.lock();
        if state.role == Role::Leader {
            return Ok(None);
        }

        let term = state.current_term + 1;
        self.meta.set_term_and_vote(term, Some(&self.local))?;
        state.current_term = term;
        state.voted_for = Some(self.local.clone());
        state.role = Role::Candidate;
        state.leader = None;
        state.votes.clear();
        state.votes.insert(self.local.clone());
        state.election_deadline = Instant::now() + random_timeout(self.election_timeout);

        tracing::info!(term, "became candidate");
        Ok(Some(term))
    }

    /// Count a vote granted by `from` in `term`; returns votes held so far
    ///
    /// Votes for an election we are no longer running are ignored (returns 0).
    pub fn record_vote(&self, term: Term, from: &NodeAddr) -> usize {
        let mut state = self.state.lock();
        if state.role != Role::Candidate || state.current_term != term {
            return 0;
        }
        state.votes.insert(from.clone());
        state.votes.len()
    }

    /// Candidate -> leader for `term`; true only for the call that transitions
    pub fn become_leader(&self, term: Term) -> bool {
        let mut state = self.state.lock();
        if state.role != Role::Candidate || state.current_term != term {
            return false;
        }
        state.role = Role::Leader;
        state.leader = Some(self.local.clone());
        state.votes.clear();

        tracing::info!(term, "became leader");
        true
    }

    /// Grant our vote in `term` to `candidate` unless already given to someone else
    ///
    /// The vote is durable before this returns `true`.
    pub fn grant_vote(&self, term: Term, candidate: &NodeAddr) -> Result<bool> {
        let mut state = self.state.lock();
        if term != state.current_term {
            return Ok(false);
        }
        match &state.voted_for {
            Some(existing) if existing != candidate => return Ok(false),
            _ => {}
        }

        self.meta.set_term_and_vote(term, Some(candidate))?;
        state.voted_for = Some(candidate.clone());
        state.election_deadline = Instant::now() + random_timeout(self.election_timeout);
        Ok(true)
    }

    /// Move the commit index forward; smaller or equal values are ignored
    ///
    /// Returns whether the index moved. Wakes the apply engine.
    pub fn advance_commit_index(&self, new_index: LogIndex) -> Result<bool> {
        let mut state = self.state.lock();
        if new_index <= state.commit_index {
            return Ok(false);
        }
        self.meta.set_commit_index(new_index)?;
        state.commit_index = new_index;
        self.commit_tx.send_replace(new_index);
        Ok(true)
    }

    /// Record `index` as applied (persisted first); wakes waiting clients
    pub fn mark_applied(&self, index: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        if index <= state.last_applied {
            return Ok(());
        }
        self.meta.set_last_applied(index)?;
        state.last_applied = index;
        self.applied_tx.send_replace(index);
        Ok(())
    }

    /// Record or clear an apply engine failure; wakes waiting clients on change
    pub fn set_apply_error(&self, error: Option<String>) {
        let mut state = self.state.lock();
        if state.apply_error == error {
            return;
        }
        state.apply_error = error;
        self.applied_tx.send_modify(|_| {});
    }

    pub fn apply_error(&self) -> Option<String> {
        self.state.lock().apply_error.clone()
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftkv_storage::MemEngine;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    fn context() -> (RaftContext, Arc<RaftMeta>) {
        let meta = Arc::new(RaftMeta::open(Arc::new(MemEngine::new())).unwrap());
        let ctx = RaftContext::new(
            addr(1),
            meta.clone(),
            Duration::from_millis(150),
            Duration::from_millis(300),
        );
        (ctx, meta)
    }

    #[tokio::test]
    async fn test_starts_as_follower() {
        let (ctx, _) = context();
        let view = ctx.view();
        assert_eq!(view.role, Role::Follower);
        assert_eq!(view.current_term, 0);
        assert!(view.leader.is_none());
    }

    #[tokio::test]
    async fn test_candidate_persists_self_vote() {
        let (ctx, meta) = context();
        assert_eq!(ctx.become_candidate().unwrap(), Some(1));

        let vote = meta.term_and_vote();
        assert_eq!(vote.term, 1);
        assert_eq!(vote.voted_for, Some(addr(1)));
        assert_eq!(ctx.role(), Role::Candidate);
    }

    #[tokio::test]
    async fn test_become_leader_fires_once() {
        let (ctx, _) = context();
        let term = ctx.become_candidate().unwrap().unwrap();

        assert_eq!(ctx.record_vote(term, &addr(2)), 2);
        assert!(ctx.become_leader(term));
        assert!(!ctx.become_leader(term));
        assert_eq!(ctx.leader(), Some(addr(1)));

        // Late votes after winning are not counted.
        assert_eq!(ctx.record_vote(term, &addr(3)), 0);
        // A leader cannot start an election.
        assert_eq!(ctx.become_candidate().unwrap(), None);
    }

    #[tokio::test]
    async fn test_votes_from_old_election_ignored() {
        let (ctx, _) = context();
        let first = ctx.become_candidate().unwrap().unwrap();
        let second = ctx.become_candidate().unwrap().unwrap();
        assert_eq!(second, first + 1);

        assert_eq!(ctx.record_vote(first, &addr(2)), 0);
        assert!(!ctx.become_leader(first));
        assert_eq!(ctx.record_vote(second, &addr(2)), 2);
    }

    #[tokio::test]
    async fn test_higher_term_steps_down() {
        let (ctx, meta) = context();
        let term = ctx.become_candidate().unwrap().unwrap();
        ctx.become_leader(term);

        ctx.become_follower(term + 3, Some(addr(2))).unwrap();
        let view = ctx.view();
        assert_eq!(view.role, Role::Follower);
        assert_eq!(view.current_term, term + 3);
        assert_eq!(view.voted_for, None);
        assert_eq!(view.leader, Some(addr(2)));
        assert_eq!(meta.term_and_vote().term, term + 3);
    }

    #[tokio::test]
    async fn test_stale_term_does_not_step_down() {
        let (ctx, _) = context();
        ctx.become_follower(5, None).unwrap();
        let term = ctx.become_candidate().unwrap().unwrap();
        ctx.become_leader(term);

        ctx.become_follower(2, Some(addr(9))).unwrap();
        assert!(ctx.is_leader_in(term));
    }

    #[tokio::test]
    async fn test_single_vote_per_term() {
        let (ctx, _) = context();
        ctx.become_follower(4, None).unwrap();

        assert!(ctx.grant_vote(4, &addr(2)).unwrap());
        assert!(ctx.grant_vote(4, &addr(2)).unwrap());
        assert!(!ctx.grant_vote(4, &addr(3)).unwrap());
        assert!(!ctx.grant_vote(3, &addr(3)).unwrap());
    }

    #[tokio::test]
    async fn test_commit_index_is_monotonic() {
        let (ctx, meta) = context();
        let mut rx = ctx.subscribe_commit();

        assert!(ctx.advance_commit_index(5).unwrap());
        assert!(!ctx.advance_commit_index(3).unwrap());
        assert!(!ctx.advance_commit_index(5).unwrap());

        assert_eq!(ctx.commit_index(), 5);
        assert_eq!(meta.commit_index(), 5);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 5);
    }

    #[tokio::test]
    async fn test_mark_applied_persists() {
        let (ctx, meta) = context();
        ctx.mark_applied(2).unwrap();
        ctx.mark_applied(1).unwrap();
        assert_eq!(ctx.last_applied(), 2);
        assert_eq!(meta.last_applied(), 2);
    }

    #[tokio::test]
    async fn test_apply_error_wakes_waiters() {
        let (ctx, _) = context();
        let mut rx = ctx.subscribe_applied();

        ctx.set_apply_error(Some("disk full".into()));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert_eq!(ctx.apply_error().as_deref(), Some("disk full"));

        ctx.set_apply_error(Some("disk full".into()));
        assert!(!rx.has_changed().unwrap());

        ctx.set_apply_error(None);
        assert!(rx.has_changed().unwrap());
        assert!(ctx.apply_error().is_none());
    }

    #[tokio::test]
    async fn test_restart_reloads_term_and_vote() {
        let (ctx, meta) = context();
        ctx.become_follower(6, None).unwrap();
        ctx.grant_vote(6, &addr(3)).unwrap();
        drop(ctx);

        let ctx = RaftContext::new(
            addr(1),
            meta,
            Duration::from_millis(150),
            Duration::from_millis(300),
        );
        let view = ctx.view();
        assert_eq!(view.current_term, 6);
        assert_eq!(view.voted_for, Some(addr(3)));
        assert_eq!(view.role, Role::Follower);
    }
}
