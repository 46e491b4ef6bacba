//! Per-member replication state and the RPCs sent to that member
//!
//! A peer never owns the core: every operation borrows it for the duration
//! of one call, so there is no reference cycle between the two.

use crate::raft::RaftCore;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CmdRequest, CmdResponse, RequestVoteRequest,
    RequestVoteResponse,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use raftkv_core::{LogIndex, NodeAddr, RaftKvError, Result, Term};
use std::sync::Arc;

/// Leader-side view of one follower
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerState {
    /// Next log index to send
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the peer
    pub match_index: LogIndex,
    pub vote_granted: bool,
    pub rpc_in_flight: bool,
}

pub struct Peer {
    addr: NodeAddr,
    state: Mutex<PeerState>,
}

/// Every remote member, keyed by address
pub type PeersSet = DashMap<NodeAddr, Arc<Peer>>;

/// Clears `rpc_in_flight` when the replication call ends, even if cancelled
struct InFlight<'a>(&'a Peer);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().rpc_in_flight = false;
    }
}

/// Next index to try after a rejected AppendEntries
pub(crate) fn back_off(next_index: LogIndex, follower_last: LogIndex) -> LogIndex {
    next_index
        .saturating_sub(1)
        .min(follower_last.saturating_add(1))
        .max(1)
}

impl Peer {
    pub fn new(addr: NodeAddr, next_index: LogIndex) -> Self {
        Self {
            addr,
            state: Mutex::new(PeerState {
                next_index: next_index.max(1),
                ..PeerState::default()
            }),
        }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn match_index(&self) -> LogIndex {
        self.state.lock().match_index
    }

    #[cfg(test)]
    pub(crate) fn set_match_index(&self, index: LogIndex) {
        self.state.lock().match_index = index;
    }

    /// Forget everything learned under a previous leader
    pub fn reset(&self, next_index: LogIndex) {
        let mut state = self.state.lock();
        state.next_index = next_index.max(1);
        state.match_index = 0;
        state.vote_granted = false;
    }

    fn try_begin_rpc(&self) -> Option<InFlight<'_>> {
        let mut state = self.state.lock();
        if state.rpc_in_flight {
            return None;
        }
        state.rpc_in_flight = true;
        Some(InFlight(self))
    }

    async fn call(&self, core: &RaftCore, request: CmdRequest) -> Result<CmdResponse> {
        let timeout = core.config().rpc_timeout;
        match tokio::time::timeout(timeout, core.transport().send(&self.addr, request)).await {
            Ok(result) => result,
            Err(_) => Err(RaftKvError::NodeUnreachable(self.addr.clone())),
        }
    }

    /// Ask this peer for its vote in `term`
    pub async fn send_request_vote(&self, core: &Arc<RaftCore>, request: RequestVoteRequest) {
        let term = request.term;
        self.state.lock().vote_granted = false;

        let response = match self.call(core, CmdRequest::RequestVote(request)).await {
            Ok(CmdResponse::RequestVote(response)) => response,
            Ok(other) => {
                tracing::debug!(peer = %self.addr, ?other, "unexpected vote reply");
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %self.addr, term, error = %e, "request vote failed");
                return;
            }
        };

        let RequestVoteResponse {
            term: peer_term,
            vote_granted,
        } = response;
        if peer_term > term {
            core.step_down(peer_term);
            return;
        }
        if !vote_granted {
            tracing::debug!(peer = %self.addr, term, "vote refused");
            return;
        }

        self.state.lock().vote_granted = true;
        let votes = core.context().record_vote(term, &self.addr);
        tracing::debug!(peer = %self.addr, term, votes, "vote granted");
        if votes >= core.quorum() && core.context().become_leader(term) {
            core.on_become_leader(term);
        }
    }

    /// Replicate from `next_index` until this peer has everything we have
    ///
    /// Returns immediately if a previous call for this peer is still running.
    pub async fn send_append_entries(&self, core: &Arc<RaftCore>, term: Term) {
        let Some(_in_flight) = self.try_begin_rpc() else {
            return;
        };

        loop {
            if !core.context().is_leader_in(term) {
                return;
            }

            let request = match self.build_append(core, term) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(peer = %self.addr, term, error = %e, "failed to read log");
                    return;
                }
            };
            let prev = request.prev_log_index;
            let sent = request.entries.len() as LogIndex;

            let response = match self.call(core, CmdRequest::AppendEntries(request)).await {
                Ok(CmdResponse::AppendEntries(response)) => response,
                Ok(CmdResponse::Error(e)) => {
                    tracing::debug!(peer = %self.addr, term, error = ?e, "append entries failed remotely");
                    return;
                }
                Ok(other) => {
                    tracing::debug!(peer = %self.addr, ?other, "unexpected append reply");
                    return;
                }
                Err(e) => {
                    tracing::debug!(peer = %self.addr, term, error = %e, "append entries failed");
                    return;
                }
            };

            if !self.handle_append_response(core, term, prev, sent, &response) {
                return;
            }
        }
    }

    fn build_append(&self, core: &RaftCore, term: Term) -> Result<AppendEntriesRequest> {
        let next_index = self.state.lock().next_index;
        let prev_log_index = next_index - 1;
        let prev_log_term = core.log().term_at(prev_log_index)?;
        let entries = core
            .log()
            .entries_from(next_index, core.config().max_append_entries)?;

        Ok(AppendEntriesRequest {
            term,
            leader: core.local().clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: core.context().commit_index(),
        })
    }

    /// Fold a reply into the peer state; true if another round should follow
    fn handle_append_response(
        &self,
        core: &RaftCore,
        term: Term,
        prev: LogIndex,
        sent: LogIndex,
        response: &AppendEntriesResponse,
    ) -> bool {
        if response.term > term {
            core.step_down(response.term);
            return false;
        }
        if response.term < term {
            // Reply to an RPC from a term we have already left.
            return false;
        }

        if response.success {
            let matched = prev + sent;
            {
                let mut state = self.state.lock();
                state.match_index = state.match_index.max(matched);
                state.next_index = state.match_index + 1;
            }
            if sent > 0 {
                tracing::debug!(peer = %self.addr, term, index = matched, "replicated");
                core.advance_leader_commit(term);
            }
            matched < core.log().last_index()
        } else {
            let mut state = self.state.lock();
            let next_index = back_off(state.next_index, response.last_log_index);
            tracing::debug!(
                peer = %self.addr,
                term,
                from = state.next_index,
                to = next_index,
                "log mismatch, backing off"
            );
            state.next_index = next_index;
            true
        }
    }

    /// Empty AppendEntries used to confirm leadership; true if acknowledged in `term`
    ///
    /// Leaves replication progress alone: a mismatch still counts as an
    /// acknowledgement of our leadership.
    pub async fn send_heartbeat(&self, core: &Arc<RaftCore>, term: Term) -> bool {
        let next_index = self.state.lock().next_index;
        let prev_log_index = next_index - 1;
        let prev_log_term = match core.log().term_at(prev_log_index) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let request = AppendEntriesRequest {
            term,
            leader: core.local().clone(),
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit: core.context().commit_index(),
        };

        match self.call(core, CmdRequest::AppendEntries(request)).await {
            Ok(CmdResponse::AppendEntries(response)) => {
                if response.term > term {
                    core.step_down(response.term);
                    return false;
                }
                response.term == term
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_off_steps_one_at_a_time() {
        assert_eq!(back_off(10, 20), 9);
        assert_eq!(back_off(10, 9), 9);
    }

    #[test]
    fn test_back_off_jumps_to_follower_tail() {
        assert_eq!(back_off(10, 3), 4);
        assert_eq!(back_off(10, 0), 1);
    }

    #[test]
    fn test_back_off_never_below_one() {
        assert_eq!(back_off(1, 0), 1);
        assert_eq!(back_off(1, 5), 1);
    }

    #[test]
    fn test_in_flight_guard() {
        let peer = Peer::new(NodeAddr::new("127.0.0.1", 2), 5);
        let guard = peer.try_begin_rpc();
        assert!(guard.is_some());
        assert!(peer.try_begin_rpc().is_none());
        assert!(peer.state().rpc_in_flight);

        drop(guard);
        assert!(!peer.state().rpc_in_flight);
        assert!(peer.try_begin_rpc().is_some());
    }

    #[test]
    fn test_reset() {
        let peer = Peer::new(NodeAddr::new("127.0.0.1", 2), 0);
        assert_eq!(peer.state().next_index, 1);

        peer.state.lock().match_index = 4;
        peer.reset(7);
        let state = peer.state();
        assert_eq!(state.next_index, 7);
        assert_eq!(state.match_index, 0);
    }
}
