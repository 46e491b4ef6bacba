//! Request routing
//!
//! Every inbound request, from a client or another node, passes through
//! [`RaftCore::dispatch`]. Failures are folded into [`CmdResponse::Error`] so
//! the caller always gets a reply.

use crate::raft::RaftCore;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CmdRequest, CmdResponse, EntryPayload,
    RequestVoteRequest, RequestVoteResponse, ServerStatus,
};
use raftkv_core::{NodeAddr, RaftKvError, Result};
use std::sync::Arc;

impl RaftCore {
    pub async fn dispatch(self: &Arc<Self>, request: CmdRequest) -> CmdResponse {
        let name = request.name();
        let result = match request {
            CmdRequest::Write { key, value } => self
                .replicated_write(EntryPayload::Write { key, value })
                .await
                .map(|_| CmdResponse::Ok),
            CmdRequest::DirtyWrite { key, value } => self
                .propose(EntryPayload::Write { key, value })
                .map(|_| CmdResponse::Ok),
            CmdRequest::Delete { key } => self
                .replicated_write(EntryPayload::Delete { key })
                .await
                .map(|_| CmdResponse::Ok),
            CmdRequest::Read { key } => self.consistent_read(&key).await.map(CmdResponse::Value),
            CmdRequest::DirtyRead { key } => self.kv().get(&key).map(CmdResponse::Value),
            CmdRequest::RequestVote(request) => self
                .handle_request_vote(request)
                .map(CmdResponse::RequestVote),
            CmdRequest::AppendEntries(request) => self
                .handle_append_entries(request)
                .map(CmdResponse::AppendEntries),
            CmdRequest::AddServer { addr } => self.add_server(addr).await.map(|_| CmdResponse::Ok),
            CmdRequest::ServerStatus => Ok(CmdResponse::ServerStatus(self.server_status())),
        };

        result.unwrap_or_else(|e| {
            if !e.is_not_leader() {
                tracing::debug!(request = name, error = %e, "request failed");
            }
            CmdResponse::from(e)
        })
    }

    async fn replicated_write(&self, payload: EntryPayload) -> Result<()> {
        let entry = self.propose(payload)?;
        self.wait_applied(&entry).await
    }

    async fn consistent_read(self: &Arc<Self>, key: &str) -> Result<Option<String>> {
        self.read_index().await?;
        self.kv().get(key)
    }

    async fn add_server(&self, addr: NodeAddr) -> Result<()> {
        if self.members().contains(&addr) {
            // Proposing is still reserved to the leader.
            if !self.context().is_leader() {
                return Err(RaftKvError::NotLeader {
                    leader: self.context().leader(),
                });
            }
            return Ok(());
        }
        tracing::info!(member = %addr, "proposing new member");
        self.replicated_write(EntryPayload::AddServer { addr }).await
    }

    pub(crate) fn server_status(&self) -> ServerStatus {
        let view = self.context().view();
        let (last_log_index, last_log_term) = self.log().last_index_and_term();
        ServerStatus {
            addr: self.local().clone(),
            role: view.role,
            term: view.current_term,
            leader: view.leader,
            voted_for: view.voted_for,
            commit_index: view.commit_index,
            last_applied: view.last_applied,
            last_log_index,
            last_log_term,
            members: self.members(),
        }
    }

    pub(crate) fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let current_term = self.context().current_term();
        if request.term < current_term {
            tracing::debug!(
                candidate = %request.candidate,
                term = request.term,
                current_term,
                "rejecting vote for stale term"
            );
            return Ok(RequestVoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }
        if request.term > current_term {
            self.step_down(request.term);
        }

        let (last_index, last_term) = self.log().last_index_and_term();
        let up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);

        let vote_granted = up_to_date && self.context().grant_vote(request.term, &request.candidate)?;
        tracing::debug!(
            candidate = %request.candidate,
            term = request.term,
            vote_granted,
            up_to_date,
            "request vote"
        );

        Ok(RequestVoteResponse {
            term: self.context().current_term(),
            vote_granted,
        })
    }

    pub(crate) fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let current_term = self.context().current_term();
        if request.term < current_term {
            tracing::debug!(
                leader = %request.leader,
                term = request.term,
                current_term,
                "rejecting append entries from stale term"
            );
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                last_log_index: self.log().last_index(),
            });
        }

        self.context()
            .become_follower(request.term, Some(request.leader.clone()))?;

        let prev_matches = matches!(
            self.log().term_at(request.prev_log_index),
            Ok(term) if term == request.prev_log_term
        );
        if !prev_matches {
            let last_log_index = self.log().last_index();
            tracing::debug!(
                leader = %request.leader,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                last_log_index,
                "log mismatch"
            );
            return Ok(AppendEntriesResponse {
                term: request.term,
                success: false,
                last_log_index,
            });
        }

        self.log().append(&request.entries)?;
        let last_new = request.prev_log_index + request.entries.len() as u64;
        self.context()
            .advance_commit_index(request.leader_commit.min(last_new))?;

        Ok(AppendEntriesResponse {
            term: request.term,
            success: true,
            last_log_index: self.log().last_index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RaftLog;
    use crate::meta::RaftMeta;
    use crate::network::LocalNetwork;
    use crate::types::LogEntry;
    use raftkv_core::{RaftConfig, RaftKvError, Role, Term};
    use raftkv_storage::{KvStore, MemEngine};

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    fn follower() -> Arc<RaftCore> {
        let engine = Arc::new(MemEngine::new());
        let network = LocalNetwork::new();
        Arc::new(RaftCore::new(
            RaftConfig::default(),
            addr(1),
            vec![addr(1), addr(2), addr(3)],
            RaftLog::open(engine.clone()).unwrap(),
            Arc::new(RaftMeta::open(engine).unwrap()),
            Arc::new(KvStore::in_memory()),
            network.transport(addr(1)),
        ))
    }

    fn vote(term: Term, candidate: u16, last_log_index: u64, last_log_term: Term) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate: addr(candidate),
            last_log_index,
            last_log_term,
        }
    }

    fn append(term: Term, prev: (u64, Term), entries: Vec<LogEntry>, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader: addr(2),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    fn write(index: u64, term: Term) -> LogEntry {
        LogEntry::new(
            index,
            term,
            EntryPayload::Write {
                key: format!("k{}", index),
                value: "v".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_grants_one_vote_per_term() {
        let core = follower();

        let resp = core.handle_request_vote(vote(1, 2, 0, 0)).unwrap();
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 1);

        // Repeat request from the same candidate is granted again.
        assert!(core.handle_request_vote(vote(1, 2, 0, 0)).unwrap().vote_granted);
        assert!(!core.handle_request_vote(vote(1, 3, 0, 0)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_rejects_stale_vote_request() {
        let core = follower();
        core.context().become_follower(5, None).unwrap();

        let resp = core.handle_request_vote(vote(4, 2, 10, 4)).unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn test_refuses_candidate_with_older_log() {
        let core = follower();
        core.handle_append_entries(append(2, (0, 0), vec![write(1, 1), write(2, 2)], 0))
            .unwrap();

        // Lower last term loses even with a longer log.
        assert!(!core.handle_request_vote(vote(3, 3, 5, 1)).unwrap().vote_granted);
        // Same last term but shorter log loses.
        assert!(!core.handle_request_vote(vote(3, 3, 1, 2)).unwrap().vote_granted);
        // Equal log wins.
        assert!(core.handle_request_vote(vote(3, 3, 2, 2)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_newer_term_vote_request_steps_leader_down() {
        let core = follower();
        let term = core.context().become_candidate().unwrap().unwrap();
        core.context().become_leader(term);

        let resp = core.handle_request_vote(vote(term + 1, 2, 0, 0)).unwrap();
        assert_eq!(resp.term, term + 1);
        assert_eq!(core.context().role(), Role::Follower);
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term() {
        let core = follower();
        core.context().become_follower(3, None).unwrap();

        let resp = core
            .handle_append_entries(append(2, (0, 0), vec![write(1, 2)], 0))
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
        assert_eq!(core.log().last_index(), 0);
    }

    #[tokio::test]
    async fn test_append_entries_adopts_leader() {
        let core = follower();
        let term = core.context().become_candidate().unwrap().unwrap();

        let resp = core
            .handle_append_entries(append(term, (0, 0), vec![], 0))
            .unwrap();
        assert!(resp.success);
        let view = core.context().view();
        assert_eq!(view.role, Role::Follower);
        assert_eq!(view.leader, Some(addr(2)));
    }

    #[tokio::test]
    async fn test_append_entries_reports_tail_on_gap() {
        let core = follower();
        core.handle_append_entries(append(1, (0, 0), vec![write(1, 1)], 0))
            .unwrap();

        let resp = core
            .handle_append_entries(append(1, (5, 1), vec![write(6, 1)], 0))
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.last_log_index, 1);
    }

    #[tokio::test]
    async fn test_append_entries_commit_bounded_by_new_entries() {
        let core = follower();
        let resp = core
            .handle_append_entries(append(1, (0, 0), vec![write(1, 1), write(2, 1)], 10))
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.last_log_index, 2);
        assert_eq!(core.context().commit_index(), 2);
    }

    #[tokio::test]
    async fn test_append_entries_overwrites_conflict() {
        let core = follower();
        core.handle_append_entries(append(1, (0, 0), vec![write(1, 1), write(2, 1), write(3, 1)], 1))
            .unwrap();

        let resp = core
            .handle_append_entries(append(2, (1, 1), vec![write(2, 2)], 1))
            .unwrap();
        assert!(resp.success);
        assert_eq!(core.log().last_index_and_term(), (2, 2));
    }

    #[tokio::test]
    async fn test_follower_refuses_client_writes() {
        let core = follower();
        core.handle_append_entries(append(1, (0, 0), vec![], 0)).unwrap();

        let resp = core
            .dispatch(CmdRequest::Write {
                key: "x".into(),
                value: "1".into(),
            })
            .await;
        match resp {
            CmdResponse::Error(e) => {
                let err: RaftKvError = e.into();
                assert_eq!(err.leader_hint(), Some(&addr(2)));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dirty_read_serves_local_state() {
        let core = follower();
        core.kv().put("x", "0").unwrap();

        let resp = core.dispatch(CmdRequest::DirtyRead { key: "x".into() }).await;
        assert_eq!(resp, CmdResponse::Value(Some("0".into())));
    }
}
