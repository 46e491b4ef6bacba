//! Shared state of one raft node
//!
//! [`RaftCore`] ties the log, meta, context, peers, state machine and
//! transport together. The background tasks, the dispatcher and the peers all
//! work through an `Arc<RaftCore>`.

use crate::context::RaftContext;
use crate::log::RaftLog;
use crate::meta::RaftMeta;
use crate::network::TransportHandle;
use crate::peer::{Peer, PeersSet};
use crate::types::{EntryPayload, LogEntry, RequestVoteRequest};
use parking_lot::RwLock;
use raftkv_core::{quorum, LogIndex, NodeAddr, RaftConfig, RaftKvError, Result, Role, Term};
use raftkv_storage::KvStoreHandle;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;

pub struct RaftCore {
    config: RaftConfig,
    local: NodeAddr,
    context: RaftContext,
    log: RaftLog,
    meta: Arc<RaftMeta>,
    kv: KvStoreHandle,
    /// Remote members only
    peers: PeersSet,
    /// Every member, self included once we are part of the cluster
    members: RwLock<Vec<NodeAddr>>,
    transport: TransportHandle,
    /// Wakes the heartbeat ticker when a new entry is proposed
    replicate: Notify,
    shutdown: watch::Sender<bool>,
}

impl RaftCore {
    pub(crate) fn new(
        config: RaftConfig,
        local: NodeAddr,
        seed_members: Vec<NodeAddr>,
        log: RaftLog,
        meta: Arc<RaftMeta>,
        kv: KvStoreHandle,
        transport: TransportHandle,
    ) -> Self {
        let context = RaftContext::new(
            local.clone(),
            meta.clone(),
            config.election_timeout_min,
            config.election_timeout_max,
        );

        let mut members: Vec<NodeAddr> = Vec::new();
        for addr in meta.members().unwrap_or(seed_members) {
            if !members.contains(&addr) {
                members.push(addr);
            }
        }
        let next_index = log.last_index() + 1;
        let peers = PeersSet::new();
        for addr in members.iter().filter(|addr| **addr != local) {
            peers.insert(addr.clone(), Arc::new(Peer::new(addr.clone(), next_index)));
        }

        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            local,
            context,
            log,
            meta,
            kv,
            peers,
            members: RwLock::new(members),
            transport,
            replicate: Notify::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    pub fn context(&self) -> &RaftContext {
        &self.context
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn kv(&self) -> &KvStoreHandle {
        &self.kv
    }

    pub fn peers(&self) -> &PeersSet {
        &self.peers
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn members(&self) -> Vec<NodeAddr> {
        self.members.read().clone()
    }

    pub fn is_member(&self) -> bool {
        self.members.read().contains(&self.local)
    }

    pub fn quorum(&self) -> usize {
        quorum(self.members.read().len())
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn trigger_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn replicate_notified(&self) -> &Notify {
        &self.replicate
    }

    /// Fall back to follower after seeing `term` from someone else
    pub(crate) fn step_down(&self, term: Term) {
        let was_leader = self.context.is_leader();
        if let Err(e) = self.context.become_follower(term, None) {
            tracing::error!(term, error = %e, "failed to persist term while stepping down");
            return;
        }
        if was_leader && !self.context.is_leader() {
            tracing::warn!(term, "lost leadership");
        }
    }

    /// Add `addr` to the membership; called when an `AddServer` entry is applied
    pub(crate) fn add_member(&self, addr: &NodeAddr) -> Result<()> {
        let mut members = self.members.write();
        if members.contains(addr) {
            return Ok(());
        }

        let mut next = members.clone();
        next.push(addr.clone());
        self.meta.set_members(&next)?;
        *members = next;

        if *addr != self.local && !self.peers.contains_key(addr) {
            let next_index = self.log.last_index() + 1;
            self.peers
                .insert(addr.clone(), Arc::new(Peer::new(addr.clone(), next_index)));
        }
        tracing::info!(member = %addr, members = members.len(), "member added");
        Ok(())
    }

    /// Begin an election for the next term
    pub(crate) fn start_election(self: &Arc<Self>) {
        let term = match self.context.become_candidate() {
            Ok(Some(term)) => term,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist candidacy");
                return;
            }
        };

        if self.quorum() <= 1 {
            if self.context.become_leader(term) {
                self.on_become_leader(term);
            }
            return;
        }

        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        for peer in self.peers.iter() {
            let peer = peer.value().clone();
            let core = self.clone();
            let request = RequestVoteRequest {
                term,
                candidate: self.local.clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move { peer.send_request_vote(&core, request).await });
        }
    }

    /// Leader initialisation, run once per won election
    pub(crate) fn on_become_leader(&self, term: Term) {
        let next_index = self.log.last_index() + 1;
        for peer in self.peers.iter() {
            peer.reset(next_index);
        }

        if let Err(e) = self.log.append_new(term, EntryPayload::Noop) {
            tracing::error!(term, error = %e, "failed to append noop, stepping down");
            self.step_down(term);
            return;
        }
        self.advance_leader_commit(term);
        self.replicate.notify_one();
    }

    /// Spawn one replication call per peer not already busy
    pub(crate) fn replicate_all(self: &Arc<Self>, term: Term) {
        for peer in self.peers.iter() {
            let peer = peer.value().clone();
            let core = self.clone();
            tokio::spawn(async move { peer.send_append_entries(&core, term).await });
        }
    }

    /// Move the commit index to the highest entry of `term` held by a majority
    pub(crate) fn advance_leader_commit(&self, term: Term) {
        if !self.context.is_leader_in(term) {
            return;
        }

        let last_index = self.log.last_index();
        let members = self.members.read().clone();
        let mut matched: Vec<LogIndex> = members
            .iter()
            .map(|addr| {
                if *addr == self.local {
                    last_index
                } else {
                    self.peers.get(addr).map_or(0, |peer| peer.match_index())
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[quorum(members.len()) - 1];
        if candidate <= self.context.commit_index() {
            return;
        }
        // Only entries of the current term are committed by counting.
        match self.log.term_at(candidate) {
            Ok(t) if t == term => {}
            _ => return,
        }

        match self.context.advance_commit_index(candidate) {
            Ok(true) => tracing::debug!(term, index = candidate, "commit index advanced"),
            Ok(false) => {}
            Err(e) => tracing::error!(term, index = candidate, error = %e, "failed to persist commit index"),
        }
    }

    /// Append `payload` as leader and start replicating it
    pub(crate) fn propose(&self, payload: EntryPayload) -> Result<LogEntry> {
        let view = self.context.view();
        if view.role != Role::Leader {
            return Err(RaftKvError::NotLeader {
                leader: view.leader,
            });
        }

        let entry = self.log.append_new(view.current_term, payload)?;
        tracing::debug!(term = entry.term, index = entry.index, kind = entry.kind(), "proposed");
        self.advance_leader_commit(entry.term);
        self.replicate.notify_one();
        Ok(entry)
    }

    /// Wait until `entry` is applied and check it survived
    pub(crate) async fn wait_applied(&self, entry: &LogEntry) -> Result<()> {
        let deadline = Instant::now() + self.config.proposal_timeout;
        if let Err(e) = self.wait_applied_index(entry.index, deadline).await {
            tracing::warn!(term = entry.term, index = entry.index, error = %e, "proposal not applied");
            return Err(e);
        }

        match self.log.term_at(entry.index) {
            Ok(term) if term == entry.term => Ok(()),
            _ => {
                tracing::warn!(term = entry.term, index = entry.index, "proposal overwritten by a new leader");
                Err(RaftKvError::NotLeader {
                    leader: self.context.leader(),
                })
            }
        }
    }

    /// Wait until `last_applied >= index`; `NoQuorum` past `deadline`
    ///
    /// Fails with `Persistence` as soon as the apply engine reports an error.
    pub(crate) async fn wait_applied_index(&self, index: LogIndex, deadline: Instant) -> Result<()> {
        let mut applied = self.context.subscribe_applied();
        let wait = async {
            loop {
                if *applied.borrow_and_update() >= index {
                    return Ok(());
                }
                if let Some(error) = self.context.apply_error() {
                    return Err(RaftKvError::Persistence(error));
                }
                if applied.changed().await.is_err() {
                    return Err(RaftKvError::Internal("node shut down".into()));
                }
            }
        };
        tokio::time::timeout_at(deadline, wait)
            .await
            .unwrap_or(Err(RaftKvError::NoQuorum))
    }

    /// Index a consistent read must wait for, after leadership is confirmed
    pub(crate) async fn read_index(self: &Arc<Self>) -> Result<LogIndex> {
        let view = self.context.view();
        if view.role != Role::Leader {
            return Err(RaftKvError::NotLeader {
                leader: view.leader,
            });
        }
        let term = view.current_term;
        let deadline = Instant::now() + self.config.proposal_timeout;

        // The commit index is only trustworthy once an entry of our own term
        // (the election noop) has committed.
        let mut commit = self.context.subscribe_commit();
        let committed_in_term = async {
            loop {
                let index = *commit.borrow_and_update();
                if matches!(self.log.term_at(index), Ok(t) if t == term) {
                    return Ok(index);
                }
                if !self.context.is_leader_in(term) {
                    return Err(RaftKvError::NotLeader {
                        leader: self.context.leader(),
                    });
                }
                if commit.changed().await.is_err() {
                    return Err(RaftKvError::Internal("node shut down".into()));
                }
            }
        };
        let read_index = tokio::time::timeout_at(deadline, committed_in_term)
            .await
            .unwrap_or(Err(RaftKvError::NoQuorum))?;

        tokio::time::timeout_at(deadline, self.confirm_leadership(term))
            .await
            .unwrap_or(Err(RaftKvError::NoQuorum))?;

        self.wait_applied_index(read_index, deadline).await?;
        Ok(read_index)
    }

    /// One heartbeat round; Ok once a majority (self included) acknowledges `term`
    pub(crate) async fn confirm_leadership(self: &Arc<Self>, term: Term) -> Result<()> {
        let needed = self.quorum();
        let mut acks = usize::from(self.is_member());
        if acks >= needed {
            return Ok(());
        }

        let mut round = JoinSet::new();
        for peer in self.peers.iter() {
            let peer = peer.value().clone();
            let core = self.clone();
            round.spawn(async move { peer.send_heartbeat(&core, term).await });
        }

        while let Some(result) = round.join_next().await {
            if matches!(result, Ok(true)) {
                acks += 1;
                if acks >= needed {
                    return if self.context.is_leader_in(term) {
                        Ok(())
                    } else {
                        Err(RaftKvError::NotLeader {
                            leader: self.context.leader(),
                        })
                    };
                }
            }
        }

        if !self.context.is_leader_in(term) {
            return Err(RaftKvError::NotLeader {
                leader: self.context.leader(),
            });
        }
        tracing::warn!(term, acks, needed, "leadership not confirmed by a majority");
        Err(RaftKvError::NoQuorum)
    }
}
