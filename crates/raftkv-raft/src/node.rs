//! Public face of a raft node
//!
//! [`RaftNode`] owns the background tasks and exposes the client and admin
//! operations. Each operation is routed through the same dispatcher used for
//! requests arriving over the network.

use crate::apply;
use crate::raft::RaftCore;
use crate::log::RaftLog;
use crate::meta::RaftMeta;
use crate::network::TransportHandle;
use crate::primary;
use crate::types::{CmdRequest, CmdResponse, ServerStatus};
use parking_lot::Mutex;
use raftkv_core::{NodeAddr, NodeConfig, RaftKvError, Result};
use raftkv_storage::{EngineHandle, KvStore, RocksEngine};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct RaftNode {
    core: Arc<RaftCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn unexpected(response: CmdResponse) -> RaftKvError {
    RaftKvError::Internal(format!("unexpected response: {:?}", response))
}

fn into_unit(response: CmdResponse) -> Result<()> {
    match response {
        CmdResponse::Ok => Ok(()),
        CmdResponse::Error(e) => Err(e.into()),
        other => Err(unexpected(other)),
    }
}

fn into_value(response: CmdResponse) -> Result<Option<String>> {
    match response {
        CmdResponse::Value(value) => Ok(value),
        CmdResponse::Error(e) => Err(e.into()),
        other => Err(unexpected(other)),
    }
}

impl RaftNode {
    /// Open a node backed by RocksDB under `config.data_dir`
    ///
    /// The state machine and the log/meta live in two separate databases.
    pub fn open(config: &NodeConfig, transport: TransportHandle) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let state_engine: EngineHandle = Arc::new(RocksEngine::open(config.state_machine_path())?);
        let log_engine: EngineHandle = Arc::new(RocksEngine::open(config.log_path())?);
        Self::with_engines(config, state_engine, log_engine, transport)
    }

    /// Build a node over caller-provided engines; tasks are not started yet
    pub fn with_engines(
        config: &NodeConfig,
        state_engine: EngineHandle,
        log_engine: EngineHandle,
        transport: TransportHandle,
    ) -> Result<Self> {
        config.validate()?;

        let log = RaftLog::open(log_engine.clone())?;
        let meta = Arc::new(RaftMeta::open(log_engine)?);
        let kv = Arc::new(KvStore::new(state_engine));
        let core = Arc::new(RaftCore::new(
            config.raft.clone(),
            config.addr.clone(),
            config.members.clone(),
            log,
            meta,
            kv,
            transport,
        ));

        let status = core.server_status();
        tracing::info!(
            node = %status.addr,
            term = status.term,
            last_log_index = status.last_log_index,
            commit_index = status.commit_index,
            members = status.members.len(),
            "raft node opened"
        );

        Ok(Self {
            core,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn core(&self) -> &Arc<RaftCore> {
        &self.core
    }

    pub fn addr(&self) -> &NodeAddr {
        self.core.local()
    }

    /// Spawn the apply engine, election timer and heartbeat ticker
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(apply::run(self.core.clone())));
        tasks.push(tokio::spawn(primary::run_election_timer(self.core.clone())));
        tasks.push(tokio::spawn(primary::run_heartbeat(self.core.clone())));

        if self.core.is_member() && self.core.members().len() == 1 {
            self.core.start_election();
        }
    }

    /// Stop background tasks and wait for them to exit
    pub async fn shutdown(&self) {
        self.core.trigger_shutdown();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.core.local(), "raft node stopped");
    }

    /// Handle a request received from a client or another node
    pub async fn dispatch(&self, request: CmdRequest) -> CmdResponse {
        self.core.dispatch(request).await
    }

    /// Replicated write; returns once applied on the leader
    pub async fn write(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        into_unit(
            self.dispatch(CmdRequest::Write {
                key: key.into(),
                value: value.into(),
            })
            .await,
        )
    }

    /// Write acknowledged after the leader's local append only
    pub async fn dirty_write(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        into_unit(
            self.dispatch(CmdRequest::DirtyWrite {
                key: key.into(),
                value: value.into(),
            })
            .await,
        )
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        into_unit(self.dispatch(CmdRequest::Delete { key: key.into() }).await)
    }

    /// Linearizable read served by the leader
    pub async fn read(&self, key: impl Into<String>) -> Result<Option<String>> {
        into_value(self.dispatch(CmdRequest::Read { key: key.into() }).await)
    }

    /// Read of the local state machine, whatever our role
    pub async fn dirty_read(&self, key: impl Into<String>) -> Result<Option<String>> {
        into_value(self.dispatch(CmdRequest::DirtyRead { key: key.into() }).await)
    }

    pub async fn add_server(&self, addr: NodeAddr) -> Result<()> {
        into_unit(self.dispatch(CmdRequest::AddServer { addr }).await)
    }

    pub fn get_leader(&self) -> Option<NodeAddr> {
        self.core.context().leader()
    }

    pub fn has_leader(&self) -> bool {
        self.get_leader().is_some()
    }

    pub fn is_leader(&self) -> bool {
        self.core.context().is_leader()
    }

    pub fn get_all_nodes(&self) -> Vec<NodeAddr> {
        self.core.members()
    }

    pub fn server_status(&self) -> ServerStatus {
        self.core.server_status()
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.core.trigger_shutdown();
    }
}
