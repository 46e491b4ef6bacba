//! Node-to-node transport
//!
//! Every RPC is a [`CmdRequest`] answered by a [`CmdResponse`]. Production
//! nodes talk HTTP/JSON; tests wire nodes together in-process through
//! [`LocalNetwork`], which can also cut links to simulate partitions.

use crate::raft::RaftCore;
use crate::types::{CmdRequest, CmdResponse};
use crate::RaftNode;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use raftkv_core::{NodeAddr, RaftKvError, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Delivers a request to another node and returns its reply
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &NodeAddr, request: CmdRequest) -> Result<CmdResponse>;
}

pub type TransportHandle = Arc<dyn Transport>;

/// HTTP transport posting JSON to `http://{addr}/raft/rpc`
pub struct HttpTransport {
    /// HTTP client
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RaftKvError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn url(to: &NodeAddr) -> String {
        format!("http://{}/raft/rpc", to)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: &NodeAddr, request: CmdRequest) -> Result<CmdResponse> {
        let response = self
            .client
            .post(Self::url(to))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    RaftKvError::NodeUnreachable(to.clone())
                } else {
                    RaftKvError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RaftKvError::Network(format!("HTTP {}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| RaftKvError::Serialization(e.to_string()))
    }
}

/// In-process network connecting nodes of one test cluster
///
/// Nodes are held weakly so a dropped node looks like a crashed one.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeAddr, Weak<RaftCore>>,
    isolated: Mutex<HashSet<NodeAddr>>,
    cut: Mutex<HashSet<(NodeAddr, NodeAddr)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by the node at `local`
    pub fn transport(self: &Arc<Self>, local: NodeAddr) -> TransportHandle {
        Arc::new(LocalTransport {
            local,
            network: self.clone(),
        })
    }

    /// Make `node` reachable at its own address
    pub fn register(&self, node: &RaftNode) {
        let core = node.core();
        self.nodes.insert(core.local().clone(), Arc::downgrade(core));
    }

    pub fn unregister(&self, addr: &NodeAddr) {
        self.nodes.remove(addr);
    }

    /// Drop every message to or from `addr`
    pub fn isolate(&self, addr: &NodeAddr) {
        tracing::debug!(node = %addr, "isolating node");
        self.isolated.lock().insert(addr.clone());
    }

    /// Drop messages between `a` and `b` in both directions
    pub fn cut(&self, a: &NodeAddr, b: &NodeAddr) {
        let mut cut = self.cut.lock();
        cut.insert((a.clone(), b.clone()));
        cut.insert((b.clone(), a.clone()));
    }

    /// Restore every link
    pub fn heal(&self) {
        tracing::debug!("healing all links");
        self.isolated.lock().clear();
        self.cut.lock().clear();
    }

    fn is_blocked(&self, from: &NodeAddr, to: &NodeAddr) -> bool {
        {
            let isolated = self.isolated.lock();
            if isolated.contains(from) || isolated.contains(to) {
                return true;
            }
        }
        self.cut.lock().contains(&(from.clone(), to.clone()))
    }
}

/// One node's view of a [`LocalNetwork`]
pub struct LocalTransport {
    local: NodeAddr,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: &NodeAddr, request: CmdRequest) -> Result<CmdResponse> {
        if self.network.is_blocked(&self.local, to) {
            return Err(RaftKvError::NodeUnreachable(to.clone()));
        }

        let target = self
            .network
            .nodes
            .get(to)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| RaftKvError::NodeUnreachable(to.clone()))?;

        let response = target.dispatch(request).await;

        // The reply can be lost too if the link was cut meanwhile.
        if self.network.is_blocked(to, &self.local) {
            return Err(RaftKvError::NodeUnreachable(to.clone()));
        }
        Ok(response)
    }
}
