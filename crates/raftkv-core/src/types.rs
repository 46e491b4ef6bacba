//! Core types for raftkv

use crate::error::RaftKvError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raft term (logical clock of leadership epochs)
pub type Term = u64;

/// Position of an entry in the replicated log (1-based, 0 means "none")
pub type LogIndex = u64;

/// Address of a cluster member, `ip:port`
///
/// Members are identified by their address; there is no separate numeric id.
/// Serialized as the `ip:port` string so it can be used as a JSON map key.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddr {
    ip: String,
    port: u16,
}

impl NodeAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for NodeAddr {
    type Err = RaftKvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| RaftKvError::InvalidAddress(s.to_string()))?;
        if ip.is_empty() {
            return Err(RaftKvError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RaftKvError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(ip, port))
    }
}

impl TryFrom<String> for NodeAddr {
    type Error = RaftKvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({}:{})", self.ip, self.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Role of a node in the current term
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Strict majority of a cluster with `members` voters
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}
