//! Error types for raftkv

use crate::types::{LogIndex, NodeAddr, Term};
use thiserror::Error;

/// Main error type for raftkv
#[derive(Error, Debug)]
pub enum RaftKvError {
    // Raft errors
    #[error("not leader, current leader is {leader:?}")]
    NotLeader { leader: Option<NodeAddr> },

    #[error("stale term, current term is {current_term}")]
    StaleTerm { current_term: Term },

    #[error("log conflict at index {index}")]
    LogConflict { index: LogIndex },

    #[error("no quorum reachable")]
    NoQuorum,

    #[error("log entry not found: {0}")]
    NotFound(LogIndex),

    // Storage errors
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Network errors
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeAddr),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    Config(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RaftKvError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::NoQuorum | Self::NodeUnreachable(_) | Self::Network(_)
        )
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. })
    }

    /// Leader hint carried by a `NotLeader` error
    pub fn leader_hint(&self) -> Option<&NodeAddr> {
        match self {
            Self::NotLeader { leader } => leader.as_ref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RaftKvError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for raftkv
pub type Result<T> = std::result::Result<T, RaftKvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        let leader = NodeAddr::new("127.0.0.1", 8001);
        let not_leader = RaftKvError::NotLeader {
            leader: Some(leader.clone()),
        };
        assert!(not_leader.is_retriable());
        assert!(not_leader.is_not_leader());
        assert_eq!(not_leader.leader_hint(), Some(&leader));

        assert!(RaftKvError::NoQuorum.is_retriable());
        assert!(!RaftKvError::Persistence("disk full".into()).is_retriable());
        assert!(RaftKvError::NoQuorum.leader_hint().is_none());
    }
}
