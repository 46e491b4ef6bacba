//! Log entry and RPC message types
//!
//! Everything here crosses the wire as JSON, both between nodes and between
//! clients and nodes.

use raftkv_core::{LogIndex, NodeAddr, RaftKvError, Role, Term};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a log entry does once applied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Put `key -> value` into the state machine
    Write { key: String, value: String },
    /// Remove `key` from the state machine
    Delete { key: String },
    /// Add a member to the cluster
    AddServer { addr: NodeAddr },
    /// Appended by a new leader to commit entries from earlier terms
    Noop,
}

/// A single replicated log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EntryPayload::Write { .. } => "write",
            EntryPayload::Delete { .. } => "delete",
            EntryPayload::AddServer { .. } => "add_server",
            EntryPayload::Noop => "noop",
        }
    }
}

/// RequestVote RPC arguments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate: NodeAddr,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Receiver's current term, for the candidate to update itself
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (empty `entries` is a heartbeat)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: NodeAddr,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Receiver's current term, for the leader to update itself
    pub term: Term,
    pub success: bool,
    /// Receiver's last log index; lets the leader skip back quickly on a mismatch
    pub last_log_index: LogIndex,
}

/// Every request a node can receive, from clients or from other nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum CmdRequest {
    Write { key: String, value: String },
    DirtyWrite { key: String, value: String },
    Delete { key: String },
    Read { key: String },
    DirtyRead { key: String },
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    AddServer { addr: NodeAddr },
    ServerStatus,
}

impl CmdRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::DirtyWrite { .. } => "dirty_write",
            Self::Delete { .. } => "delete",
            Self::Read { .. } => "read",
            Self::DirtyRead { .. } => "dirty_read",
            Self::RequestVote(_) => "request_vote",
            Self::AppendEntries(_) => "append_entries",
            Self::AddServer { .. } => "add_server",
            Self::ServerStatus => "server_status",
        }
    }
}

/// Reply to a [`CmdRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum CmdResponse {
    Ok,
    Value(Option<String>),
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    ServerStatus(ServerStatus),
    Error(CmdError),
}

impl From<RaftKvError> for CmdResponse {
    fn from(e: RaftKvError) -> Self {
        Self::Error(e.into())
    }
}

/// Serializable form of the errors a request can surface
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdError {
    NotLeader { leader: Option<NodeAddr> },
    NoQuorum,
    StaleTerm { current_term: Term },
    Persistence(String),
    Other(String),
}

impl From<RaftKvError> for CmdError {
    fn from(e: RaftKvError) -> Self {
        match e {
            RaftKvError::NotLeader { leader } => Self::NotLeader { leader },
            RaftKvError::NoQuorum => Self::NoQuorum,
            RaftKvError::StaleTerm { current_term } => Self::StaleTerm { current_term },
            RaftKvError::Persistence(msg) => Self::Persistence(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<CmdError> for RaftKvError {
    fn from(e: CmdError) -> Self {
        match e {
            CmdError::NotLeader { leader } => Self::NotLeader { leader },
            CmdError::NoQuorum => Self::NoQuorum,
            CmdError::StaleTerm { current_term } => Self::StaleTerm { current_term },
            CmdError::Persistence(msg) => Self::Persistence(msg),
            CmdError::Other(msg) => Self::Internal(msg),
        }
    }
}

/// Point-in-time view of a node's consensus state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub addr: NodeAddr,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeAddr>,
    pub voted_for: Option<NodeAddr>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub members: Vec<NodeAddr>,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_dash(addr: &Option<NodeAddr>) -> String {
            addr.as_ref().map_or_else(|| "-".to_string(), |a| a.to_string())
        }

        writeln!(
            f,
            "{:<21} {:<9} {:>6} {:<21} {:<21} {:>8} {:>8} {:>8} {:>8}",
            "node", "role", "term", "leader", "voted_for", "last_idx", "last_trm", "commit", "applied"
        )?;
        write!(
            f,
            "{:<21} {:<9} {:>6} {:<21} {:<21} {:>8} {:>8} {:>8} {:>8}",
            self.addr.to_string(),
            self.role.to_string(),
            self.term,
            or_dash(&self.leader),
            or_dash(&self.voted_for),
            self.last_log_index,
            self.last_log_term,
            self.commit_index,
            self.last_applied
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = CmdRequest::Write {
            key: "x".into(),
            value: "1".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "write");
        assert_eq!(json["body"]["key"], "x");

        let back: CmdRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_error_response_wire_format() {
        let leader = NodeAddr::new("127.0.0.1", 8002);
        let resp = CmdResponse::from(RaftKvError::NotLeader {
            leader: Some(leader.clone()),
        });
        let json = serde_json::to_string(&resp).unwrap();
        let back: CmdResponse = serde_json::from_str(&json).unwrap();

        match back {
            CmdResponse::Error(e) => {
                let err: RaftKvError = e.into();
                assert_eq!(err.leader_hint(), Some(&leader));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_internal_errors_flatten_to_other() {
        let e: CmdError = RaftKvError::NotFound(7).into();
        assert_eq!(e, CmdError::Other("log entry not found: 7".into()));
    }

    #[test]
    fn test_status_display() {
        let status = ServerStatus {
            addr: NodeAddr::new("127.0.0.1", 8001),
            role: Role::Leader,
            term: 3,
            leader: Some(NodeAddr::new("127.0.0.1", 8001)),
            voted_for: None,
            commit_index: 10,
            last_applied: 9,
            last_log_index: 11,
            last_log_term: 3,
            members: vec![],
        };
        let text = status.to_string();
        assert!(text.starts_with("node"));
        assert!(text.contains("leader"));
        assert!(text.contains("127.0.0.1:8001"));
        assert_eq!(text.lines().count(), 2);
    }
}
