//! Configuration types for raftkv

use crate::error::{RaftKvError, Result};
use crate::types::NodeAddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a raftkv node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address this node listens on and is known by
    pub addr: NodeAddr,

    /// Initial cluster members (may or may not include `addr`).
    ///
    /// Only used on first start; afterwards the membership persisted in the
    /// raft meta store takes precedence.
    pub members: Vec<NodeAddr>,

    /// Data directory for persistent storage
    pub data_dir: PathBuf,

    /// Raft configuration
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let addr = NodeAddr::new("127.0.0.1", 8901);
        Self {
            members: vec![addr.clone()],
            addr,
            data_dir: PathBuf::from("./data"),
            raft: RaftConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| RaftKvError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), addr = %config.addr, "loaded node config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(RaftKvError::Config("members must not be empty".into()));
        }
        self.raft.validate()
    }

    /// Directory of the state machine database
    pub fn state_machine_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Directory of the raft log and meta database
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("log")
    }
}

/// Raft consensus configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Heartbeat interval
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Minimum election timeout
    #[serde(with = "duration_millis")]
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    #[serde(with = "duration_millis")]
    pub election_timeout_max: Duration,

    /// Timeout of a single outbound RPC
    #[serde(with = "duration_millis")]
    pub rpc_timeout: Duration,

    /// How long a client operation may wait for commit or a leadership check
    #[serde(with = "duration_millis")]
    pub proposal_timeout: Duration,

    /// Maximum entries per AppendEntries RPC
    pub max_append_entries: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(500),
            proposal_timeout: Duration::from_secs(3),
            max_append_entries: 100,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftKvError::Config(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftKvError::Config(
                "heartbeat_interval must be shorter than election_timeout_min".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftKvError::Config("max_append_entries must be positive".into()));
        }
        Ok(())
    }
}

// Serde helper for Duration
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
