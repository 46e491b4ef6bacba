//! raftkv Raft - consensus and replication for the key-value store
//!
//! - `log` / `meta`: durable raft log and term/vote metadata
//! - `context`: role, term and commit state behind one lock
//! - `raft`: `RaftCore`, the state shared by every task
//! - `peer`: per-follower replication state and RPCs
//! - `dispatcher`: routing of every inbound request
//! - `apply`, `primary`: apply engine, election timer and heartbeat tasks
//! - `network`: HTTP and in-process transports
//! - `server`: axum routes
//! - `node`: the `RaftNode` facade

mod apply;
pub mod context;
pub mod raft;
mod dispatcher;
pub mod log;
pub mod meta;
pub mod network;
pub mod node;
pub mod peer;
mod primary;
pub mod server;
pub mod types;

pub use network::{HttpTransport, LocalNetwork, LocalTransport, Transport, TransportHandle};
pub use node::RaftNode;
pub use server::router;
pub use types::*;
