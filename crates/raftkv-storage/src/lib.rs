//! raftkv Storage - storage engines and the key-value state machine

pub mod engine;
pub mod kv;

pub use engine::*;
pub use kv::*;
