//! raftkv Core - Core types, errors and configuration shared by all raftkv crates

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;
