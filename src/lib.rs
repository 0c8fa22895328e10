pub mod config;
pub mod discovery;
pub mod error;
pub mod persistence;
pub mod raft;
pub mod registry;
pub mod shutdown;
pub mod transport;
