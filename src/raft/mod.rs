mod candidate;
pub mod cluster;
pub mod core;
mod follower;
pub mod index_map;
mod leader;
pub mod log;
pub mod metadata;
pub mod node;
pub mod protocol;
pub mod session;
pub mod state;
pub mod timer;

pub use self::cluster::ClusterConfiguration;
pub use self::core::RaftCore;
pub use self::log::{Command, LogEntry, Payload, RaftSnapshot, ReplicatedLog, SnapshotMetadata};
pub use self::metadata::RaftMetadata;
pub use self::node::RaftNode;
pub use self::protocol::{Event, MembershipStatus, RaftMessage};
pub use self::state::{Effect, RaftRole};
