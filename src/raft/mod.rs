pub mod membership;
pub mod message;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub type NodeId = u64;

pub use membership::{ClusterConfig, Member};
pub use node::{ClusterInfo, RaftNode};
pub use state::{EntryType, LogEntry, RaftRole, RaftState};
pub use transport::Transport;
