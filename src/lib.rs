//! Raft consensus core for a replicated key-value store.
//!
//! A [`RaftNode`] drives leader election, log replication, snapshotting and
//! single-member membership changes on top of a pluggable [`Transport`] and
//! a durable [`storage::Storage`]. Committed commands are applied to a
//! [`state_machine::StateMachine`]; [`KvStore`] is the key-value one.

pub mod config;
pub mod error;
pub mod kv;
pub mod raft;
pub mod state_machine;
pub mod storage;

pub use config::{NodeConfig, PeerConfig};
pub use error::{RaftError, Result, StorageError};
pub use kv::{ClientHandle, KvStore};
pub use raft::{ClusterConfig, ClusterInfo, Member, NodeId, RaftNode, RaftRole, Transport};
pub use state_machine::{ApplyError, StateMachine};
