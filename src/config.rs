use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::NodeId;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Address other members use to reach this node. Carried into the
    /// cluster configuration; the transport decides what it means.
    pub advertise_addr: String,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-RPC deadline. Must stay below the minimum election timeout so a
    /// single slow peer cannot stall an election or a replication round.
    pub rpc_timeout_ms: u64,
    /// Deadline for one InstallSnapshot, which carries the whole state
    /// machine image.
    pub snapshot_timeout_ms: u64,
    pub wal_dir: PathBuf,
    /// Retained log length that triggers a snapshot.
    pub snapshot_threshold: u64,
    /// How long `set`/`delete`/membership calls wait for their entry to apply.
    pub commit_timeout_ms: u64,
    /// Read-index deadline, as a multiple of the maximum election timeout.
    pub read_timeout_multiplier: u32,
    pub max_entries_per_append: usize,
    /// Start with an empty membership and wait to be added by an existing
    /// leader instead of bootstrapping from `peers`.
    pub join_existing: bool,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            advertise_addr: "127.0.0.1:50051".to_string(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            snapshot_timeout_ms: 2000,
            wal_dir: PathBuf::from("./data/1"),
            snapshot_threshold: 1000,
            commit_timeout_ms: 5000,
            read_timeout_multiplier: 3,
            max_entries_per_append: 256,
            join_existing: false,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, advertise_addr: impl Into<String>, wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            advertise_addr: advertise_addr.into(),
            wal_dir: wal_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            addr: addr.into(),
        });
        self
    }

    pub fn joining(mut self) -> Self {
        self.join_existing = true;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms * self.read_timeout_multiplier as u64)
    }

    /// Check the timing and sizing invariants the consensus loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={}ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be non-zero and below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return Err(RaftError::InvalidConfig(format!(
                "rpc timeout {}ms must be non-zero and below the election timeout",
                self.rpc_timeout_ms
            )));
        }
        if self.snapshot_timeout_ms < self.rpc_timeout_ms {
            return Err(RaftError::InvalidConfig(format!(
                "snapshot timeout {}ms must be at least the rpc timeout",
                self.snapshot_timeout_ms
            )));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::InvalidConfig(
                "snapshot threshold must be non-zero".to_string(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max entries per append must be non-zero".to_string(),
            ));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        Ok(())
    }
}
