use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::raft::membership::ClusterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Configuration in effect at `last_included_index`.
    pub config: ClusterConfig,
    pub created_at: DateTime<Utc>,
}

/// A point-in-time image of the state machine plus the log position it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(
        last_included_index: u64,
        last_included_term: u64,
        config: ClusterConfig,
        data: Vec<u8>,
    ) -> Self {
        Self {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
                config,
                created_at: Utc::now(),
            },
            data,
        }
    }

    pub fn last_included_index(&self) -> u64 {
        self.metadata.last_included_index
    }

    pub fn last_included_term(&self) -> u64 {
        self.metadata.last_included_term
    }
}
