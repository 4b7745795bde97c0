//! Durable storage for Raft state.
//!
//! The consensus core writes through the [`Storage`] trait before it treats
//! anything as durable: a vote is only granted, and an entry only
//! acknowledged, after the corresponding call has returned `Ok`.
//!
//! - [`FileStorage`]: checksummed write-ahead log plus a snapshot file
//! - [`MemStorage`]: in-memory, for tests and throwaway nodes

mod codec;
pub mod snapshot;
pub mod wal;

pub use snapshot::{Snapshot, SnapshotMetadata};
pub use wal::FileStorage;

use crate::error::StorageError;
use crate::raft::state::LogEntry;
use crate::raft::NodeId;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Everything read back from storage when a node starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    /// Retained log, strictly after the snapshot's last included index.
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<Snapshot>,
}

pub trait Storage: Send + Sync {
    /// Persist the current term and vote.
    fn save_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()>;

    /// Append entries to the end of the log.
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Drop every entry with `index >= from`.
    fn truncate_from(&mut self, from: u64) -> StorageResult<()>;

    /// Persist a snapshot and replace the log with `retained`, which holds
    /// only entries after the snapshot's last included index.
    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> StorageResult<()>;

    /// Read back everything persisted so far.
    fn load(&mut self) -> StorageResult<RecoveredState>;

    /// Release underlying handles. Writes after this fail with `Closed`.
    fn close(&mut self);
}

/// In-memory storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemStorage {
    state: RecoveredState,
    closed: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Storage for MemStorage {
    fn save_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()> {
        self.check_open()?;
        self.state.current_term = term;
        self.state.voted_for = voted_for;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        self.check_open()?;
        self.state.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, from: u64) -> StorageResult<()> {
        self.check_open()?;
        self.state.entries.retain(|e| e.index < from);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> StorageResult<()> {
        self.check_open()?;
        self.state.snapshot = Some(snapshot.clone());
        self.state.entries = retained.to_vec();
        Ok(())
    }

    fn load(&mut self) -> StorageResult<RecoveredState> {
        self.check_open()?;
        Ok(self.state.clone())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::membership::ClusterConfig;
    use crate::raft::state::EntryType;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(index, term, EntryType::Normal, vec![index as u8])
    }

    #[test]
    fn test_mem_storage_persists_hard_state() {
        let mut storage = MemStorage::new();
        storage.save_hard_state(5, Some(2)).unwrap();

        let recovered = storage.load().unwrap();
        assert_eq!(recovered.current_term, 5);
        assert_eq!(recovered.voted_for, Some(2));
    }

    #[test]
    fn test_mem_storage_truncates_log() {
        let mut storage = MemStorage::new();
        storage
            .append(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .unwrap();
        storage.truncate_from(2).unwrap();

        let recovered = storage.load().unwrap();
        assert_eq!(recovered.entries, vec![entry(1, 1)]);
    }

    #[test]
    fn test_mem_storage_snapshot_replaces_log() {
        let mut storage = MemStorage::new();
        storage
            .append(&[entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();

        let snapshot = Snapshot::new(2, 1, ClusterConfig::default(), b"blob".to_vec());
        storage.save_snapshot(&snapshot, &[entry(2, 3)]).unwrap();

        let recovered = storage.load().unwrap();
        assert_eq!(recovered.snapshot, Some(snapshot));
        assert_eq!(recovered.entries, vec![entry(2, 3)]);
    }

    #[test]
    fn test_mem_storage_rejects_writes_after_close() {
        let mut storage = MemStorage::new();
        storage.close();
        assert!(matches!(
            storage.save_hard_state(1, None),
            Err(StorageError::Closed)
        ));
    }
}
