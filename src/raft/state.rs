use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::raft::membership::ClusterConfig;
use crate::raft::NodeId;
use crate::storage::{MemStorage, Snapshot, Storage};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// What a log entry's command bytes mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Opaque command for the state machine
    Normal,
    /// Encoded [`ClusterConfig`] holding the full new membership
    ConfigChange,
    /// Empty entry appended on election and for read barriers
    NoOp,
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, entry_type: EntryType, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type,
            command,
        }
    }
}

/// Persistent and volatile state of one node.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`),
///   and the vote is persisted before it is granted
/// - Candidate must receive a majority of the voting members' votes
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_entry()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting entries are truncated before appending
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// If a server has applied a log entry at a given index, no other server will
/// ever apply a different entry for that index. Enforced by:
/// - Entries are only applied after being committed (`last_applied <= commit_index`)
/// - Committed entries are never overwritten (Leader Completeness)
///
/// Every mutation of persistent state goes through [`Storage`] first; the
/// in-memory copy only changes once the write has returned `Ok`.
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    /// Entries after the snapshot: `log[0].index == log_offset + 1`
    pub log: Vec<LogEntry>,

    // Snapshot cursor
    pub log_offset: u64,
    pub snapshot_term: u64,
    pub snapshot: Option<Snapshot>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
    /// Last successful response from each peer, for CheckQuorum
    pub last_ack: HashMap<NodeId, Instant>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<NodeId>,

    // Votes received in current election (for candidates)
    pub votes_received: HashSet<NodeId>,

    /// Effective configuration: the latest appended one on a leader driving
    /// a change, otherwise the latest committed one.
    pub cluster: ClusterConfig,
    pub committed_cluster: ClusterConfig,
    /// Index of the uncommitted ConfigChange entry, if one is in flight
    pub pending_config_index: Option<u64>,

    storage: Box<dyn Storage>,
}

impl std::fmt::Debug for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("role", &self.role)
            .field("leader_id", &self.leader_id)
            .field("log_offset", &self.log_offset)
            .field("last_log_index", &self.last_log_index())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl RaftState {
    /// Empty state backed by in-memory storage.
    pub fn new() -> Self {
        Self::with_storage(Box::new(MemStorage::new()), ClusterConfig::default())
    }

    /// Empty state writing through `storage`. Nothing is loaded.
    pub fn with_storage(storage: Box<dyn Storage>, cluster: ClusterConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            log_offset: 0,
            snapshot_term: 0,
            snapshot: None,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
            committed_cluster: cluster.clone(),
            cluster,
            pending_config_index: None,
            storage,
        }
    }

    /// Rebuild state from whatever `storage` holds.
    ///
    /// With a snapshot, the commit and apply cursors start at its last
    /// included index and its configuration replaces `initial_cluster`.
    /// Retained entries are re-applied once a leader re-establishes the
    /// commit index.
    pub fn recover(mut storage: Box<dyn Storage>, initial_cluster: ClusterConfig) -> Result<Self> {
        let recovered = storage.load()?;
        let mut state = Self::with_storage(storage, initial_cluster);
        state.current_term = recovered.current_term;
        state.voted_for = recovered.voted_for;

        if let Some(snapshot) = recovered.snapshot {
            state.log_offset = snapshot.last_included_index();
            state.snapshot_term = snapshot.last_included_term();
            state.commit_index = state.log_offset;
            state.last_applied = state.log_offset;
            state.cluster = snapshot.metadata.config.clone();
            state.committed_cluster = snapshot.metadata.config.clone();
            state.snapshot = Some(snapshot);
        }
        state.log = recovered.entries;
        Ok(state)
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.log_offset)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`, including the snapshot boundary.
    /// `None` if the index is compacted away or past the end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.log_offset {
            return Some(self.snapshot_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed, absolute)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.log_offset {
            return None;
        }
        self.log.get((index - self.log_offset - 1) as usize)
    }

    /// Up to `max` entries starting from `start` (inclusive)
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.log_offset + 1);
        let pos = (start - self.log_offset - 1) as usize;
        if pos >= self.log.len() {
            return Vec::new();
        }
        let end = pos.saturating_add(max).min(self.log.len());
        self.log[pos..end].to_vec()
    }

    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().find(|e| e.term == term).map(|e| e.index)
    }

    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    /// Persist term and vote, then adopt them.
    pub fn persist_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> Result<()> {
        self.storage.save_hard_state(term, voted_for)?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Append a new entry at the current term
    pub fn append_entry(&mut self, entry_type: EntryType, command: Vec<u8>) -> Result<LogEntry> {
        let entry = LogEntry::new(
            self.last_log_index() + 1,
            self.current_term,
            entry_type,
            command,
        );
        self.storage.append(std::slice::from_ref(&entry))?;
        self.log.push(entry.clone());
        Ok(entry)
    }

    /// Append entries received from a leader. They must directly follow the
    /// current last index.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage.append(&entries)?;
        self.log.extend(entries);
        Ok(())
    }

    /// Drop every entry with `index >= from`
    pub fn truncate_from(&mut self, from: u64) -> Result<()> {
        self.storage.truncate_from(from)?;
        let keep = from.saturating_sub(self.log_offset + 1) as usize;
        self.log.truncate(keep);
        Ok(())
    }

    /// Append a ConfigChange entry and make `config` effective immediately.
    /// Leader only.
    pub fn append_config(&mut self, config: ClusterConfig) -> Result<LogEntry> {
        let entry = self.append_entry(EntryType::ConfigChange, config.encode()?)?;
        self.cluster = config;
        self.pending_config_index = Some(entry.index);
        Ok(entry)
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        // Candidate's log is up-to-date if:
        // 1. Their last term is greater, OR
        // 2. Terms are equal and their index is >= ours
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower state, adopting `term` if it is newer.
    /// A vote already cast in the same term is kept.
    pub fn become_follower(&mut self, term: u64) -> Result<()> {
        if term > self.current_term {
            self.persist_hard_state(term, None)?;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.last_ack.clear();
        // An uncommitted change only binds the leader that appended it
        self.cluster = self.committed_cluster.clone();
        self.pending_config_index = None;
        Ok(())
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: NodeId) -> Result<()> {
        self.persist_hard_state(self.current_term + 1, Some(my_id))?;
        self.role = RaftRole::Candidate;
        self.votes_received.clear();
        self.votes_received.insert(my_id); // Vote for self
        self.leader_id = None;
        Ok(())
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: NodeId) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.votes_received.clear();

        // A change appended by an earlier leader but not yet applied here is
        // the one this leader must finish.
        let pending = self
            .log
            .iter()
            .rev()
            .take_while(|e| e.index > self.last_applied)
            .find(|e| e.entry_type == EntryType::ConfigChange)
            .and_then(|e| match ClusterConfig::decode(&e.command) {
                Ok(config) => Some((e.index, config)),
                Err(err) => {
                    tracing::warn!(index = e.index, error = %err, "Undecodable config entry");
                    None
                }
            });
        if let Some((index, config)) = pending {
            self.cluster = config;
            self.pending_config_index = Some(index);
        }

        // Initialize next_index and match_index for all peers
        self.next_index.clear();
        self.match_index.clear();
        self.last_ack.clear();
        let peers: Vec<NodeId> = self.cluster.peers(my_id).map(|(id, _)| id).collect();
        for peer_id in peers {
            self.track_peer(peer_id);
        }
    }

    /// Start replication bookkeeping for a peer as if it had just acked.
    pub fn track_peer(&mut self, peer_id: NodeId) {
        let next = self.last_log_index() + 1;
        self.next_index.insert(peer_id, next);
        self.match_index.insert(peer_id, 0);
        self.last_ack.insert(peer_id, Instant::now());
    }

    pub fn untrack_peer(&mut self, peer_id: NodeId) {
        self.next_index.remove(&peer_id);
        self.match_index.remove(&peer_id);
        self.last_ack.remove(&peer_id);
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority of voters. Returns whether it moved.
    pub fn advance_commit_index(&mut self, my_id: NodeId) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }
        let candidate =
            self.cluster
                .committed_index(my_id, self.last_log_index(), &self.match_index);
        // Only commit entries from current term
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Take every committed but unapplied entry, advancing `last_applied`.
    /// Committed ConfigChange entries update the committed configuration here.
    pub fn drain_committed(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.get_entry(index).cloned() else {
                break;
            };
            if entry.entry_type == EntryType::ConfigChange {
                self.apply_config_entry(&entry);
            }
            self.last_applied = index;
            entries.push(entry);
        }
        entries
    }

    fn apply_config_entry(&mut self, entry: &LogEntry) {
        let config = match ClusterConfig::decode(&entry.command) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(index = entry.index, error = %e, "Undecodable config entry");
                return;
            }
        };
        if self.role != RaftRole::Leader {
            self.cluster = config.clone();
        }
        self.committed_cluster = config;
        if self
            .pending_config_index
            .is_some_and(|pending| pending <= entry.index)
        {
            self.pending_config_index = None;
        }
    }

    /// Replace the whole log with a snapshot received from the leader.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.storage.save_snapshot(&snapshot, &[])?;
        let index = snapshot.last_included_index();
        self.log.clear();
        self.log_offset = index;
        self.snapshot_term = snapshot.last_included_term();
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        self.cluster = snapshot.metadata.config.clone();
        self.committed_cluster = snapshot.metadata.config.clone();
        self.pending_config_index = None;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Persist a locally taken snapshot and drop the entries it covers.
    pub fn compact(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.last_included_index();
        if index <= self.log_offset {
            return Ok(());
        }
        let covered = ((index - self.log_offset) as usize).min(self.log.len());
        self.storage.save_snapshot(&snapshot, &self.log[covered..])?;
        self.log.drain(..covered);
        self.log_offset = index;
        self.snapshot_term = snapshot.last_included_term();
        self.snapshot = Some(snapshot);
        Ok(())
    }

    pub fn close_storage(&mut self) {
        self.storage.close();
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
