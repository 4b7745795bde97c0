use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::kv::KvCommand;
use crate::raft::membership::{ClusterConfig, Member};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::rpc;
use crate::raft::state::{EntryType, LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::raft::transport::Transport;
use crate::raft::NodeId;
use crate::state_machine::StateMachine;
use crate::storage::{FileStorage, Snapshot, Storage};

/// Snapshot of who leads and who is in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub members: BTreeMap<NodeId, Member>,
}

/// A caller blocked until the entry at some index is applied
struct Waiter {
    term: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

/// What a replicator should do after one round with its peer
enum Progress {
    /// No longer leader for this term, or the peer left the cluster
    Stop,
    /// More to send right away
    Continue,
    /// Caught up or unreachable; wait for new entries or the next heartbeat
    Idle,
}

enum Outbound {
    Entries(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// The main Raft node that coordinates consensus.
///
/// Background work runs as independent tasks: an election timer, an apply
/// loop, and one replicator per peer while leader. All of them share the
/// node-wide state lock. Locks are always taken in the order
/// state, state machine, waiters.
pub struct RaftNode {
    pub id: NodeId,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    state_machine: Mutex<Box<dyn StateMachine>>,
    last_heartbeat: RwLock<Instant>,
    /// Commit index notifications
    commit_tx: watch::Sender<u64>,
    /// Last log index, bumped whenever the leader appends
    log_tx: watch::Sender<u64>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    replicators: Mutex<HashMap<NodeId, (CancellationToken, JoinHandle<()>)>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RaftNode {
    /// Open the WAL in `config.wal_dir` and recover from it.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = FileStorage::open(&config.wal_dir)?;
        Self::with_storage(config, Box::new(storage), transport, state_machine)
    }

    pub fn with_storage(
        config: NodeConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;
        let state = RaftState::recover(storage, ClusterConfig::from_node_config(&config))?;
        if let Some(snapshot) = &state.snapshot {
            state_machine.restore(&snapshot.data)?;
        }

        tracing::info!(
            node_id = config.node_id,
            term = state.current_term,
            last_log_index = state.last_log_index(),
            snapshot_index = state.log_offset,
            members = state.cluster.members.len(),
            "Recovered raft state"
        );

        let (commit_tx, _) = watch::channel(state.commit_index);
        let (log_tx, _) = watch::channel(state.last_log_index());

        Ok(Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            config,
            transport,
            state_machine: Mutex::new(state_machine),
            last_heartbeat: RwLock::new(Instant::now()),
            commit_tx,
            log_tx,
            waiters: Mutex::new(HashMap::new()),
            replicators: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the election timer and the apply loop.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().run_election_timer()));
        tasks.push(tokio::spawn(self.clone().run_apply_loop()));
        tracing::info!(node_id = self.id, "Raft node started");
    }

    /// Cancel every background task and wait for it, fail pending callers
    /// with `Stopped`, and close the WAL. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        handles.extend(
            self.replicators
                .lock()
                .await
                .drain()
                .map(|(_, (_, handle))| handle),
        );
        for handle in handles {
            let _ = handle.await;
        }

        // Under the state lock, so no caller can register a waiter after the drain
        let mut state = self.state.write().await;
        for (_, waiter) in self.waiters.lock().await.drain() {
            let _ = waiter.tx.send(Err(RaftError::Stopped));
        }
        state.role = RaftRole::Follower;
        state.leader_id = None;
        state.close_storage();
        tracing::info!(node_id = self.id, term = state.current_term, "Raft node stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            let election_timeout = random_election_timeout(
                self.config.election_timeout_min_ms,
                self.config.election_timeout_max_ms,
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(election_timeout) => {}
            }

            let (role, eligible) = {
                let state = self.state.read().await;
                (state.role, state.cluster.is_voter(self.id))
            };
            if role == RaftRole::Leader {
                self.check_quorum().await;
                continue;
            }
            // Nodes outside the configuration wait to be added
            if !eligible {
                continue;
            }

            let elapsed = self.last_heartbeat.read().await.elapsed();
            if elapsed >= election_timeout {
                tracing::info!(
                    node_id = self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Election timeout, starting election"
                );
                self.start_election().await;
            }
        }
    }

    /// Step down if a quorum of voters has not answered recently.
    async fn check_quorum(&self) {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return;
        }
        let window = Duration::from_millis(self.config.election_timeout_max_ms);
        let now = Instant::now();
        let own_vote = usize::from(state.cluster.is_voter(self.id));
        let acked = state
            .cluster
            .voters()
            .filter(|id| *id != self.id)
            .filter(|id| {
                state
                    .last_ack
                    .get(id)
                    .is_some_and(|at| now.duration_since(*at) <= window)
            })
            .count()
            + own_vote;

        if acked < state.cluster.quorum() {
            tracing::warn!(
                node_id = self.id,
                term = state.current_term,
                acked,
                quorum = state.cluster.quorum(),
                "Lost contact with a quorum, stepping down"
            );
            let term = state.current_term;
            self.step_down_locked(&mut state, term);
        }
    }

    /// Start a new election
    async fn start_election(self: &Arc<Self>) {
        let mut state = self.state.write().await;
        if let Err(e) = state.become_candidate(self.id) {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist candidacy");
            return;
        }
        *self.last_heartbeat.write().await = Instant::now();

        let term = state.current_term;
        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        tracing::info!(node_id = self.id, term, "Starting election");

        // Single voter wins on its own vote
        if state.votes_received.len() >= state.cluster.quorum() {
            self.become_leader_locked(&mut state).await;
            return;
        }

        let voters: Vec<(NodeId, String)> = state
            .cluster
            .peers(self.id)
            .filter(|(_, m)| m.voting)
            .map(|(id, m)| (id, m.address.clone()))
            .collect();
        drop(state);

        // Request votes from all peers in parallel
        for (peer_id, addr) in voters {
            let node = self.clone();
            let req = req.clone();
            tokio::spawn(async move { node.request_vote_from(peer_id, addr, req).await });
        }
    }

    async fn request_vote_from(self: Arc<Self>, peer_id: NodeId, addr: String, req: VoteRequest) {
        let term = req.term;
        let call = self.transport.request_vote(peer_id, &addr, req);
        let resp = match timeout(self.config.rpc_timeout(), call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::warn!(node_id = self.id, peer_id, error = %e, "Vote request failed");
                return;
            }
            Err(_) => {
                tracing::warn!(node_id = self.id, peer_id, "Vote request timed out");
                return;
            }
        };
        if self.is_stopped() {
            return;
        }

        let mut state = self.state.write().await;
        if resp.term > state.current_term {
            // Higher term seen, become follower
            self.step_down_locked(&mut state, resp.term);
            return;
        }
        if !resp.vote_granted
            || state.role != RaftRole::Candidate
            || state.current_term != term
            || !state.cluster.is_voter(peer_id)
        {
            return;
        }

        state.votes_received.insert(peer_id);
        tracing::debug!(
            node_id = self.id,
            peer_id,
            votes = state.votes_received.len(),
            "Received vote"
        );
        if state.votes_received.len() >= state.cluster.quorum() {
            self.become_leader_locked(&mut state).await;
        }
    }

    async fn become_leader_locked(self: &Arc<Self>, state: &mut RaftState) {
        state.become_leader(self.id);
        let term = state.current_term;
        tracing::info!(
            node_id = self.id,
            term,
            votes = state.votes_received.len(),
            "Became leader"
        );

        // No-op so entries from earlier terms can commit
        match state.append_entry(EntryType::NoOp, Vec::new()) {
            Ok(entry) => {
                self.log_tx.send_replace(entry.index);
            }
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "Failed to append leader no-op");
                self.step_down_locked(state, term);
                return;
            }
        }

        let mut replicators = self.replicators.lock().await;
        for (_, (token, _)) in replicators.drain() {
            token.cancel();
        }
        let peers: Vec<NodeId> = state.cluster.peers(self.id).map(|(id, _)| id).collect();
        for peer_id in peers {
            let (token, handle) = self.spawn_replicator(peer_id, term);
            replicators.insert(peer_id, (token, handle));
        }
        drop(replicators);

        if state.advance_commit_index(self.id) {
            self.publish_commit(state.commit_index);
        }
    }

    fn step_down_locked(&self, state: &mut RaftState, term: u64) {
        let was_leader = state.role == RaftRole::Leader;
        if let Err(e) = state.become_follower(term) {
            tracing::error!(node_id = self.id, term, error = %e, "Failed to persist term");
            return;
        }
        if was_leader {
            state.leader_id = None;
            tracing::info!(node_id = self.id, term, "Stepped down from leader");
        }
    }

    fn spawn_replicator(
        self: &Arc<Self>,
        peer_id: NodeId,
        term: u64,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(self.clone().run_replicator(peer_id, term, token.clone()));
        (token, handle)
    }

    async fn add_replicator(self: &Arc<Self>, peer_id: NodeId, term: u64) {
        let mut replicators = self.replicators.lock().await;
        if let Some((token, _)) = replicators.remove(&peer_id) {
            token.cancel();
        }
        let (token, handle) = self.spawn_replicator(peer_id, term);
        replicators.insert(peer_id, (token, handle));
    }

    /// Keeps one peer's log in step with ours for as long as we lead `term`.
    async fn run_replicator(self: Arc<Self>, peer_id: NodeId, term: u64, cancel: CancellationToken) {
        let mut log_rx = self.log_tx.subscribe();
        tracing::debug!(node_id = self.id, peer_id, term, "Replicator started");

        loop {
            let progress = tokio::select! {
                _ = cancel.cancelled() => break,
                progress = self.replicate_once(peer_id, term) => progress,
            };
            match progress {
                Progress::Stop => break,
                Progress::Continue => continue,
                Progress::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                        changed = log_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!(node_id = self.id, peer_id, term, "Replicator stopped");
    }

    async fn replicate_once(&self, peer_id: NodeId, term: u64) -> Progress {
        let (addr, outbound) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader || state.current_term != term {
                return Progress::Stop;
            }
            // Removed peers keep receiving entries until the removal commits
            let Some(addr) = state
                .cluster
                .address_of(peer_id)
                .or_else(|| state.committed_cluster.address_of(peer_id))
                .map(str::to_string)
            else {
                return Progress::Stop;
            };

            let next_index = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.last_log_index() + 1);

            if next_index <= state.log_offset {
                let Some(snapshot) = state.snapshot.clone() else {
                    return Progress::Idle;
                };
                let req = InstallSnapshotRequest {
                    term,
                    leader_id: self.id,
                    snapshot,
                };
                (addr, Outbound::Snapshot(req))
            } else {
                let prev_log_index = next_index - 1;
                let Some(prev_log_term) = state.term_at(prev_log_index) else {
                    return Progress::Idle;
                };
                let req = AppendEntriesRequest {
                    term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries: state.entries_from(next_index, self.config.max_entries_per_append),
                    leader_commit: state.commit_index,
                };
                (addr, Outbound::Entries(req))
            }
        };

        match outbound {
            Outbound::Entries(req) => {
                let prev_log_index = req.prev_log_index;
                let last_sent = prev_log_index + req.entries.len() as u64;
                let call = self.transport.append_entries(peer_id, &addr, req);
                match timeout(self.config.rpc_timeout(), call).await {
                    Ok(Ok(resp)) => {
                        self.handle_append_response(peer_id, term, prev_log_index, last_sent, resp)
                            .await
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "AppendEntries failed");
                        Progress::Idle
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "AppendEntries timed out");
                        Progress::Idle
                    }
                }
            }
            Outbound::Snapshot(req) => {
                let last_included_index = req.snapshot.last_included_index();
                let call = self.transport.install_snapshot(peer_id, &addr, req);
                match timeout(self.config.snapshot_timeout(), call).await {
                    Ok(Ok(resp)) => {
                        self.handle_snapshot_response(peer_id, term, last_included_index, resp)
                            .await
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(peer_id, error = %e, "InstallSnapshot failed");
                        Progress::Idle
                    }
                    Err(_) => {
                        tracing::warn!(peer_id, "InstallSnapshot timed out");
                        Progress::Idle
                    }
                }
            }
        }
    }

    async fn handle_append_response(
        &self,
        peer_id: NodeId,
        term: u64,
        prev_log_index: u64,
        last_sent: u64,
        resp: AppendEntriesResponse,
    ) -> Progress {
        let mut state = self.state.write().await;
        if resp.term > state.current_term {
            self.step_down_locked(&mut state, resp.term);
            return Progress::Stop;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return Progress::Stop;
        }
        state.last_ack.insert(peer_id, Instant::now());

        if resp.success {
            // Never trust a match past what this request carried
            let matched = resp.match_index.min(last_sent);
            let match_index = state.match_index.entry(peer_id).or_insert(0);
            if matched > *match_index {
                *match_index = matched;
            }
            state.next_index.insert(peer_id, matched + 1);

            if state.advance_commit_index(self.id) {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.publish_commit(state.commit_index);
            }
            return if matched < state.last_log_index() {
                Progress::Continue
            } else {
                Progress::Idle
            };
        }

        // Jump back using the follower's conflict hint
        let hinted = if resp.conflict_term > 0 {
            state
                .last_index_of_term(resp.conflict_term)
                .map(|index| index + 1)
                .unwrap_or(resp.conflict_index)
        } else {
            resp.conflict_index
        };
        let next_index = hinted.clamp(1, prev_log_index.max(1));
        state.next_index.insert(peer_id, next_index);
        tracing::debug!(
            node_id = self.id,
            peer_id,
            conflict_index = resp.conflict_index,
            conflict_term = resp.conflict_term,
            next_index,
            "Backtracking follower"
        );
        Progress::Continue
    }

    async fn handle_snapshot_response(
        &self,
        peer_id: NodeId,
        term: u64,
        last_included_index: u64,
        resp: InstallSnapshotResponse,
    ) -> Progress {
        let mut state = self.state.write().await;
        if resp.term > state.current_term {
            self.step_down_locked(&mut state, resp.term);
            return Progress::Stop;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return Progress::Stop;
        }
        state.last_ack.insert(peer_id, Instant::now());
        let match_index = state.match_index.entry(peer_id).or_insert(0);
        if last_included_index > *match_index {
            *match_index = last_included_index;
        }
        state.next_index.insert(peer_id, last_included_index + 1);
        tracing::info!(
            node_id = self.id,
            peer_id,
            last_included_index,
            "Follower installed snapshot"
        );
        if state.advance_commit_index(self.id) {
            self.publish_commit(state.commit_index);
        }
        Progress::Continue
    }

    fn publish_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    /// Subscribe to commit index changes
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    async fn run_apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            if self.apply_committed().await {
                self.maybe_snapshot().await;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Apply everything committed so far, in index order. Returns whether
    /// anything was applied.
    async fn apply_committed(&self) -> bool {
        let mut state = self.state.write().await;
        let entries = state.drain_committed();
        if entries.is_empty() {
            return false;
        }
        if entries
            .iter()
            .any(|e| e.entry_type == EntryType::ConfigChange)
        {
            self.on_config_committed(&mut state).await;
        }
        // Taken before the state lock is released so applies stay ordered
        let mut state_machine = self.state_machine.lock().await;
        drop(state);

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            let result = match entry.entry_type {
                EntryType::Normal => state_machine.apply(&entry.command).map_err(RaftError::from),
                EntryType::ConfigChange | EntryType::NoOp => Ok(Vec::new()),
            };
            if let Err(e) = &result {
                if !matches!(e, RaftError::Validation(_)) {
                    tracing::warn!(node_id = self.id, index = entry.index, error = %e, "Apply failed");
                }
            }
            results.push(result);
        }
        drop(state_machine);

        self.resolve_waiters(&entries, results).await;
        tracing::trace!(
            node_id = self.id,
            applied = entries.len(),
            last_applied = entries.last().map(|e| e.index).unwrap_or(0),
            "Applied committed entries"
        );
        true
    }

    async fn resolve_waiters(&self, entries: &[LogEntry], results: Vec<Result<Vec<u8>>>) {
        let mut waiters = self.waiters.lock().await;
        for (entry, result) in entries.iter().zip(results) {
            let Some(waiter) = waiters.remove(&entry.index) else {
                continue;
            };
            // A different term at our index means our entry was overwritten
            let outcome = if waiter.term == entry.term {
                result
            } else {
                Err(RaftError::LeadershipLost)
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    async fn fail_waiters_through(&self, index: u64) {
        let mut waiters = self.waiters.lock().await;
        let superseded: Vec<u64> = waiters.keys().copied().filter(|i| *i <= index).collect();
        for i in superseded {
            if let Some(waiter) = waiters.remove(&i) {
                let _ = waiter.tx.send(Err(RaftError::LeadershipLost));
            }
        }
    }

    async fn on_config_committed(&self, state: &mut RaftState) {
        tracing::info!(
            node_id = self.id,
            members = ?state.committed_cluster.members.keys().collect::<Vec<_>>(),
            "Cluster configuration committed"
        );
        if state.role != RaftRole::Leader {
            return;
        }
        if !state.committed_cluster.contains(self.id) {
            tracing::info!(node_id = self.id, "Removed from cluster, stepping down");
            let term = state.current_term;
            self.step_down_locked(state, term);
            return;
        }

        let mut replicators = self.replicators.lock().await;
        let removed: Vec<NodeId> = replicators
            .keys()
            .copied()
            .filter(|id| !state.cluster.contains(*id) && !state.committed_cluster.contains(*id))
            .collect();
        for peer_id in removed {
            if let Some((token, _)) = replicators.remove(&peer_id) {
                token.cancel();
            }
            state.untrack_peer(peer_id);
            tracing::info!(node_id = self.id, peer_id, "Stopped replicating to removed member");
        }
    }

    /// Snapshot the state machine once the retained log outgrows the threshold.
    async fn maybe_snapshot(&self) {
        let mut state = self.state.write().await;
        if (state.log.len() as u64) <= self.config.snapshot_threshold {
            return;
        }
        let last_applied = state.last_applied;
        if last_applied <= state.log_offset {
            return;
        }
        let Some(term) = state.term_at(last_applied) else {
            return;
        };

        let data = match self.state_machine.lock().await.snapshot() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "State machine snapshot failed");
                return;
            }
        };
        let snapshot = Snapshot::new(last_applied, term, state.committed_cluster.clone(), data);
        let compacted = last_applied - state.log_offset;
        match state.compact(snapshot) {
            Ok(()) => tracing::info!(
                node_id = self.id,
                last_included_index = last_applied,
                compacted,
                retained = state.log.len(),
                "Took snapshot"
            ),
            Err(e) => tracing::warn!(node_id = self.id, error = %e, "Failed to persist snapshot"),
        }
    }

    /// Append an entry as leader and wait for it to apply.
    async fn submit(
        &self,
        entry_type: EntryType,
        command: Vec<u8>,
        wait: Duration,
        on_timeout: RaftError,
    ) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let (index, rx) = {
            let mut state = self.state.write().await;
            self.ensure_running()?;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            let entry = state.append_entry(entry_type, command)?;
            let rx = self.register_waiter(&entry).await;
            self.log_tx.send_replace(entry.index);
            tracing::debug!(index = entry.index, term = entry.term, "Appended command to log");
            if state.advance_commit_index(self.id) {
                self.publish_commit(state.commit_index);
            }
            (entry.index, rx)
        };
        self.await_applied(index, rx, wait, on_timeout).await
    }

    async fn register_waiter(&self, entry: &LogEntry) -> oneshot::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let displaced = self.waiters.lock().await.insert(
            entry.index,
            Waiter {
                term: entry.term,
                tx,
            },
        );
        // The earlier entry at this index was truncated while we were not leader
        if let Some(waiter) = displaced {
            let _ = waiter.tx.send(Err(RaftError::LeadershipLost));
        }
        rx
    }

    async fn await_applied(
        &self,
        index: u64,
        rx: oneshot::Receiver<Result<Vec<u8>>>,
        wait: Duration,
        on_timeout: RaftError,
    ) -> Result<Vec<u8>> {
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Stopped),
            Err(_) => {
                self.waiters.lock().await.remove(&index);
                Err(on_timeout)
            }
        }
    }

    /// Replicate an opaque state machine command and return its result.
    pub async fn propose(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.submit(
            EntryType::Normal,
            command,
            self.config.commit_timeout(),
            RaftError::CommitTimeout,
        )
        .await
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        client_id: &str,
        request_id: u64,
    ) -> Result<()> {
        let command = KvCommand::set(key, value, client_id, request_id).encode()?;
        self.propose(command).await.map(|_| ())
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str, client_id: &str, request_id: u64) -> Result<bool> {
        let command = KvCommand::delete(key, client_id, request_id).encode()?;
        let result = self.propose(command).await?;
        Ok(result.first() == Some(&1))
    }

    /// Read a key. A linearizable read first commits a no-op barrier so the
    /// value reflects every write acknowledged before the call.
    pub async fn get(&self, key: &str, linearizable: bool) -> Result<Option<Vec<u8>>> {
        self.ensure_running()?;
        if linearizable {
            self.read_index().await?;
        }
        Ok(self.state_machine.lock().await.get(key))
    }

    /// Confirm leadership by committing a no-op barrier.
    pub async fn read_index(&self) -> Result<u64> {
        self.submit(
            EntryType::NoOp,
            Vec::new(),
            self.config.read_timeout(),
            RaftError::ReadTimeout,
        )
        .await?;
        Ok(self.state.read().await.last_applied)
    }

    /// Add a voting member. Leader only; waits for the change to commit.
    pub async fn add_node(self: &Arc<Self>, id: NodeId, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        self.change_membership(|cluster| cluster.with_added(id, address), Some(id))
            .await?;
        tracing::info!(node_id = self.id, peer_id = id, "Member added");
        Ok(())
    }

    /// Remove a member, possibly this node. Leader only; waits for the
    /// change to commit.
    pub async fn remove_node(self: &Arc<Self>, id: NodeId) -> Result<()> {
        self.change_membership(
            |cluster| {
                let next = cluster.with_removed(id)?;
                if next.voter_count() == 0 {
                    return Err(RaftError::Validation(
                        "cannot remove the last voting member".to_string(),
                    ));
                }
                Ok(next)
            },
            None,
        )
        .await?;
        tracing::info!(node_id = self.id, peer_id = id, "Member removed");
        Ok(())
    }

    async fn change_membership(
        self: &Arc<Self>,
        plan: impl FnOnce(&ClusterConfig) -> Result<ClusterConfig>,
        new_peer: Option<NodeId>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.ensure_term_committed().await?;

        let (index, rx) = {
            let mut state = self.state.write().await;
            self.ensure_running()?;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            if state.pending_config_index.is_some() {
                return Err(RaftError::ConfigChangeInProgress);
            }
            let next = plan(&state.cluster)?;
            let entry = state.append_config(next)?;
            let rx = self.register_waiter(&entry).await;
            self.log_tx.send_replace(entry.index);
            tracing::info!(
                node_id = self.id,
                index = entry.index,
                members = ?state.cluster.members.keys().collect::<Vec<_>>(),
                "Proposed configuration change"
            );

            if let Some(peer_id) = new_peer {
                state.track_peer(peer_id);
                self.add_replicator(peer_id, state.current_term).await;
            }
            if state.advance_commit_index(self.id) {
                self.publish_commit(state.commit_index);
            }
            (entry.index, rx)
        };
        self.await_applied(index, rx, self.config.commit_timeout(), RaftError::CommitTimeout)
            .await
            .map(|_| ())
    }

    /// A new leader must commit an entry of its own term before changing
    /// membership, or a change from an older term could be lost.
    async fn ensure_term_committed(&self) -> Result<()> {
        let committed = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            state.term_at(state.commit_index) == Some(state.current_term)
        };
        if !committed {
            self.submit(
                EntryType::NoOp,
                Vec::new(),
                self.config.commit_timeout(),
                RaftError::CommitTimeout,
            )
            .await?;
        }
        Ok(())
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.ensure_running()?;
        let mut state = self.state.write().await;

        // Leader stickiness: ignore candidates while a leader is known to be alive
        if req.term > state.current_term {
            let min_timeout = Duration::from_millis(self.config.election_timeout_min_ms);
            let leader_alive = state.role == RaftRole::Leader
                || (state.leader_id.is_some()
                    && self.last_heartbeat.read().await.elapsed() < min_timeout);
            if leader_alive {
                tracing::debug!(
                    node_id = self.id,
                    candidate = req.candidate_id,
                    term = req.term,
                    "Rejecting vote, current leader is alive"
                );
                return Ok(VoteResponse {
                    term: state.current_term,
                    vote_granted: false,
                });
            }
        }

        let response = rpc::handle_request_vote(&mut state, &req, self.id)?;

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }
        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.ensure_running()?;
        let mut state = self.state.write().await;
        let response = rpc::handle_append_entries(&mut state, &req, self.id)?;
        let commit_index = state.commit_index;

        // Any same-term request comes from the current leader
        if response.term == req.term {
            *self.last_heartbeat.write().await = Instant::now();
        }
        drop(state);

        self.publish_commit(commit_index);
        Ok(response)
    }

    /// Handle incoming InstallSnapshot RPC
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.ensure_running()?;
        let term = req.term;
        let mut state = self.state.write().await;
        let mut state_machine = self.state_machine.lock().await;
        let response = rpc::handle_install_snapshot(&mut state, req, self.id, &mut **state_machine)?;
        drop(state_machine);

        if response.term == term {
            *self.last_heartbeat.write().await = Instant::now();
        }
        let commit_index = state.commit_index;
        let last_applied = state.last_applied;
        drop(state);

        self.fail_waiters_through(last_applied).await;
        self.publish_commit(commit_index);
        Ok(response)
    }

    /// Current role
    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID
    pub async fn leader_id(&self) -> Option<NodeId> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.read().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.read().await.last_applied
    }

    pub async fn cluster_info(&self) -> ClusterInfo {
        let state = self.state.read().await;
        ClusterInfo {
            leader_id: if state.role == RaftRole::Leader {
                Some(self.id)
            } else {
                state.leader_id
            },
            term: state.current_term,
            members: state.cluster.members.clone(),
        }
    }
}
