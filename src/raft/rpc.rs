//! Receiver side of the three Raft RPCs.
//!
//! The handlers run against a locked [`RaftState`] and return `Err` when
//! persisting fails, in which case no response must be sent: an unpersisted
//! vote or acknowledgement is worse than silence.

use crate::error::Result;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::NodeId;
use crate::state_machine::StateMachine;

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    my_id: NodeId,
) -> Result<VoteResponse> {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term)?;
    }

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        // Durable before granted
        state.persist_hard_state(state.current_term, Some(req.candidate_id))?;
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(VoteResponse {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: NodeId,
) -> Result<AppendEntriesResponse> {
    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return Ok(rejection(state.current_term, 0, 0));
    }

    // Valid AppendEntries from leader - adopt its term and follow it
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term)?;
    }
    state.leader_id = Some(req.leader_id);

    // Consistency check on prev_log_index. Anything at or below the
    // snapshot boundary is committed and therefore matches.
    let last_index = state.last_log_index();
    if req.prev_log_index > last_index {
        return Ok(rejection(state.current_term, last_index + 1, 0));
    }
    if req.prev_log_index > state.log_offset {
        if let Some(term) = state.term_at(req.prev_log_index) {
            if term != req.prev_log_term {
                let conflict_index = state.first_index_of_term(term).unwrap_or(1);
                tracing::debug!(
                    node_id = my_id,
                    prev_log_index = req.prev_log_index,
                    conflict_term = term,
                    conflict_index,
                    "AppendEntries consistency check failed"
                );
                return Ok(rejection(state.current_term, conflict_index, term));
            }
        }
    }

    // Skip entries we already hold; truncate at the first conflict
    let mut first_new = req.entries.len();
    for (pos, entry) in req.entries.iter().enumerate() {
        if entry.index <= state.log_offset {
            continue;
        }
        match state.term_at(entry.index) {
            Some(term) if term == entry.term => continue,
            Some(_) => {
                tracing::info!(
                    node_id = my_id,
                    from = entry.index,
                    "Truncating conflicting log suffix"
                );
                state.truncate_from(entry.index)?;
                first_new = pos;
                break;
            }
            None => {
                first_new = pos;
                break;
            }
        }
    }
    if first_new < req.entries.len() {
        state.append_entries(req.entries[first_new..].to_vec())?;
        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len() - first_new,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // Update commit index
    let last_new_index = req.prev_log_index + req.entries.len() as u64;
    let commit = req.leader_commit.min(last_new_index);
    if commit > state.commit_index {
        state.commit_index = commit;
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: last_new_index,
        conflict_index: 0,
        conflict_term: 0,
    })
}

/// Handle InstallSnapshot RPC. The state machine is restored from the
/// snapshot first; the log and cursors only move once that succeeded and
/// the snapshot is persisted.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: InstallSnapshotRequest,
    my_id: NodeId,
    state_machine: &mut dyn StateMachine,
) -> Result<InstallSnapshotResponse> {
    if req.term < state.current_term {
        return Ok(InstallSnapshotResponse {
            term: state.current_term,
        });
    }
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term)?;
    }
    state.leader_id = Some(req.leader_id);

    let last_included_index = req.snapshot.last_included_index();
    if last_included_index <= state.commit_index {
        // Nothing we have not already committed
        return Ok(InstallSnapshotResponse {
            term: state.current_term,
        });
    }

    // A blob that fails to restore leaves the log and cursors untouched
    let previous = state_machine.snapshot()?;
    state_machine.restore(&req.snapshot.data)?;
    if let Err(e) = state.install_snapshot(req.snapshot) {
        state_machine.restore(&previous)?;
        return Err(e);
    }

    tracing::info!(
        node_id = my_id,
        last_included_index,
        term = state.current_term,
        "Installed snapshot from leader"
    );

    Ok(InstallSnapshotResponse {
        term: state.current_term,
    })
}

fn rejection(term: u64, conflict_index: u64, conflict_term: u64) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term,
        success: false,
        match_index: 0,
        conflict_index,
        conflict_term,
    }
}
