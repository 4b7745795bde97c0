use async_trait::async_trait;

use crate::error::Result;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::NodeId;

/// Carries RPCs to other members.
///
/// Implementations may fail or never answer; callers bound every call with
/// their own timeout and treat an error as the peer being unreachable.
/// `addr` is the address recorded for `peer` in the current configuration.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer: NodeId, addr: &str, req: VoteRequest)
        -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer: NodeId,
        addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer: NodeId,
        addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
