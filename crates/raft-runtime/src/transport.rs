//! # transport
//!
//! why: keep the replica independent from how rpcs reach a peer
//! relations: implemented by network.rs (in-process); called from replica's election and replication tasks
//! what: Transport trait, one method per raft rpc

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};

use crate::RpcError;

/// Channel factory for calls from one replica to its peers.
///
/// Implementations must be `Send + Sync` for use across async tasks. A
/// returned error is always treated as transient by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RpcError>;

    async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError>;

    /// Liveness probe used by pre-vote: does `peer` answer at all?
    async fn reply_success(&self, peer: &NodeId) -> Result<bool, RpcError>;
}
