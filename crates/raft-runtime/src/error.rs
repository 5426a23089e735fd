//! # error
//!
//! why: separate transient network failures from quorum outcomes
//! relations: RpcError comes out of transport.rs, QuorumError out of quorum.rs
//! what: RpcError, QuorumError

use raft_core::NodeId;
use thiserror::Error;

/// A failed call to a peer. Always transient: callers drop the attempt and
/// let the next election or heartbeat cycle try again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: NodeId },

    #[error("rpc to {peer} timed out")]
    Timeout { peer: NodeId },

    /// The peer received the call but could not serve it (e.g. it halted)
    #[error("remote error: {0}")]
    Remote(String),
}

/// Why a quorum could not be reached
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuorumError<E> {
    /// Too many calls failed and none answered with advice; carries the last failure
    #[error("quorum failed: {0}")]
    Failed(E),

    #[error("{inputs} calls can never reach a threshold of {threshold}")]
    NotEnoughInputs { inputs: usize, threshold: usize },

    /// Every call went away without reporting (runtime shutting down)
    #[error("quorum abandoned before resolution")]
    Abandoned,
}
