//! # command
//!
//! why: model what clients submit and what they get back
//! relations: commands are stored in log.rs entries and applied through applier.rs
//! what: RequestId idempotency key, Command, client Response

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::NodeId;

/// Idempotency key of a client operation.
///
/// A client numbers its operations with a strictly increasing `index`; a retry
/// of the same operation reuses the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client_id: String,
    pub index: u64,
}

impl RequestId {
    pub fn new(client_id: impl Into<String>, index: u64) -> Self {
        Self {
            client_id: client_id.into(),
            index,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client_id, self.index)
    }
}

/// A client operation destined for the replicated state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: RequestId,
    /// Opaque operation understood by the state machine
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(request_id: RequestId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            payload: payload.into(),
        }
    }
}

/// What a replica answers to `Execute`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The command committed and was applied; carries the state machine output
    Ack(Vec<u8>),
    /// This replica is a follower that knows who leads
    RedirectToLeader(NodeId),
    /// No leader is known, or leadership was lost before the command committed
    NotALeader,
}

impl Response {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack(_))
    }
}
