//! # applier
//!
//! why: a client operation can reach the log twice (leader failover, redirect retry)
//! but must affect the state machine once
//! relations: fed committed entries by raft-runtime's apply loop
//! what: StateMachine capability trait, ExactlyOnceApplier

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Command, Result};

/// A deterministic state machine replicated by raft.
///
/// Not thread-safe: the replica calls it from under its own lock.
pub trait StateMachine: Send {
    /// Move to the initial state
    fn reset(&mut self);

    /// Apply a command, returning the serialized operation response
    fn apply(&mut self, command: &Command) -> Vec<u8>;

    fn snapshot(&self) -> Vec<u8>;

    fn install(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// Last operation applied for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Session {
    last_index: u64,
    last_response: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ApplierSnapshot {
    sessions: BTreeMap<String, Session>,
    machine: Vec<u8>,
}

/// Wraps a state machine and deduplicates by `(client_id, index)`.
///
/// A command whose index is not above the last one applied for its client
/// gets the cached response and never reaches the wrapped machine.
pub struct ExactlyOnceApplier {
    machine: Box<dyn StateMachine>,
    sessions: BTreeMap<String, Session>,
}

impl ExactlyOnceApplier {
    pub fn new(machine: Box<dyn StateMachine>) -> Self {
        Self {
            machine,
            sessions: BTreeMap::new(),
        }
    }

    /// Reset the wrapped machine and forget every client session.
    pub fn reset(&mut self) {
        self.machine.reset();
        self.sessions.clear();
    }

    pub fn apply(&mut self, command: &Command) -> Vec<u8> {
        let id = &command.request_id;
        if let Some(session) = self.sessions.get(&id.client_id) {
            if id.index <= session.last_index {
                tracing::debug!(request = %id, "duplicate command, replaying cached response");
                return session.last_response.clone();
            }
        }

        let response = self.machine.apply(command);
        self.sessions.insert(
            id.client_id.clone(),
            Session {
                last_index: id.index,
                last_response: response.clone(),
            },
        );
        response
    }

    /// Highest request index applied for `client_id`.
    pub fn last_applied_index(&self, client_id: &str) -> Option<u64> {
        self.sessions.get(client_id).map(|s| s.last_index)
    }

    /// Snapshot of the wrapped machine together with the session table.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = ApplierSnapshot {
            sessions: self.sessions.clone(),
            machine: self.machine.snapshot(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    pub fn install(&mut self, snapshot: &[u8]) -> Result<()> {
        let snapshot: ApplierSnapshot = serde_json::from_slice(snapshot)?;
        self.machine.install(&snapshot.machine)?;
        self.sessions = snapshot.sessions;
        Ok(())
    }
}

impl std::fmt::Debug for ExactlyOnceApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactlyOnceApplier")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
