//! # storage
//!
//! why: durable {term, voted_for} is what keeps a restarted node from voting twice
//! relations: written by node.rs on every term advance or vote grant; file version in raft-storage
//! what: PersistentState, MetaStore contract, shared in-memory store

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::{NodeId, StorageError};

/// The single record a node must persist before answering any rpc that depends on it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable store for the node's term and vote.
pub trait MetaStore: Send {
    /// Load the persisted record, zero defaults when nothing was saved yet.
    fn load(&self) -> Result<PersistentState, StorageError>;

    /// Durably overwrite the record. Must not return before the write is durable.
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError>;
}

/// In-memory metadata store
///
/// Clones share the same record, so a test can "restart" a node by handing a
/// clone to the new instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    state: Arc<Mutex<PersistentState>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored record.
    pub fn get(&self) -> PersistentState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl MetaStore for MemoryMetaStore {
    fn load(&self) -> Result<PersistentState, StorageError> {
        Ok(self.get())
    }

    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state.clone();
        Ok(())
    }
}
