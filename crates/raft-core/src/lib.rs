//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime's replica tasks, persisted via raft-storage
//! what: node state machine, rpc handlers, log and metadata contracts,
//! exactly-once command application

pub mod applier;
pub mod command;
pub mod config;
pub mod error;
pub mod kv;
pub mod log;
pub mod message;
pub mod node;
pub mod storage;

pub use applier::{ExactlyOnceApplier, StateMachine};
pub use command::{Command, RequestId, Response};
pub use config::RaftConfig;
pub use error::{RaftError, Result, StorageError};
pub use kv::KvStateMachine;
pub use log::{Log, LogEntry, MemoryLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
pub use node::{Event, NodeState, RaftNode};
pub use storage::{MemoryMetaStore, MetaStore, PersistentState};

/// Stable identifier of a cluster member; doubles as its host name for redirects.
pub type NodeId = String;
