//! # raft-runtime
//!
//! why: drive raft-core's synchronous node with tokio tasks, timers and a transport
//! relations: owns a raft_core::RaftNode per replica, persists through raft-storage or memory stores
//! what: Replica actor, Ticker, quorum combinator, Transport trait, in-process network, simulator config

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod quorum;
pub mod replica;
pub mod ticker;
pub mod transport;

pub use client::{Client, ClientError};
pub use config::{load_config, ConfigError, SimConfig};
pub use error::{QuorumError, RpcError};
pub use network::LocalNetwork;
pub use quorum::{quorum, QuorumCombinator, Verdict, Vote};
pub use replica::{Replica, ReplicaStatus};
pub use ticker::Ticker;
pub use transport::Transport;
