//! # error
//!
//! why: give every layer of the core a typed failure instead of panics
//! relations: StorageError is raised by log/metadata collaborators, wrapped by RaftError
//! what: StorageError, RaftError, crate-wide Result alias

use thiserror::Error;

/// Failures raised by the durable collaborators (log, metadata store).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("log index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("log index {index} has been compacted")]
    Compacted { index: u64 },
}

/// Failures surfaced by the consensus core.
///
/// A `Storage` error is a persistence failure: the node that observes it must
/// stop participating, since its term/vote/log can no longer be trusted.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("persistence failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(#[from] serde_json::Error),

    #[error("replica halted after a persistence failure")]
    Halted,
}

pub type Result<T> = std::result::Result<T, RaftError>;
