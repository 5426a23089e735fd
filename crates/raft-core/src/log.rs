//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, file-backed variant lives in raft-storage
//! what: LogEntry struct, Log collaborator contract, in-memory implementation

use serde::{Deserialize, Serialize};

use crate::{Command, StorageError};

/// A single entry in the replicated log
///
/// The index of an entry is its position in the log (1-indexed), so it is not
/// stored in the entry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The command to be applied to the state machine
    pub command: Command,
    /// The term when this entry was created
    pub term: u64,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, command: Command) -> Self {
        Self { command, term }
    }
}

/// Indexed, append-only log of entries, starting at index 1.
///
/// Implementations do no internal synchronization: the caller serializes
/// every mutating sequence.
pub trait Log: Send {
    /// Index of the last entry (0 when empty). Compacted entries still count.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the entry at `index`; fails outside the retained range.
    fn read(&self, index: u64) -> Result<LogEntry, StorageError>;

    /// Term of the entry at `index`, with term 0 for the empty prefix at index 0.
    fn term(&self, index: u64) -> Result<u64, StorageError> {
        if index == 0 {
            return Ok(0);
        }
        Ok(self.read(index)?.term)
    }

    /// Term of the last entry, used for election restrictions.
    fn last_log_term(&self) -> Result<u64, StorageError> {
        self.term(self.len())
    }

    /// Append `entries[start_offset..]`; the already-matching prefix is skipped by the caller.
    fn append(&mut self, entries: &[LogEntry], start_offset: usize) -> Result<(), StorageError>;

    /// Drop every entry at `from_index` and after.
    fn truncate_suffix(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// Compact every entry up to and including `end_index`.
    fn truncate_prefix(&mut self, end_index: u64) -> Result<(), StorageError>;

    /// Read `[from_index, len]`, empty when `from_index` is past the end.
    fn read_from(&self, from_index: u64) -> Result<Vec<LogEntry>, StorageError> {
        (from_index.max(1)..=self.len())
            .map(|index| self.read(index))
            .collect()
    }
}

// -- in-memory log implementation --

/// Vec-backed log for tests and volatile replicas.
///
/// Prefix compaction keeps `base` (the last compacted index) and its term so
/// consistency checks against that index still succeed.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
    base: u64,
    base_term: u64,
}

impl MemoryLog {
    /// create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// rebuild a log from retained state, e.g. after loading it from disk
    pub fn from_parts(entries: Vec<LogEntry>, base: u64, base_term: u64) -> Self {
        Self {
            entries,
            base,
            base_term,
        }
    }

    /// first index still readable
    pub fn first_index(&self) -> u64 {
        self.base + 1
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn base_term(&self) -> u64 {
        self.base_term
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn position(&self, index: u64) -> Result<usize, StorageError> {
        if index != 0 && index <= self.base {
            return Err(StorageError::Compacted { index });
        }
        if index == 0 || index > self.len() {
            return Err(StorageError::OutOfRange {
                index,
                first: self.first_index(),
                last: self.len(),
            });
        }
        Ok((index - self.base - 1) as usize)
    }
}

impl Log for MemoryLog {
    fn len(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn read(&self, index: u64) -> Result<LogEntry, StorageError> {
        let pos = self.position(index)?;
        Ok(self.entries[pos].clone())
    }

    fn term(&self, index: u64) -> Result<u64, StorageError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.base {
            return Ok(self.base_term);
        }
        let pos = self.position(index)?;
        Ok(self.entries[pos].term)
    }

    fn append(&mut self, entries: &[LogEntry], start_offset: usize) -> Result<(), StorageError> {
        if let Some(suffix) = entries.get(start_offset..) {
            self.entries.extend_from_slice(suffix);
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, from_index: u64) -> Result<(), StorageError> {
        if from_index > self.len() {
            return Ok(());
        }
        if from_index <= self.base {
            return Err(StorageError::Compacted { index: from_index });
        }
        self.entries.truncate((from_index - self.base - 1) as usize);
        Ok(())
    }

    fn truncate_prefix(&mut self, end_index: u64) -> Result<(), StorageError> {
        if end_index <= self.base {
            return Ok(());
        }
        let base_term = self.term(end_index)?;
        self.entries.drain(..(end_index - self.base) as usize);
        self.base = end_index;
        self.base_term = base_term;
        Ok(())
    }
}
