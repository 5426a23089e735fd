//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's MetaStore and Log contracts, opened by raft-runtime's simulator
//! what: FileMetaStore (meta.json), FileLog (log.json), atomic file replacement

use raft_core::{Log, LogEntry, MemoryLog, MetaStore, PersistentState, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

/// Open both stores rooted at `dir`, creating it when missing.
pub fn open(dir: impl Into<PathBuf>) -> Result<(FileMetaStore, FileLog), StorageError> {
    let dir = dir.into();
    Ok((FileMetaStore::new(&dir)?, FileLog::open(&dir)?))
}

/// atomic write: write to temp file, fsync, then rename over `name`
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

/// `None` when the file was never written
fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// -- metadata store --

/// File-backed `{term, voted_for}` record, stored as `meta.json`.
#[derive(Debug, Clone)]
pub struct FileMetaStore {
    dir: PathBuf,
}

impl FileMetaStore {
    /// create a store in `dir`, creating the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }
}

impl MetaStore for FileMetaStore {
    fn load(&self) -> Result<PersistentState, StorageError> {
        match read_if_exists(&self.path())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            // default for new nodes
            None => Ok(PersistentState::default()),
        }
    }

    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir, META_FILE, &json)?;
        debug!(dir = %self.dir.display(), term = state.term, voted_for = ?state.voted_for, "saved metadata");
        Ok(())
    }
}

// -- log --

/// On-disk shape of `log.json`
#[derive(Serialize, Deserialize, Default)]
struct LogFile {
    base: u64,
    base_term: u64,
    entries: Vec<LogEntry>,
}

/// File-backed log.
///
/// Reads are served from an in-memory copy. Every mutation rewrites
/// `log.json` and only then updates the copy, so a failed write leaves the
/// log as it was before the call.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    cache: MemoryLog,
}

impl FileLog {
    /// Load the log stored in `dir`, or start empty.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let file: LogFile = match read_if_exists(&dir.join(LOG_FILE))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => LogFile::default(),
        };
        debug!(
            dir = %dir.display(),
            base = file.base,
            entries = file.entries.len(),
            "opened log"
        );
        Ok(Self {
            dir,
            cache: MemoryLog::from_parts(file.entries, file.base, file.base_term),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// first index still readable
    pub fn first_index(&self) -> u64 {
        self.cache.first_index()
    }

    /// Apply `change` to a copy of the log, persist it, then adopt it.
    fn update(
        &mut self,
        change: impl FnOnce(&mut MemoryLog) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut next = self.cache.clone();
        change(&mut next)?;
        let file = LogFile {
            base: next.base(),
            base_term: next.base_term(),
            entries: next.entries().to_vec(),
        };
        write_atomic(&self.dir, LOG_FILE, &serde_json::to_vec(&file)?)?;
        self.cache = next;
        Ok(())
    }
}

impl Log for FileLog {
    fn len(&self) -> u64 {
        self.cache.len()
    }

    fn read(&self, index: u64) -> Result<LogEntry, StorageError> {
        self.cache.read(index)
    }

    fn term(&self, index: u64) -> Result<u64, StorageError> {
        self.cache.term(index)
    }

    fn append(&mut self, entries: &[LogEntry], start_offset: usize) -> Result<(), StorageError> {
        if entries.len() <= start_offset {
            return Ok(());
        }
        self.update(|log| log.append(entries, start_offset))
    }

    fn truncate_suffix(&mut self, from_index: u64) -> Result<(), StorageError> {
        if from_index > self.cache.len() {
            return Ok(());
        }
        self.update(|log| log.truncate_suffix(from_index))
    }

    fn truncate_prefix(&mut self, end_index: u64) -> Result<(), StorageError> {
        if end_index <= self.cache.base() {
            return Ok(());
        }
        self.update(|log| log.truncate_prefix(end_index))
    }
}
