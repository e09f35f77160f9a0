//! Durable storage for Raft state and the replicated log.
//!
//! Layout per node, under `${RAFT_STORAGE_DIR}/node-<id>/`:
//!
//! - `state.json`: `{current_term, voted_for, last_applied}`, replaced
//!   atomically (write to temp, rename).
//! - `log.jsonl`: one JSON entry per line, append-only. Truncation after a
//!   conflict rewrites the journal through a temp file. On recovery a torn
//!   trailing line is discarded, so the loaded log is always a prefix of
//!   what was acknowledged.
//!
//! `save_state` and `append_entries` are serialized by a per-store mutex.
//! I/O errors are surfaced to the node, which may continue with in-memory
//! state for the rest of the boot (degraded durability, logged loudly).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

use super::types::LogEntry;

/// The durable fields of a node, mirrored in `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    #[serde(default)]
    pub voted_for: String,
    #[serde(default)]
    pub last_applied: u64,
}

/// Contract for durable Raft storage.
///
/// Implementations must guarantee that once `append_entries` returns
/// success, `load_log` after any crash includes those entries, and that
/// `save_state` is durable before it returns.
pub trait LogStore: Send + Sync {
    /// Atomically replace the persisted state record.
    fn save_state(&self, state: &PersistedState) -> Result<()>;

    /// Load the persisted state; defaults when nothing was ever saved or
    /// the record is unreadable (degraded-durability boot path).
    fn load_state(&self) -> Result<PersistedState>;

    /// Extend the persisted log with `entries`, durable before return.
    fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Load the full log. Always contains at least the sentinel entry.
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// Drop all persisted entries at and after `from_index`.
    fn truncate_suffix(&self, from_index: u64) -> Result<()>;
}

/// File-backed store, one directory per node.
pub struct FileLogStore {
    state_path: PathBuf,
    log_path: PathBuf,
    /// Serializes state writes with log writes.
    io: Mutex<()>,
}

impl FileLogStore {
    /// Open (creating if needed) the store for `node_id` under `dir`.
    pub fn open(dir: impl AsRef<Path>, node_id: &str) -> Result<Self> {
        let node_dir = dir.as_ref().join(format!("node-{node_id}"));
        fs::create_dir_all(&node_dir).map_err(Error::Persist)?;
        Ok(Self {
            state_path: node_dir.join("state.json"),
            log_path: node_dir.join("log.jsonl"),
            io: Mutex::new(()),
        })
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(Error::Persist)?;
        file.write_all(data).map_err(Error::Persist)?;
        file.sync_all().map_err(Error::Persist)?;
        fs::rename(&tmp, path).map_err(Error::Persist)
    }

    fn read_journal(&self) -> Result<Vec<LogEntry>> {
        let mut log = vec![LogEntry::sentinel()];
        let file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(Error::Persist(e)),
        };

        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::Persist)?;
            if line.trim().is_empty() {
                continue;
            }
            let value = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => value,
                Err(e) => {
                    // A torn tail from a crash mid-append. Everything before
                    // it was acknowledged and parses; stop here.
                    warn!(error = %e, "discarding unparsable journal tail");
                    break;
                }
            };
            match serde_json::from_value::<LogEntry>(value.clone()) {
                Ok(entry) => log.push(entry),
                Err(_) => {
                    // Well-formed JSON carrying a command tag this build does
                    // not know. The log stays a loadable prefix; the rest of
                    // the journal is unusable until the tag is understood.
                    let tag = value
                        .pointer("/command/type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("missing");
                    let err = Error::UnknownCommand(tag.to_string());
                    warn!(error = %err, "journal entry not understood, loading stops here");
                    break;
                }
            }
        }
        Ok(log)
    }

    fn rewrite_journal(&self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        Self::write_atomic(&self.log_path, &buf)
    }
}

impl LogStore for FileLogStore {
    fn save_state(&self, state: &PersistedState) -> Result<()> {
        let _guard = self.io.lock().expect("storage mutex poisoned");
        let data = serde_json::to_vec(state)?;
        Self::write_atomic(&self.state_path, &data)
    }

    fn load_state(&self) -> Result<PersistedState> {
        let _guard = self.io.lock().expect("storage mutex poisoned");
        let data = match fs::read(&self.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(Error::Persist(e)),
        };
        match serde_json::from_slice(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, "state record unreadable, starting from defaults");
                Ok(PersistedState::default())
            }
        }
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.io.lock().expect("storage mutex poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(Error::Persist)?;
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        file.write_all(&buf).map_err(Error::Persist)?;
        file.sync_all().map_err(Error::Persist)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let _guard = self.io.lock().expect("storage mutex poisoned");
        self.read_journal()
    }

    fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        let _guard = self.io.lock().expect("storage mutex poisoned");
        let log = self.read_journal()?;
        let kept: Vec<LogEntry> = log
            .into_iter()
            .filter(|e| e.index > 0 && e.index < from_index)
            .collect();
        self.rewrite_journal(&kept)
    }
}

/// In-memory store, used by tests and as the fallback when the file store
/// cannot be opened. Provides no durability across restarts.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: PersistedState,
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn save_state(&self, state: &PersistedState) -> Result<()> {
        self.inner.lock().expect("storage mutex poisoned").state = state.clone();
        Ok(())
    }

    fn load_state(&self) -> Result<PersistedState> {
        Ok(self.inner.lock().expect("storage mutex poisoned").state.clone())
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.inner
            .lock()
            .expect("storage mutex poisoned")
            .entries
            .extend_from_slice(entries);
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().expect("storage mutex poisoned");
        let mut log = vec![LogEntry::sentinel()];
        log.extend(inner.entries.iter().cloned());
        Ok(log)
    }

    fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        self.inner
            .lock()
            .expect("storage mutex poisoned")
            .entries
            .retain(|e| e.index < from_index);
        Ok(())
    }
}

/// Open the file store for `node_id`, falling back to memory-only storage
/// when the directory cannot be used. The fallback trades durability for
/// availability and is flagged in the logs.
pub fn open_or_memory(dir: impl AsRef<Path>, node_id: &str) -> std::sync::Arc<dyn LogStore> {
    match FileLogStore::open(dir.as_ref(), node_id) {
        Ok(store) => std::sync::Arc::new(store),
        Err(e) => {
            warn!(
                node_id,
                dir = %dir.as_ref().display(),
                error = %e,
                "file storage unavailable, continuing with in-memory state only"
            );
            std::sync::Arc::new(MemoryLogStore::new())
        }
    }
}
