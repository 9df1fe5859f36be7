//! Durable storage for the serialized queue.
//!
//! A [`StorageBackend`] is a plain key-value medium with whole-value
//! overwrite. [`DurableStore`] binds a backend to one key and owns the JSON
//! encoding of the entry list. Its `read`/`write` never fail the caller:
//! unreadable content is treated as an empty queue and a failed write leaves
//! the previous value in place.

use crate::{OutboxError, OutboxResult, QueueEntry};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tracing::{debug, error, warn};

/// Key-value medium holding serialized queues.
pub trait StorageBackend: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> OutboxResult<Option<String>>;

    /// Replace the value stored under `key`. Either the whole value is
    /// replaced or an error is returned and the old value is kept.
    fn set(&self, key: &str, value: &str) -> OutboxResult<()>;
}

/// In-process backend. Provides no durability across restarts; used as the
/// fallback medium and in tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
    quota: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects writes once the total stored size would
    /// exceed `limit` bytes.
    pub fn with_quota(limit: usize) -> Self {
        let backend = Self::default();
        backend.set_quota(Some(limit));
        backend
    }

    /// Change the byte quota. `None` removes the limit.
    pub fn set_quota(&self, limit: Option<usize>) {
        *self.quota.lock().unwrap_or_else(|e| e.into_inner()) = limit;
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> OutboxResult<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> OutboxResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(limit) = *self.quota.lock().unwrap_or_else(|e| e.into_inner()) {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let needed = others + value.len();
            if needed > limit {
                return Err(OutboxError::QuotaExceeded { needed, limit });
            }
        }

        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File backend: one `<key>.json` file per key inside a directory.
///
/// Writes go to a temporary sibling file which is fsynced and renamed over the
/// target, so readers in other processes observe either the old or the new
/// queue, never a partial one.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) a backend rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> OutboxResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> OutboxResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> OutboxResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> OutboxResult<()> {
        let path = self.path_for(key)?;
        atomic_write(&self.dir, &path, value)?;
        Ok(())
    }
}

pub(crate) fn validate_key(key: &str) -> OutboxResult<()> {
    if key.is_empty() || key.starts_with('.') {
        return Err(OutboxError::InvalidKey(key.to_string()));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(OutboxError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn atomic_write(dir: &Path, path: &Path, content: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid queue file name"))?;

    let tmp_path = dir.join(format!(
        ".{}.outbox.tmp.{}",
        file_name,
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));

    let write_result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, path)?;

        if let Ok(parent_dir) = fs::File::open(dir) {
            let _ = parent_dir.sync_all();
        }
        Ok(())
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

/// A [`FileBackend`] under `dir` if the directory is usable, otherwise an
/// in-memory backend that keeps queues alive for this process only.
pub fn open_backend(dir: &Path) -> Arc<dyn StorageBackend> {
    match FileBackend::open(dir) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!(
                dir = %dir.display(),
                error = %e,
                "Durable storage unavailable, queues are memory-only"
            );
            Arc::new(MemoryBackend::new())
        }
    }
}

/// One serialized entry list bound to a storage key.
#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the stored entry list. Any failure yields an empty list.
    pub fn read(&self) -> Vec<QueueEntry> {
        match self.try_read() {
            Ok(entries) => entries,
            Err(e) => {
                error!(key = %self.key, error = %e, "Error retrieving queue");
                Vec::new()
            }
        }
    }

    /// Replace the stored entry list. Returns false if nothing was written.
    pub fn write(&self, entries: &[QueueEntry]) -> bool {
        match self.try_write(entries) {
            Ok(()) => true,
            Err(e) => {
                error!(key = %self.key, count = entries.len(), error = %e, "Error saving queue");
                false
            }
        }
    }

    fn try_read(&self) -> OutboxResult<Vec<QueueEntry>> {
        let Some(raw) = self.backend.get(&self.key)? else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let serde_json::Value::Array(items) = serde_json::from_str::<serde_json::Value>(&raw)? else {
            error!(key = %self.key, "Invalid storage entry, expected an array");
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<QueueEntry>(item) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %self.key, error = %e, "Skipping invalid stored entry"),
            }
        }

        debug!(key = %self.key, count = entries.len(), "Read stored queue");
        Ok(entries)
    }

    fn try_write(&self, entries: &[QueueEntry]) -> OutboxResult<()> {
        let raw = serde_json::to_string(entries)?;
        self.backend.set(&self.key, &raw)
    }
}
