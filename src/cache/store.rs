//! Preview Storage
//!
//! Persists the preview cache index and one file per cached image.
//! `DiskStore` keeps them under a local cache directory; `MemoryStore`
//! keeps them for the lifetime of the process only.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Index file name inside the store root
const INDEX_FILE: &str = "index.json";

/// Persisted index record for one cached preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Recorded program ID
    pub id: String,
    /// Format string of the request
    pub format: String,
    /// JSON-serialized request params
    pub params: String,
    /// Creation time in milliseconds since epoch
    pub time: u64,
    /// Opaque token naming the backing file
    pub key: String,
}

/// Storage collaborator for the preview cache.
///
/// Failures are reported as `false`/`None`; the cache treats storage as
/// best effort and never surfaces them to callers.
pub trait PreviewStore: Send + Sync {
    /// Load the persisted index (empty when absent or unreadable)
    fn load_index(&self) -> Vec<CacheEntry>;

    /// Replace the persisted index
    fn save_index(&self, entries: &[CacheEntry]) -> bool;

    /// Store a file under `namespace/key`
    fn save_file(&self, namespace: &str, key: &str, content: &str) -> bool;

    /// Load a file stored under `namespace/key`
    fn load_file(&self, namespace: &str, key: &str) -> Option<String>;

    /// Remove a file stored under `namespace/key` (missing files are ignored)
    fn remove_file(&self, namespace: &str, key: &str);
}

/// Local disk store rooted at a cache directory
pub struct DiskStore {
    /// Root directory holding the index and namespace subdirectories
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory: {:?}", root))?;

        let store = Self { root };

        // Clean up any stale temp files from previous runs
        store.cleanup();

        info!(cache_dir = %store.root.display(), "Preview store initialized");
        Ok(store)
    }

    /// Map `namespace/key` to a path, refusing anything that could escape
    /// the store root
    fn file_path(&self, namespace: &str, key: &str) -> Option<PathBuf> {
        let valid = |part: &str| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && !part.contains(['/', '\\', ':'])
        };
        if valid(namespace) && valid(key) {
            Some(self.root.join(namespace).join(key))
        } else {
            None
        }
    }

    /// Write data atomically using a temp file in the target directory
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("Path has no parent: {:?}", path))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache subdirectory: {:?}", parent))?;

        let mut tmp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(parent)
            .context("Failed to create temp file for cache")?;

        tmp.write_all(data).context("Failed to write cache file")?;

        tmp.persist(path)
            .with_context(|| format!("Failed to persist cache file: {:?}", path))?;
        Ok(())
    }

    /// Remove `.tmp` files left from interrupted writes
    pub fn cleanup(&self) {
        let mut dirs = vec![self.root.clone()];
        if let Ok(read_dir) = fs::read_dir(&self.root) {
            dirs.extend(
                read_dir
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir()),
            );
        }

        for dir in dirs {
            let Ok(read_dir) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

impl PreviewStore for DiskStore {
    fn load_index(&self) -> Vec<CacheEntry> {
        let path = self.root.join(INDEX_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_slice(&data) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable cache index");
                Vec::new()
            }
        }
    }

    fn save_index(&self, entries: &[CacheEntry]) -> bool {
        let path = self.root.join(INDEX_FILE);
        let result = serde_json::to_vec(entries)
            .context("Failed to serialize cache index")
            .and_then(|json| Self::write_atomic(&path, &json));
        match result {
            Ok(()) => {
                debug!(entries = entries.len(), "Saved cache index");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to save cache index");
                false
            }
        }
    }

    fn save_file(&self, namespace: &str, key: &str, content: &str) -> bool {
        let Some(path) = self.file_path(namespace, key) else {
            warn!(namespace = namespace, key = key, "Refusing invalid cache file name");
            return false;
        };
        match Self::write_atomic(&path, content.as_bytes()) {
            Ok(()) => {
                debug!(local = %path.display(), size = content.len(), "Stored file in cache");
                true
            }
            Err(e) => {
                warn!(key = key, error = %e, "Failed to store cache file");
                false
            }
        }
    }

    fn load_file(&self, namespace: &str, key: &str) -> Option<String> {
        let path = self.file_path(namespace, key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(local = %path.display(), error = %e, "Cache file unavailable");
                None
            }
        }
    }

    fn remove_file(&self, namespace: &str, key: &str) {
        if let Some(path) = self.file_path(namespace, key) {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(local = %path.display(), error = %e, "Failed to remove cache file");
                } else {
                    debug!(key = key, "Removed cache file");
                }
            }
        }
    }
}

/// In-memory store, lost when the process exits
#[derive(Default)]
pub struct MemoryStore {
    index: Mutex<Vec<CacheEntry>>,
    files: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing index (files are not restored)
    #[cfg(test)]
    pub fn with_index(entries: Vec<CacheEntry>) -> Self {
        Self {
            index: Mutex::new(entries),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored files
    #[cfg(test)]
    pub fn file_count(&self) -> usize {
        self.files().len()
    }
}

impl PreviewStore for MemoryStore {
    fn load_index(&self) -> Vec<CacheEntry> {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save_index(&self, entries: &[CacheEntry]) -> bool {
        *self.index.lock().unwrap_or_else(PoisonError::into_inner) = entries.to_vec();
        true
    }

    fn save_file(&self, namespace: &str, key: &str, content: &str) -> bool {
        self.files()
            .insert((namespace.to_string(), key.to_string()), content.to_string());
        true
    }

    fn load_file(&self, namespace: &str, key: &str) -> Option<String> {
        self.files()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn remove_file(&self, namespace: &str, key: &str) {
        self.files()
            .remove(&(namespace.to_string(), key.to_string()));
    }
}
