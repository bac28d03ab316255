//! Preview Cache
//!
//! Keeps fetched preview images keyed by request identity
//! `(id, format, JSON params)` on top of a `PreviewStore`.
//! Entries expire after a configurable lifetime and are purged when the
//! cache is opened. Storage problems make the cache forget entries; they
//! never fail a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use super::data_uri::DataUri;
use super::store::{CacheEntry, PreviewStore};
use crate::backend::PreviewRequest;

/// Store namespace for preview image files
pub const PREVIEW_NAMESPACE: &str = "previews";

/// Current time in milliseconds since epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Render a number in base 36 (0-9a-z)
fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Persistent preview image cache
pub struct PreviewCache {
    /// Backing storage for the index and image files
    store: Arc<dyn PreviewStore>,
    /// Live entries, mirrored to the store index
    entries: Mutex<Vec<CacheEntry>>,
    /// Entries older than this are purged on open
    lifetime: Duration,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
    /// Last stamp handed out as a key
    last_stamp: AtomicU64,
}

impl PreviewCache {
    /// Open the cache, purging entries older than `lifetime`
    pub fn open(store: Arc<dyn PreviewStore>, lifetime: Duration) -> Self {
        Self::open_at(store, lifetime, now_millis())
    }

    /// Open the cache with an explicit current time
    pub fn open_at(store: Arc<dyn PreviewStore>, lifetime: Duration, now: u64) -> Self {
        let entries = store.load_index();
        let cache = Self {
            store,
            entries: Mutex::new(entries),
            lifetime,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_stamp: AtomicU64::new(0),
        };

        let purged = cache.sweep_at(now);
        info!(
            entries = cache.entries().len(),
            purged = purged,
            lifetime_ms = lifetime.as_millis() as u64,
            "Preview cache initialized"
        );
        cache
    }

    fn entries(&self) -> MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Purge entries that are at least `lifetime` old at `now`.
    ///
    /// Backing files of purged entries are deleted and the index rewritten.
    /// Returns the number of purged entries.
    pub fn sweep_at(&self, now: u64) -> usize {
        let lifetime_ms = self.lifetime.as_millis() as u64;
        let (expired, snapshot) = {
            let mut entries = self.entries();
            let (live, expired): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| now.saturating_sub(entry.time) < lifetime_ms);
            *entries = live;
            (expired, entries.clone())
        };

        if expired.is_empty() {
            return 0;
        }

        for entry in &expired {
            if !entry.key.is_empty() {
                self.store.remove_file(PREVIEW_NAMESPACE, &entry.key);
            }
            debug!(id = %entry.id, key = %entry.key, "Purged expired preview");
        }

        if !self.store.save_index(&snapshot) {
            warn!("Failed to persist cache index after sweep");
        }
        expired.len()
    }

    /// Look up a cached preview, counting a hit or a miss.
    ///
    /// A missing or unreadable backing file counts as a miss and drops the
    /// entry.
    pub fn lookup(&self, request: &PreviewRequest) -> Option<DataUri> {
        let found = self.peek(request);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(id = %request.id, "Preview cache HIT");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(id = %request.id, "Preview cache MISS");
        }
        found
    }

    /// Look up a cached preview without touching the counters.
    ///
    /// Used to re-check the cache for a request whose miss was already
    /// counted. Unreadable entries are dropped as in `lookup`.
    pub fn peek(&self, request: &PreviewRequest) -> Option<DataUri> {
        let params = request.params_json();
        let key = self
            .entries()
            .iter()
            .find(|entry| {
                entry.id == request.id && entry.format == request.format && entry.params == params
            })
            .map(|entry| entry.key.clone())?;

        let data_uri = self
            .store
            .load_file(PREVIEW_NAMESPACE, &key)
            .and_then(DataUri::parse);
        if data_uri.is_none() {
            warn!(id = %request.id, key = %key, "Cached preview unreadable, dropping entry");
            self.forget(&key);
        }
        data_uri
    }

    /// Drop the entry with `key` from the index and its file from storage
    fn forget(&self, key: &str) {
        let snapshot = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|entry| entry.key != key);
            if entries.len() == before {
                return;
            }
            entries.clone()
        };
        self.store.remove_file(PREVIEW_NAMESPACE, key);
        if !self.store.save_index(&snapshot) {
            warn!(key = key, "Failed to persist cache index");
        }
    }

    /// Generate a time-based key not used by any live entry
    fn fresh_key(entries: &[CacheEntry], now: u64) -> String {
        let mut stamp = now;
        loop {
            let key = to_base36(stamp);
            if !entries.iter().any(|entry| entry.key == key) {
                return key;
            }
            stamp += 1;
        }
    }

    /// Reserve a key for a new entry.
    ///
    /// Stamps increase strictly within the process so concurrent inserts
    /// never share a key. Returns the key and the entry creation time.
    fn next_key(&self) -> (String, u64) {
        let entries = self.entries();
        let now = now_millis();
        let floor = now.max(self.last_stamp.load(Ordering::Relaxed) + 1);
        let key = Self::fresh_key(&entries, floor);
        if let Ok(stamp) = u64::from_str_radix(&key, 36) {
            self.last_stamp.store(stamp, Ordering::Relaxed);
        }
        (key, now)
    }

    /// Cache a fetched preview.
    ///
    /// Replaces any entry with the same identity. Returns whether the
    /// preview was stored; failures are logged and otherwise ignored.
    pub fn insert(&self, request: &PreviewRequest, data_uri: &DataUri) -> bool {
        let (key, now) = self.next_key();

        if !self
            .store
            .save_file(PREVIEW_NAMESPACE, &key, data_uri.as_str())
        {
            warn!(id = %request.id, "Failed to store preview, not caching");
            return false;
        }

        let entry = CacheEntry {
            id: request.id.clone(),
            format: request.format.clone(),
            params: request.params_json(),
            time: now,
            key: key.clone(),
        };

        let (superseded, snapshot) = {
            let mut entries = self.entries();
            let (superseded, mut kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|existing| {
                existing.id == entry.id
                    && existing.format == entry.format
                    && existing.params == entry.params
            });
            kept.push(entry);
            *entries = kept;
            (superseded, entries.clone())
        };

        for old in &superseded {
            self.store.remove_file(PREVIEW_NAMESPACE, &old.key);
        }

        if !self.store.save_index(&snapshot) {
            warn!(id = %request.id, "Failed to persist cache index");
        }

        debug!(id = %request.id, key = %key, "Cached preview");
        true
    }

    /// Snapshot of live entries
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries().clone()
    }

    /// Configured entry lifetime
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries().len(),
        }
    }
}
