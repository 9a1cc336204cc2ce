use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub enabled: bool,
}

/// Thread-safe TTL cache for recognition results
///
/// Entries live for a fixed TTL. When the cache is full, inserting a new key
/// evicts the entry closest to expiry, regardless of how recently it was read.
#[derive(Clone)]
pub struct ResultCache<V> {
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
    max_size: usize,
    ttl: Duration,
    enabled: bool,
}

impl<V: Clone + Send + Sync + 'static> ResultCache<V> {
    /// Create a new ResultCache
    ///
    /// # Arguments
    /// * `max_size` - Maximum number of live entries
    /// * `ttl` - Lifetime of each entry from the moment it is set
    /// * `enabled` - A disabled cache stores nothing and never hits
    pub fn new(max_size: usize, ttl: Duration, enabled: bool) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_size,
            ttl,
            enabled: enabled && max_size > 0,
        }
    }

    /// Retrieve a cached value
    ///
    /// # Returns
    /// Some(value) if present and unexpired, None otherwise
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Store a value, replacing any previous value for the key
    ///
    /// If the key is new and the cache is at capacity, the entry with the
    /// earliest expiry is evicted first.
    pub fn set(&self, key: String, value: V) {
        if !self.enabled {
            return;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let soonest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(evicted) = soonest {
                entries.remove(&evicted);
                tracing::debug!(key = %evicted, "Evicted cache entry");
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Stats count only entries that have not expired yet.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let live = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.expires_at > now)
            .count();

        CacheStats {
            size: live,
            max_size: self.max_size,
            ttl_secs: self.ttl.as_secs(),
            enabled: self.enabled,
        }
    }

    /// Run `purge_expired` every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Cache sweeper shutting down...");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

/// Content fingerprint used as the cache key
///
/// SHA-256 over the payload followed by each option, every field prefixed with
/// its length so that `["ab", "c"]` and `["a", "bc"]` hash differently.
///
/// # Returns
/// Lowercase hexadecimal digest
pub fn fingerprint(data: &[u8], options: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((data.len() as u64).to_le_bytes());
    hasher.update(data);
    for option in options {
        hasher.update((option.len() as u64).to_le_bytes());
        hasher.update(option.as_bytes());
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}
