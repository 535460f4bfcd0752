//! Query cache
//!
//! LRU cache with per-entry TTL and an optional memory bound. Reads update
//! the access order and may refresh the TTL; `get_or_set` populates a key
//! with single-flight semantics (concurrent callers share one fetch);
//! `namespace` returns a prefix-scoped view over the same store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Cache-wide configuration.
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    pub max_size: usize,
    pub max_memory_bytes: Option<usize>,
    pub default_ttl: Duration,
    /// When set, a hit pushes the entry's expiry out by its TTL.
    pub refresh_on_access: bool,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_memory_bytes: None,
            default_ttl: Duration::from_secs(300),
            refresh_on_access: false,
        }
    }
}

/// Per-entry overrides for `set`/`get_or_set`.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    pub ttl: Option<Duration>,
    pub size_bytes: Option<usize>,
}

impl EntryOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            size_bytes: None,
        }
    }
}

struct Entry<V> {
    value: V,
    created: Instant,
    expires: Instant,
    ttl: Duration,
    size_bytes: usize,
    access_count: u64,
    last_access: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, Entry<V>>,
    access_seq: u64,
    memory_used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counters and sizes, for operator visibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Read-only view of one entry, as exposed by snapshots.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    pub key: String,
    pub value: V,
    pub age: Duration,
    pub expires_in: Duration,
    pub size_bytes: usize,
    pub access_count: u64,
}

/// LRU/TTL cache for opaque values; clones share the store.
pub struct QueryCache<V: Clone> {
    config: QueryCacheConfig,
    inner: Arc<Mutex<CacheInner<V>>>,
    in_flight: Arc<tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<V: Clone> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_seq: 0,
                memory_used: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QueryCacheConfig::default())
    }

    /// Reads a live entry, updating access order (and TTL when
    /// `refresh_on_access` is set).
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.access_seq += 1;
        let seq = inner.access_seq;
        let refresh = self.config.refresh_on_access;
        match inner.entries.get_mut(key) {
            Some(entry) if entry.expires > Instant::now() => {
                entry.last_access = seq;
                entry.access_count += 1;
                if refresh {
                    entry.expires = Instant::now() + entry.ttl;
                }
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            Some(_) => {
                // Expired entry; drop it eagerly.
                if let Some(entry) = inner.entries.remove(key) {
                    inner.memory_used -= entry.size_bytes;
                }
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Inserts a value, evicting LRU entries until both bounds hold.
    pub fn set(&self, key: &str, value: V, opts: EntryOptions) {
        let ttl = opts.ttl.unwrap_or(self.config.default_ttl);
        let size_bytes = opts.size_bytes.unwrap_or(std::mem::size_of::<V>());
        let mut inner = self.inner.lock();
        inner.access_seq += 1;
        let seq = inner.access_seq;

        if let Some(old) = inner.entries.remove(key) {
            inner.memory_used -= old.size_bytes;
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created: Instant::now(),
                expires: Instant::now() + ttl,
                ttl,
                size_bytes,
                access_count: 0,
                last_access: seq,
            },
        );
        inner.memory_used += size_bytes;

        self.evict_to_capacity(&mut inner);
    }

    fn evict_to_capacity(&self, inner: &mut CacheInner<V>) {
        while inner.entries.len() > self.config.max_size
            || self
                .config
                .max_memory_bytes
                .is_some_and(|max| inner.memory_used > max)
        {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            let Some(key) = lru_key else { break };
            if let Some(entry) = inner.entries.remove(&key) {
                inner.memory_used -= entry.size_bytes;
                inner.evictions += 1;
                trace!(key, "evicted LRU cache entry");
            }
        }
    }

    /// Reads the key, or runs `fetch` to populate it. Concurrent callers
    /// for the same key share a single fetch; the resolved value is stored.
    pub async fn get_or_set<E, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        opts: EntryOptions,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let flight = {
            let mut map = self.in_flight.lock().await;
            Arc::clone(
                map.entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = flight.lock().await;

        // Another caller may have populated the key while we waited.
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = fetch().await?;
        self.set(key, value.clone(), opts);

        let mut map = self.in_flight.lock().await;
        map.remove(key);
        Ok(value)
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.memory_used -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Removes every key starting with `prefix`; returns the count.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_used -= entry.size_bytes;
            }
        }
        debug!(prefix, removed = keys.len(), "cache prefix invalidation");
        keys.len()
    }

    /// Removes every key matching `pattern`; returns the count.
    pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_used -= entry.size_bytes;
            }
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.memory_used = 0;
    }

    pub fn stats(&self) -> QueryCacheStats {
        let inner = self.inner.lock();
        QueryCacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.memory_used,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Live entries only; expired ones are excluded.
    pub fn snapshot(&self) -> Vec<EntrySnapshot<V>> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires > now)
            .map(|(key, entry)| EntrySnapshot {
                key: key.clone(),
                value: entry.value.clone(),
                age: now.duration_since(entry.created),
                expires_in: entry.expires.duration_since(now),
                size_bytes: entry.size_bytes,
                access_count: entry.access_count,
            })
            .collect()
    }

    /// Prefix-scoped view sharing this cache's store and bounds.
    pub fn namespace(&self, ns: &str) -> NamespacedCache<V> {
        NamespacedCache {
            cache: self.clone(),
            prefix: format!("{ns}:"),
        }
    }
}

/// View over a [`QueryCache`] that prefixes every key.
pub struct NamespacedCache<V: Clone> {
    cache: QueryCache<V>,
    prefix: String,
}

impl<V: Clone> NamespacedCache<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.get(&format!("{}{key}", self.prefix))
    }

    pub fn set(&self, key: &str, value: V, opts: EntryOptions) {
        self.cache.set(&format!("{}{key}", self.prefix), value, opts)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.cache.remove(&format!("{}{key}", self.prefix))
    }

    /// Drops every entry in this namespace.
    pub fn invalidate_all(&self) -> usize {
        self.cache.invalidate_by_prefix(&self.prefix)
    }
}
