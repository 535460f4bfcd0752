/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Caching resolver wrapper
//!
//! Sits in front of any [`DnsResolver`] backend, keyed by
//! `(record type, lowercased domain)`. Entries expire after the configured
//! TTL; a background sweeper removes expired keys. Concurrent reads are
//! race-free; concurrent inserts race harmlessly (last writer wins).

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::resolver::{DnsResolver, MxRecord, Result};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct DnsCacheConfig {
    /// TTL applied to entries at insertion time.
    pub ttl: Duration,
    /// How often the background sweeper removes expired keys.
    pub sweep_interval: Duration,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RecordKind {
    Txt,
    A,
    Aaaa,
    Mx,
}

#[derive(Debug, Clone)]
enum CachedRecords {
    Txt(Vec<String>),
    A(Vec<Ipv4Addr>),
    Aaaa(Vec<Ipv6Addr>),
    Mx(Vec<MxRecord>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    records: CachedRecords,
    expires_at: Instant,
}

/// Cache counters, readable at any time.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// TTL cache in front of a resolver backend.
#[derive(Clone)]
pub struct CachingResolver {
    backend: Arc<dyn DnsResolver>,
    entries: Arc<RwLock<HashMap<(RecordKind, String), CacheEntry>>>,
    config: DnsCacheConfig,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    sweeper_running: Arc<AtomicBool>,
}

impl CachingResolver {
    pub fn new(backend: Arc<dyn DnsResolver>, config: DnsCacheConfig) -> Self {
        Self {
            backend,
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_defaults(backend: Arc<dyn DnsResolver>) -> Self {
        Self::new(backend, DnsCacheConfig::default())
    }

    /// Starts the background sweeper. Idempotent; a second call is a no-op
    /// while the first sweeper is alive.
    pub fn start_sweeper(&self) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = Arc::clone(&self.entries);
        let evictions = Arc::clone(&self.evictions);
        let running = Arc::clone(&self.sweeper_running);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let now = Instant::now();
                let removed = {
                    let mut map = entries.write();
                    let before = map.len();
                    map.retain(|_, entry| entry.expires_at > now);
                    before - map.len()
                };
                if removed > 0 {
                    evictions.fetch_add(removed as u64, Ordering::Relaxed);
                    debug!(removed, "DNS cache sweep removed expired entries");
                }
            }
        });
    }

    /// Stops the background sweeper.
    pub fn shutdown(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }

    /// Removes expired entries immediately.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);
        self.evictions
            .fetch_add((before - map.len()) as u64, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn lookup(&self, kind: RecordKind, domain: &str) -> Option<CachedRecords> {
        let key = (kind, domain.to_ascii_lowercase());
        let map = self.entries.read();
        match map.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(domain, ?kind, "DNS cache hit");
                Some(entry.records.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn store(&self, kind: RecordKind, domain: &str, records: CachedRecords) {
        let key = (kind, domain.to_ascii_lowercase());
        self.entries.write().insert(
            key,
            CacheEntry {
                records,
                expires_at: Instant::now() + self.config.ttl,
            },
        );
    }
}

#[async_trait]
impl DnsResolver for CachingResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>> {
        if let Some(CachedRecords::Txt(records)) = self.lookup(RecordKind::Txt, domain) {
            return Ok(records);
        }
        let records = self.backend.resolve_txt(domain).await?;
        self.store(RecordKind::Txt, domain, CachedRecords::Txt(records.clone()));
        Ok(records)
    }

    async fn resolve_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        if let Some(CachedRecords::A(records)) = self.lookup(RecordKind::A, domain) {
            return Ok(records);
        }
        let records = self.backend.resolve_a(domain).await?;
        self.store(RecordKind::A, domain, CachedRecords::A(records.clone()));
        Ok(records)
    }

    async fn resolve_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>> {
        if let Some(CachedRecords::Aaaa(records)) = self.lookup(RecordKind::Aaaa, domain) {
            return Ok(records);
        }
        let records = self.backend.resolve_aaaa(domain).await?;
        self.store(RecordKind::Aaaa, domain, CachedRecords::Aaaa(records.clone()));
        Ok(records)
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        if let Some(CachedRecords::Mx(records)) = self.lookup(RecordKind::Mx, domain) {
            return Ok(records);
        }
        let records = self.backend.resolve_mx(domain).await?;
        self.store(RecordKind::Mx, domain, CachedRecords::Mx(records.clone()));
        Ok(records)
    }
}
