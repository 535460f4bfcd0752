/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process mock backend for tests and air-gapped runs.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::resolver::{DnsError, DnsResolver, MxRecord, Result};

/// Scripted resolver. Unconfigured names resolve to empty sequences;
/// names registered with [`MockResolver::fail_domain`] raise a transient
/// error. Query counters let tests assert lookup budgets.
#[derive(Default)]
pub struct MockResolver {
    txt: Mutex<HashMap<String, Vec<String>>>,
    a: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    aaaa: Mutex<HashMap<String, Vec<Ipv6Addr>>>,
    mx: Mutex<HashMap<String, Vec<MxRecord>>>,
    failing: Mutex<HashMap<String, String>>,
    txt_count: AtomicU64,
    a_count: AtomicU64,
    aaaa_count: AtomicU64,
    mx_count: AtomicU64,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, domain: &str, records: &[&str]) {
        self.txt.lock().insert(
            domain.to_ascii_lowercase(),
            records.iter().map(|r| r.to_string()).collect(),
        );
    }

    pub fn add_a(&self, domain: &str, addrs: &[Ipv4Addr]) {
        self.a
            .lock()
            .insert(domain.to_ascii_lowercase(), addrs.to_vec());
    }

    pub fn add_aaaa(&self, domain: &str, addrs: &[Ipv6Addr]) {
        self.aaaa
            .lock()
            .insert(domain.to_ascii_lowercase(), addrs.to_vec());
    }

    pub fn add_mx(&self, domain: &str, records: &[(u16, &str)]) {
        self.mx.lock().insert(
            domain.to_ascii_lowercase(),
            records
                .iter()
                .map(|(priority, exchange)| MxRecord {
                    priority: *priority,
                    exchange: exchange.to_string(),
                })
                .collect(),
        );
    }

    /// Any lookup of `domain` fails with a transient error.
    pub fn fail_domain(&self, domain: &str, reason: &str) {
        self.failing
            .lock()
            .insert(domain.to_ascii_lowercase(), reason.to_string());
    }

    pub fn txt_queries(&self) -> u64 {
        self.txt_count.load(Ordering::Relaxed)
    }

    pub fn a_queries(&self) -> u64 {
        self.a_count.load(Ordering::Relaxed)
    }

    pub fn aaaa_queries(&self) -> u64 {
        self.aaaa_count.load(Ordering::Relaxed)
    }

    pub fn mx_queries(&self) -> u64 {
        self.mx_count.load(Ordering::Relaxed)
    }

    fn check_failure(&self, domain: &str) -> Result<()> {
        if let Some(reason) = self.failing.lock().get(&domain.to_ascii_lowercase()) {
            return Err(DnsError::temporary(domain, reason.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsResolver for MockResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>> {
        self.txt_count.fetch_add(1, Ordering::Relaxed);
        self.check_failure(domain)?;
        Ok(self
            .txt
            .lock()
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        self.a_count.fetch_add(1, Ordering::Relaxed);
        self.check_failure(domain)?;
        Ok(self
            .a
            .lock()
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>> {
        self.aaaa_count.fetch_add(1, Ordering::Relaxed);
        self.check_failure(domain)?;
        Ok(self
            .aaaa
            .lock()
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        self.mx_count.fetch_add(1, Ordering::Relaxed);
        self.check_failure(domain)?;
        Ok(self
            .mx
            .lock()
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}
