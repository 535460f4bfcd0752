/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Resolver trait and the system-backed implementation.

use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use common::error::{ClassifyError, ErrorClass};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, DnsError>;

/// DNS failures visible to callers.
///
/// Only transient failures are errors; a name with no records of the
/// requested type resolves to an empty sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("transient DNS failure for {domain}: {reason}")]
    Temporary { domain: String, reason: String },
    #[error("invalid domain name: {0}")]
    InvalidName(String),
}

impl DnsError {
    pub fn temporary(domain: &str, reason: impl Into<String>) -> Self {
        DnsError::Temporary {
            domain: domain.to_string(),
            reason: reason.into(),
        }
    }
}

impl ClassifyError for DnsError {
    fn class(&self) -> ErrorClass {
        match self {
            DnsError::Temporary { .. } => ErrorClass::Transient,
            DnsError::InvalidName(_) => ErrorClass::Validation,
        }
    }
}

/// One MX entry, lowest `priority` preferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub priority: u16,
    pub exchange: String,
}

/// Pluggable lookup backend. Absence of records is an empty sequence;
/// transient failure raises [`DnsError::Temporary`].
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>>;
    async fn resolve_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>>;
    async fn resolve_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>>;
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>>;
}

/// System resolver backed by hickory.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Creates a resolver using the system's default configuration.
    pub fn new() -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    fn map_err(domain: &str, err: hickory_resolver::error::ResolveError) -> Option<DnsError> {
        match err.kind() {
            // NXDOMAIN and empty answers are "no records", not failures.
            ResolveErrorKind::NoRecordsFound { .. } => None,
            _ => Some(DnsError::temporary(domain, err.to_string())),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>> {
        match self.inner.txt_lookup(domain).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<Vec<_>>()
                        .concat()
                })
                .collect()),
            Err(err) => match Self::map_err(domain, err) {
                None => Ok(Vec::new()),
                Some(err) => {
                    debug!(domain, %err, "TXT lookup failed");
                    Err(err)
                }
            },
        }
    }

    async fn resolve_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        match self.inner.ipv4_lookup(domain).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(err) => match Self::map_err(domain, err) {
                None => Ok(Vec::new()),
                Some(err) => Err(err),
            },
        }
    }

    async fn resolve_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>> {
        match self.inner.ipv6_lookup(domain).await {
            Ok(lookup) => Ok(lookup.iter().map(|aaaa| aaaa.0).collect()),
            Err(err) => match Self::map_err(domain, err) {
                None => Ok(Vec::new()),
                Some(err) => Err(err),
            },
        }
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        match self.inner.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<MxRecord> = lookup
                    .iter()
                    .map(|mx| MxRecord {
                        priority: mx.preference(),
                        exchange: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                    })
                    .collect();
                records.sort_by_key(|mx| mx.priority);
                Ok(records)
            }
            Err(err) => match Self::map_err(domain, err) {
                None => Ok(Vec::new()),
                Some(err) => Err(err),
            },
        }
    }
}
