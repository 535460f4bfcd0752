/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # MailWarden DNS
//!
//! TTL-bounded TXT/A/AAAA/MX resolution behind a pluggable backend. The
//! authentication engine performs all of its lookups through the
//! [`DnsResolver`] trait so tests run against the in-crate [`MockResolver`]
//! and production runs against the hickory-backed [`SystemResolver`], both
//! usually wrapped by [`CachingResolver`].
//!
//! A successful lookup that returns no records is an empty sequence, not an
//! error; transient failures surface as [`DnsError::Temporary`] which the
//! authentication layer maps to `temperror`.

pub mod cache;
pub mod mock;
pub mod resolver;

pub use cache::{CacheStats, CachingResolver, DnsCacheConfig};
pub use mock::MockResolver;
pub use resolver::{DnsError, DnsResolver, MxRecord, Result, SystemResolver};
