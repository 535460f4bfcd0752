/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # MailWarden Remediation
//!
//! Applies verdicts back to the hosted mailbox: quarantine, release and
//! delete, through an abstract provider interface with label-oriented
//! (Gmail) and folder-oriented (Microsoft 365) implementations. OAuth
//! tokens are refreshed on expiry under circuit-breaker protection and
//! persisted back to the token store. Every action writes an audit entry
//! and emits a notification.

pub mod audit;
pub mod provider;
pub mod providers;
pub mod remediator;
pub mod tokens;

pub use audit::{
    AuditEntry, AuditSink, MemoryAuditSink, MemoryNotificationSink, NotificationSink,
    RemediationEvent,
};
pub use provider::{MailboxProvider, OAuthTokens, ProviderError};
pub use providers::{GmailProvider, MicrosoftProvider};
pub use remediator::{RemediationAction, RemediationError, Remediator};
pub use tokens::{InMemoryTokenStore, TokenManager, TokenStore};
