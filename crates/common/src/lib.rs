/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # MailWarden Common
//!
//! Shared data model for the threat-detection core: the parsed message that
//! flows through the scoring pipeline, the error classification used by the
//! resilience layer, and process configuration read from the environment.

pub mod config;
pub mod email;
pub mod error;

pub use config::{CoreConfig, DnsBackendKind, OAuthClientConfig};
pub use email::{Attachment, EmailAddress, EmailBody, ParsedEmail};
pub use error::{is_transient_failure, ErrorClass};

/// Tenant identifier attached to every job and audit entry.
pub type TenantId = String;
