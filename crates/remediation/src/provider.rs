/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Abstract mailbox-provider interface
//!
//! The core consumes exactly the primitives listed here; provider client
//! libraries stay outside the system boundary. Operations are idempotent
//! from the caller's point of view: trashing an already-trashed message
//! must not fail the pipeline, so implementations map "already gone"
//! responses to success.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::error::{ClassifyError, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access/refresh token pair for one mailbox integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    /// Expired, with a safety margin so a token never dies mid-request.
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(60) >= self.expires_at
    }
}

/// Provider call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network-level failure or 5xx; retryable.
    #[error("provider request failed: {0}")]
    Transport(String),
    /// The provider rejected the request.
    #[error("provider rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
}

impl ProviderError {
    pub(crate) fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            ProviderError::Transport(format!("status {status}: {message}"))
        } else {
            ProviderError::Api { status, message }
        }
    }
}

impl ClassifyError for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Transport(_) => ErrorClass::Transient,
            ProviderError::Api { .. } => ErrorClass::Permanent,
            ProviderError::TokenRefresh(_) => ErrorClass::Transient,
        }
    }
}

/// Primitives the remediator consumes. `folder` arguments are provider
/// folder/label identifiers as returned by [`ensure_folder`].
///
/// [`ensure_folder`]: MailboxProvider::ensure_folder
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Label-oriented providers quarantine by relabeling; folder-oriented
    /// ones by moving.
    fn uses_labels(&self) -> bool;

    /// Returns the identifier of the named folder/label, creating it when
    /// missing.
    async fn ensure_folder(
        &self,
        tokens: &OAuthTokens,
        name: &str,
    ) -> Result<String, ProviderError>;

    async fn move_to(
        &self,
        tokens: &OAuthTokens,
        folder_id: &str,
        message_id: &str,
    ) -> Result<(), ProviderError>;

    async fn add_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError>;

    async fn remove_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError>;

    /// Moves the message to the provider's trash equivalent.
    async fn trash(&self, tokens: &OAuthTokens, message_id: &str) -> Result<(), ProviderError>;

    /// Exchanges a refresh token for a fresh access/refresh pair.
    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_separates_transient_from_permanent() {
        assert_eq!(
            ProviderError::from_status(503, "oops").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::from_status(429, "slow down").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::from_status(403, "forbidden").class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn expiry_includes_margin() {
        let fresh = OAuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!fresh.is_expired());

        let nearly = OAuthTokens {
            expires_at: Utc::now() + Duration::seconds(30),
            ..fresh.clone()
        };
        assert!(nearly.is_expired());
    }
}
