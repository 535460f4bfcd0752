/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! OAuth token lifecycle
//!
//! Tokens live in a persistent store keyed by integration id. On use, an
//! expired token is refreshed through the provider under circuit-breaker
//! protection and the new pair is persisted before the caller proceeds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience::CircuitBreaker;
use tracing::{debug, info};

use crate::provider::{MailboxProvider, OAuthTokens};
use crate::remediator::{map_breaker, RemediationError};

/// Persistent storage for per-integration token pairs.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, integration_id: &str) -> Result<Option<OAuthTokens>, String>;
    async fn save(&self, integration_id: &str, tokens: &OAuthTokens) -> Result<(), String>;
}

/// Map-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<String, OAuthTokens>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self, integration_id: &str) -> Result<Option<OAuthTokens>, String> {
        Ok(self.tokens.lock().get(integration_id).cloned())
    }

    async fn save(&self, integration_id: &str, tokens: &OAuthTokens) -> Result<(), String> {
        self.tokens
            .lock()
            .insert(integration_id.to_string(), tokens.clone());
        Ok(())
    }
}

/// Loads tokens and refreshes them on expiry.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    breaker: Arc<CircuitBreaker>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// Stores the initial token pair for an integration.
    pub async fn install(
        &self,
        integration_id: &str,
        tokens: OAuthTokens,
    ) -> Result<(), RemediationError> {
        self.store
            .save(integration_id, &tokens)
            .await
            .map_err(RemediationError::TokenStore)
    }

    /// Returns live tokens for the integration, refreshing and persisting
    /// when the stored pair has expired.
    pub async fn current(
        &self,
        integration_id: &str,
        provider: &dyn MailboxProvider,
    ) -> Result<OAuthTokens, RemediationError> {
        let tokens = self
            .store
            .load(integration_id)
            .await
            .map_err(RemediationError::TokenStore)?
            .ok_or_else(|| RemediationError::NoTokens(integration_id.to_string()))?;

        if !tokens.is_expired() {
            return Ok(tokens);
        }

        debug!(integration_id, "access token expired, refreshing");
        let refreshed = self
            .breaker
            .execute_classified(|| provider.refresh_token(&tokens.refresh_token))
            .await
            .map_err(map_breaker)?;

        self.store
            .save(integration_id, &refreshed)
            .await
            .map_err(RemediationError::TokenStore)?;
        info!(integration_id, "token refreshed and persisted");
        Ok(refreshed)
    }
}
