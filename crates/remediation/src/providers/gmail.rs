/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Gmail provider (label-oriented)
//!
//! Quarantine is expressed through labels: apply the quarantine label and
//! remove INBOX. A 404 on modify or trash means the message is already
//! gone and is treated as success.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::OAuthClientConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::provider::{MailboxProvider, OAuthTokens, ProviderError};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Gmail REST client.
pub struct GmailProvider {
    client: reqwest::Client,
    oauth: OAuthClientConfig,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl GmailProvider {
    pub fn new(oauth: OAuthClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth,
        }
    }

    async fn request(
        &self,
        tokens: &OAuthTokens,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = builder
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(code, message))
    }

    /// Treats "message not found" as success: the caller's goal state is
    /// already reached.
    fn idempotent(result: Result<reqwest::Response, ProviderError>) -> Result<(), ProviderError> {
        match result {
            Ok(_) => Ok(()),
            Err(ProviderError::Api { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn modify_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ProviderError> {
        let url = format!("{API_BASE}/messages/{message_id}/modify");
        let body = json!({
            "addLabelIds": add,
            "removeLabelIds": remove,
        });
        Self::idempotent(
            self.request(tokens, self.client.post(&url).json(&body))
                .await,
        )
    }
}

#[async_trait]
impl MailboxProvider for GmailProvider {
    fn name(&self) -> &str {
        "gmail"
    }

    fn uses_labels(&self) -> bool {
        true
    }

    async fn ensure_folder(
        &self,
        tokens: &OAuthTokens,
        name: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{API_BASE}/labels");
        let list: LabelList = self
            .request(tokens, self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        if let Some(label) = list.labels.iter().find(|l| l.name.eq_ignore_ascii_case(name)) {
            return Ok(label.id.clone());
        }

        debug!(label = name, "creating Gmail label");
        let created: Label = self
            .request(
                tokens,
                self.client.post(&url).json(&json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                })),
            )
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Ok(created.id)
    }

    async fn move_to(
        &self,
        tokens: &OAuthTokens,
        folder_id: &str,
        message_id: &str,
    ) -> Result<(), ProviderError> {
        // Gmail has no folders; a move is label replacement.
        self.modify_labels(
            tokens,
            message_id,
            &[folder_id.to_string()],
            &["INBOX".to_string()],
        )
        .await
    }

    async fn add_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError> {
        self.modify_labels(tokens, message_id, labels, &[]).await
    }

    async fn remove_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError> {
        self.modify_labels(tokens, message_id, &[], labels).await
    }

    async fn trash(&self, tokens: &OAuthTokens, message_id: &str) -> Result<(), ProviderError> {
        let url = format!("{API_BASE}/messages/{message_id}/trash");
        Self::idempotent(self.request(tokens, self.client.post(&url)).await)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, ProviderError> {
        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| ProviderError::TokenRefresh(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::TokenRefresh(format!(
                "status {status}: {message}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::TokenRefresh(err.to_string()))?;
        Ok(OAuthTokens {
            access_token: token.access_token,
            // Google only rotates the refresh token sometimes.
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
