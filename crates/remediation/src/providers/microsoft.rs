/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Microsoft 365 provider (folder-oriented)
//!
//! Quarantine moves the message into a quarantine mail folder via the
//! Graph API; labels map onto Outlook categories. A 404 on move or trash
//! is treated as success.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::OAuthClientConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::provider::{MailboxProvider, OAuthTokens, ProviderError};

const API_BASE: &str = "https://graph.microsoft.com/v1.0/me";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Microsoft Graph client.
pub struct MicrosoftProvider {
    client: reqwest::Client,
    oauth: OAuthClientConfig,
}

#[derive(Debug, Deserialize)]
struct FolderList {
    #[serde(default)]
    value: Vec<Folder>,
}

#[derive(Debug, Deserialize)]
struct Folder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl MicrosoftProvider {
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

    fn idempotent(result: Result<reqwest::Response, ProviderError>) -> Result<(), ProviderError> {
        match result {
            Ok(_) => Ok(()),
            Err(ProviderError::Api { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn patch_categories(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        categories: Vec<String>,
    ) -> Result<(), ProviderError> {
        let url = format!("{API_BASE}/messages/{message_id}");
        Self::idempotent(
            self.request(
                tokens,
                self.client
                    .patch(&url)
                    .json(&json!({ "categories": categories })),
            )
            .await,
        )
    }

    async fn current_categories(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!("{API_BASE}/messages/{message_id}?$select=categories");
        let message: Message = self
            .request(tokens, self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Ok(message.categories)
    }
}

#[async_trait]
impl MailboxProvider for MicrosoftProvider {
    fn name(&self) -> &str {
        "microsoft365"
    }

    fn uses_labels(&self) -> bool {
        false
    }

    async fn ensure_folder(
        &self,
        tokens: &OAuthTokens,
        name: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{API_BASE}/mailFolders");
        let list: FolderList = self
            .request(tokens, self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        if let Some(folder) = list
            .value
            .iter()
            .find(|f| f.display_name.eq_ignore_ascii_case(name))
        {
            return Ok(folder.id.clone());
        }

        debug!(folder = name, "creating mail folder");
        let created: Folder = self
            .request(
                tokens,
                self.client.post(&url).json(&json!({ "displayName": name })),
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
        let url = format!("{API_BASE}/messages/{message_id}/move");
        Self::idempotent(
            self.request(
                tokens,
                self.client
                    .post(&url)
                    .json(&json!({ "destinationId": folder_id })),
            )
            .await,
        )
    }

    async fn add_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError> {
        let mut categories = self.current_categories(tokens, message_id).await?;
        for label in labels {
            if !categories.iter().any(|c| c.eq_ignore_ascii_case(label)) {
                categories.push(label.clone());
            }
        }
        self.patch_categories(tokens, message_id, categories).await
    }

    async fn remove_labels(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
        labels: &[String],
    ) -> Result<(), ProviderError> {
        let categories = self
            .current_categories(tokens, message_id)
            .await?
            .into_iter()
            .filter(|c| !labels.iter().any(|l| l.eq_ignore_ascii_case(c)))
            .collect();
        self.patch_categories(tokens, message_id, categories).await
    }

    async fn trash(&self, tokens: &OAuthTokens, message_id: &str) -> Result<(), ProviderError> {
        // Graph exposes trash as a move to the well-known folder.
        self.move_to(tokens, "deleteditems", message_id).await
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
                ("scope", "https://graph.microsoft.com/.default offline_access"),
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
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
