/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Process configuration
//!
//! The core is embedded in a host service; everything it needs from the
//! environment is collected here once at startup. Missing optional values
//! disable the corresponding integration rather than failing.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// DNS backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DnsBackendKind {
    /// System resolver (hickory) behind the shared cache.
    #[default]
    System,
    /// In-process mock, for tests and air-gapped runs.
    Mock,
}

/// OAuth client credentials for one mailbox-provider integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Optional GeoIP reputation service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoIpConfig {
    pub service_url: String,
    pub api_key: Option<String>,
}

/// Core configuration, read from the environment at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub dns_backend: DnsBackendKind,
    pub geoip: Option<GeoIpConfig>,
    pub google_oauth: Option<OAuthClientConfig>,
    pub microsoft_oauth: Option<OAuthClientConfig>,
    /// Secret for backup encryption; right-sized to 32 bytes by the
    /// disaster-recovery layer.
    pub backup_encryption_key: Option<String>,
    pub log_level: Option<String>,
}

impl CoreConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Self {
        let dns_backend = match std::env::var("MAILWARDEN_DNS_BACKEND").ok().as_deref() {
            Some("mock") => DnsBackendKind::Mock,
            Some("system") | None => DnsBackendKind::System,
            Some(other) => {
                warn!(backend = other, "unknown DNS backend selector, using system");
                DnsBackendKind::System
            }
        };

        let geoip = std::env::var("GEOIP_SERVICE_URL").ok().map(|service_url| GeoIpConfig {
            service_url,
            api_key: std::env::var("GEOIP_API_KEY").ok(),
        });

        Self {
            dns_backend,
            geoip,
            google_oauth: oauth_pair("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET"),
            microsoft_oauth: oauth_pair("MICROSOFT_CLIENT_ID", "MICROSOFT_CLIENT_SECRET"),
            backup_encryption_key: std::env::var("BACKUP_ENCRYPTION_KEY").ok(),
            log_level: std::env::var("MAILWARDEN_LOG_LEVEL").ok(),
        }
    }
}

fn oauth_pair(id_var: &str, secret_var: &str) -> Option<OAuthClientConfig> {
    match (std::env::var(id_var), std::env::var(secret_var)) {
        (Ok(client_id), Ok(client_secret)) => Some(OAuthClientConfig {
            client_id,
            client_secret,
        }),
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
            warn!(id = id_var, secret = secret_var, "incomplete OAuth client pair ignored");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_system_backend() {
        let config = CoreConfig::default();
        assert_eq!(config.dns_backend, DnsBackendKind::System);
        assert!(config.google_oauth.is_none());
        assert!(config.backup_encryption_key.is_none());
    }
}
