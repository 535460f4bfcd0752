/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Remediator
//!
//! Applies quarantine, release and delete against the provider, with
//! tokens refreshed on demand and every provider call running under the
//! integration's circuit breaker. Each completed action writes an audit
//! entry and emits a notification.

use std::sync::Arc;

use chrono::Utc;
use resilience::{BreakerError, CircuitBreaker};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditSink, NotificationSink, RemediationEvent};
use crate::provider::{MailboxProvider, OAuthTokens, ProviderError};
use crate::tokens::TokenManager;

const QUARANTINE_NAME: &str = "Quarantine";
const INBOX_LABEL: &str = "INBOX";

/// Actions the pipeline can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemediationAction {
    Quarantine,
    Release,
    Delete,
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RemediationAction::Quarantine => "quarantine",
            RemediationAction::Release => "release",
            RemediationAction::Delete => "delete",
        })
    }
}

/// Remediation failures.
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("no tokens stored for integration {0}")]
    NoTokens(String),
    #[error("token store failed: {0}")]
    TokenStore(String),
    #[error("circuit '{0}' is open, remediation deferred")]
    CircuitOpen(String),
    #[error("provider call timed out under circuit '{0}'")]
    ProviderTimeout(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("audit write failed: {0}")]
    Audit(String),
}

pub(crate) fn map_breaker(err: BreakerError<ProviderError>) -> RemediationError {
    match err {
        BreakerError::Open { name, .. } => RemediationError::CircuitOpen(name),
        BreakerError::Timeout { name, .. } => RemediationError::ProviderTimeout(name),
        BreakerError::Inner(inner) => RemediationError::Provider(inner),
    }
}

/// Quarantine/release/delete driver over one provider integration.
pub struct Remediator {
    provider: Arc<dyn MailboxProvider>,
    tokens: TokenManager,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<dyn NotificationSink>,
}

impl Remediator {
    pub fn new(
        provider: Arc<dyn MailboxProvider>,
        tokens: TokenManager,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditSink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            provider,
            tokens,
            breaker,
            audit,
            notifications,
        }
    }

    /// Moves the message out of the inbox into quarantine.
    pub async fn quarantine(
        &self,
        tenant_id: &str,
        integration_id: &str,
        message_id: &str,
    ) -> Result<(), RemediationError> {
        self.quarantine_as(tenant_id, integration_id, message_id, "operator")
            .await
    }

    /// Reverses a quarantine.
    pub async fn release(
        &self,
        tenant_id: &str,
        integration_id: &str,
        message_id: &str,
    ) -> Result<(), RemediationError> {
        let tokens = self.tokens.current(integration_id, &*self.provider).await?;
        if self.provider.uses_labels() {
            let label = self.ensure_quarantine(&tokens).await?;
            let inbox_label = INBOX_LABEL.to_string();
            self.guarded(|| {
                self.provider
                    .add_labels(&tokens, message_id, std::slice::from_ref(&inbox_label))
            })
            .await?;
            self.guarded(|| {
                self.provider
                    .remove_labels(&tokens, message_id, std::slice::from_ref(&label))
            })
            .await?;
        } else {
            let inbox = self
                .guarded(|| self.provider.ensure_folder(&tokens, "Inbox"))
                .await?;
            self.guarded(|| self.provider.move_to(&tokens, &inbox, message_id))
                .await?;
        }
        self.record(tenant_id, message_id, RemediationAction::Release, "operator")
            .await
    }

    /// Moves the message to the provider's trash equivalent.
    pub async fn delete(
        &self,
        tenant_id: &str,
        integration_id: &str,
        message_id: &str,
    ) -> Result<(), RemediationError> {
        let tokens = self.tokens.current(integration_id, &*self.provider).await?;
        self.guarded(|| self.provider.trash(&tokens, message_id))
            .await?;
        self.record(tenant_id, message_id, RemediationAction::Delete, "operator")
            .await
    }

    /// Pipeline entry point: applies the action derived from a verdict
    /// (`block` maps to delete, `quarantine` to quarantine). The caller
    /// awaits completion so the stored verdict and the audit trail agree.
    pub async fn auto_remediate(
        &self,
        tenant_id: &str,
        integration_id: &str,
        message_id: &str,
        action: RemediationAction,
    ) -> Result<(), RemediationError> {
        info!(tenant_id, message_id, %action, "auto-remediation triggered");
        match action {
            RemediationAction::Delete => {
                let tokens = self.tokens.current(integration_id, &*self.provider).await?;
                self.guarded(|| self.provider.trash(&tokens, message_id))
                    .await?;
                self.record(tenant_id, message_id, action, "auto-remediation")
                    .await
            }
            RemediationAction::Quarantine => {
                self.quarantine_as(tenant_id, integration_id, message_id, "auto-remediation")
                    .await
            }
            RemediationAction::Release => {
                warn!(message_id, "auto-remediation never releases; ignoring");
                Ok(())
            }
        }
    }

    async fn quarantine_as(
        &self,
        tenant_id: &str,
        integration_id: &str,
        message_id: &str,
        actor: &str,
    ) -> Result<(), RemediationError> {
        let tokens = self.tokens.current(integration_id, &*self.provider).await?;
        if self.provider.uses_labels() {
            let label = self.ensure_quarantine(&tokens).await?;
            self.guarded(|| {
                self.provider
                    .add_labels(&tokens, message_id, std::slice::from_ref(&label))
            })
            .await?;
            let inbox_label = INBOX_LABEL.to_string();
            self.guarded(|| {
                self.provider
                    .remove_labels(&tokens, message_id, std::slice::from_ref(&inbox_label))
            })
            .await?;
        } else {
            let folder = self.ensure_quarantine(&tokens).await?;
            self.guarded(|| self.provider.move_to(&tokens, &folder, message_id))
                .await?;
        }
        self.record(tenant_id, message_id, RemediationAction::Quarantine, actor)
            .await
    }

    async fn ensure_quarantine(&self, tokens: &OAuthTokens) -> Result<String, RemediationError> {
        self.guarded(|| self.provider.ensure_folder(tokens, QUARANTINE_NAME))
            .await
    }

    async fn guarded<T, F, Fut>(&self, operation: F) -> Result<T, RemediationError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        self.breaker
            .execute_classified(operation)
            .await
            .map_err(map_breaker)
    }

    async fn record(
        &self,
        tenant_id: &str,
        message_id: &str,
        action: RemediationAction,
        actor: &str,
    ) -> Result<(), RemediationError> {
        let entry = AuditEntry::new(tenant_id, message_id, action, actor, self.provider.name());
        self.audit
            .record(entry)
            .await
            .map_err(RemediationError::Audit)?;

        let event = RemediationEvent {
            tenant_id: tenant_id.to_string(),
            message_id: message_id.to_string(),
            action,
            provider: self.provider.name().to_string(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.notifications.notify(event).await {
            // Notification delivery is best-effort; the action already
            // happened and is audited.
            warn!(error = %err, "notification delivery failed");
        }
        info!(tenant_id, message_id, %action, "remediation recorded");
        Ok(())
    }
}

// COMPREHENSIVE TEST SUITE - ALWAYS AT THE BOTTOM OF EVERY FILE
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, MemoryNotificationSink};
    use crate::tokens::{InMemoryTokenStore, TokenStore};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use resilience::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider double: records calls, optionally fails, switchable
    /// between label and folder mode.
    struct FakeProvider {
        labels_mode: bool,
        calls: Mutex<Vec<String>>,
        refreshes: AtomicU32,
        fail_all: std::sync::atomic::AtomicBool,
    }

    impl FakeProvider {
        fn labels() -> Self {
            Self {
                labels_mode: true,
                calls: Mutex::new(Vec::new()),
                refreshes: AtomicU32::new(0),
                fail_all: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn folders() -> Self {
            Self {
                labels_mode: false,
                ..Self::labels()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn check(&self) -> Result<(), ProviderError> {
            if self.fail_all.load(Ordering::SeqCst) {
                Err(ProviderError::Transport("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MailboxProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn uses_labels(&self) -> bool {
            self.labels_mode
        }

        async fn ensure_folder(
            &self,
            _tokens: &OAuthTokens,
            name: &str,
        ) -> Result<String, ProviderError> {
            self.check()?;
            self.calls.lock().push(format!("ensure_folder:{name}"));
            Ok(format!("id-{name}"))
        }

        async fn move_to(
            &self,
            _tokens: &OAuthTokens,
            folder_id: &str,
            message_id: &str,
        ) -> Result<(), ProviderError> {
            self.check()?;
            self.calls
                .lock()
                .push(format!("move:{message_id}->{folder_id}"));
            Ok(())
        }

        async fn add_labels(
            &self,
            _tokens: &OAuthTokens,
            message_id: &str,
            labels: &[String],
        ) -> Result<(), ProviderError> {
            self.check()?;
            self.calls
                .lock()
                .push(format!("add:{message_id}:{}", labels.join(",")));
            Ok(())
        }

        async fn remove_labels(
            &self,
            _tokens: &OAuthTokens,
            message_id: &str,
            labels: &[String],
        ) -> Result<(), ProviderError> {
            self.check()?;
            self.calls
                .lock()
                .push(format!("remove:{message_id}:{}", labels.join(",")));
            Ok(())
        }

        async fn trash(
            &self,
            _tokens: &OAuthTokens,
            message_id: &str,
        ) -> Result<(), ProviderError> {
            self.check()?;
            self.calls.lock().push(format!("trash:{message_id}"));
            Ok(())
        }

        async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, ProviderError> {
            self.check()?;
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(OAuthTokens {
                access_token: "fresh-access".to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            })
        }
    }

    struct Fixture {
        provider: Arc<FakeProvider>,
        store: Arc<InMemoryTokenStore>,
        audit: Arc<MemoryAuditSink>,
        notifications: Arc<MemoryNotificationSink>,
        remediator: Remediator,
    }

    fn fixture(provider: FakeProvider) -> Fixture {
        let provider = Arc::new(provider);
        let store = Arc::new(InMemoryTokenStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let notifications = Arc::new(MemoryNotificationSink::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "provider",
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
        ));
        let remediator = Remediator::new(
            Arc::clone(&provider) as Arc<dyn MailboxProvider>,
            TokenManager::new(
                Arc::clone(&store) as Arc<dyn TokenStore>,
                Arc::clone(&breaker),
            ),
            breaker,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Arc::clone(&notifications) as Arc<dyn NotificationSink>,
        );
        Fixture {
            provider,
            store,
            audit,
            notifications,
            remediator,
        }
    }

    fn live_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        }
    }

    fn expired_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "stale".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() - ChronoDuration::hours(1),
        }
    }

    #[tokio::test]
    async fn quarantine_on_label_provider_relabels() {
        let f = fixture(FakeProvider::labels());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator.quarantine("t1", "acct", "msg-1").await.unwrap();

        let calls = f.provider.calls();
        assert_eq!(
            calls,
            vec![
                "ensure_folder:Quarantine",
                "add:msg-1:id-Quarantine",
                "remove:msg-1:INBOX"
            ]
        );
        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, RemediationAction::Quarantine);
        assert_eq!(f.notifications.events().len(), 1);
    }

    #[tokio::test]
    async fn quarantine_on_folder_provider_moves() {
        let f = fixture(FakeProvider::folders());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator.quarantine("t1", "acct", "msg-2").await.unwrap();

        let calls = f.provider.calls();
        assert_eq!(
            calls,
            vec!["ensure_folder:Quarantine", "move:msg-2->id-Quarantine"]
        );
    }

    #[tokio::test]
    async fn release_reverses_quarantine_labels() {
        let f = fixture(FakeProvider::labels());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator.release("t1", "acct", "msg-3").await.unwrap();

        let calls = f.provider.calls();
        assert_eq!(
            calls,
            vec![
                "ensure_folder:Quarantine",
                "add:msg-3:INBOX",
                "remove:msg-3:id-Quarantine"
            ]
        );
    }

    #[tokio::test]
    async fn delete_trashes_message() {
        let f = fixture(FakeProvider::folders());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator.delete("t1", "acct", "msg-4").await.unwrap();
        assert_eq!(f.provider.calls(), vec!["trash:msg-4"]);
    }

    #[tokio::test]
    async fn expired_tokens_are_refreshed_and_persisted() {
        let f = fixture(FakeProvider::folders());
        f.store.save("acct", &expired_tokens()).await.unwrap();

        f.remediator.delete("t1", "acct", "msg-5").await.unwrap();

        assert_eq!(f.provider.refreshes.load(Ordering::SeqCst), 1);
        let stored = f.store.load("acct").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-access");
        assert!(!stored.is_expired());
    }

    #[tokio::test]
    async fn missing_tokens_surface_as_error() {
        let f = fixture(FakeProvider::folders());
        let err = f.remediator.delete("t1", "ghost", "msg").await.unwrap_err();
        assert!(matches!(err, RemediationError::NoTokens(_)));
        assert!(f.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn auto_remediate_block_deletes_with_auto_actor() {
        let f = fixture(FakeProvider::folders());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator
            .auto_remediate("t1", "acct", "msg-6", RemediationAction::Delete)
            .await
            .unwrap();

        assert_eq!(f.provider.calls(), vec!["trash:msg-6"]);
        let entries = f.audit.entries();
        assert_eq!(entries[0].actor, "auto-remediation");
        assert_eq!(entries[0].action, RemediationAction::Delete);
    }

    #[tokio::test]
    async fn auto_remediate_quarantine_uses_auto_actor() {
        let f = fixture(FakeProvider::labels());
        f.store.save("acct", &live_tokens()).await.unwrap();

        f.remediator
            .auto_remediate("t1", "acct", "msg-7", RemediationAction::Quarantine)
            .await
            .unwrap();

        let entries = f.audit.entries();
        assert_eq!(entries[0].actor, "auto-remediation");
        assert_eq!(entries[0].action, RemediationAction::Quarantine);
    }

    #[tokio::test]
    async fn repeated_transport_failures_open_the_circuit() {
        let f = fixture(FakeProvider::folders());
        f.store.save("acct", &live_tokens()).await.unwrap();
        f.provider.fail_all.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            let err = f.remediator.delete("t1", "acct", "msg").await.unwrap_err();
            assert!(matches!(err, RemediationError::Provider(_)));
        }
        let err = f.remediator.delete("t1", "acct", "msg").await.unwrap_err();
        assert!(matches!(err, RemediationError::CircuitOpen(_)));
        // Nothing was audited for the failed attempts.
        assert!(f.audit.entries().is_empty());
    }
}
