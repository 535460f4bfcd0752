/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Audit and notification collaborators
//!
//! Every remediation writes an audit entry and emits a notification event;
//! persistence and delivery are external concerns behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TenantId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remediator::RemediationAction;

/// One audited remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub tenant_id: TenantId,
    pub message_id: String,
    pub action: RemediationAction,
    /// "auto-remediation" or the operator identity.
    pub actor: String,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        message_id: &str,
        action: RemediationAction,
        actor: &str,
        provider: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            message_id: message_id.to_string(),
            action,
            actor: actor.to_string(),
            provider: provider.to_string(),
            timestamp: Utc::now(),
            detail: None,
        }
    }
}

/// Event pushed to external notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEvent {
    pub tenant_id: TenantId,
    pub message_id: String,
    pub action: RemediationAction,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable audit log, provided by the host service.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), String>;
}

/// Notification fan-out, provided by the host service.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: RemediationEvent) -> Result<(), String>;
}

/// In-memory audit sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), String> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

/// In-memory notification sink for tests.
#[derive(Default)]
pub struct MemoryNotificationSink {
    events: Mutex<Vec<RemediationEvent>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RemediationEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, event: RemediationEvent) -> Result<(), String> {
        self.events.lock().push(event);
        Ok(())
    }
}
