/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Verdict model

use auth::{DkimResult, DkimVerification, DmarcEvaluation, SpfEvaluation};
use chrono::{DateTime, Utc};
use classifier::EmailClassification;
use common::TenantId;
use serde::{Deserialize, Serialize};

use crate::signals::ThreatSignal;

/// Disposition derived from the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictAction {
    Allow,
    Flag,
    Quarantine,
    Block,
}

impl std::fmt::Display for VerdictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VerdictAction::Allow => "allow",
            VerdictAction::Flag => "flag",
            VerdictAction::Quarantine => "quarantine",
            VerdictAction::Block => "block",
        })
    }
}

/// Serializable per-signature DKIM outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimOutcome {
    pub result: DkimResult,
    pub domain: String,
    pub selector: String,
    pub error: Option<String>,
}

impl From<&DkimVerification> for DkimOutcome {
    fn from(verification: &DkimVerification) -> Self {
        Self {
            result: verification.result,
            domain: verification.domain.clone(),
            selector: verification.selector.clone(),
            error: verification.error.clone(),
        }
    }
}

/// SPF/DKIM/DMARC results as attached to the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationSummary {
    pub spf: SpfEvaluation,
    pub dkim: Vec<DkimOutcome>,
    pub dmarc: DmarcEvaluation,
}

/// The pipeline's output for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatVerdict {
    pub message_id: String,
    pub tenant_id: TenantId,
    pub action: VerdictAction,
    /// Final score after the classification modifier, clamped to [0, 100].
    pub score: f32,
    /// Signal sum before modulation.
    pub raw_score: f32,
    pub signals: Vec<ThreatSignal>,
    pub classification: EmailClassification,
    pub auth: AuthenticationSummary,
    pub evaluated_at: DateTime<Utc>,
}

impl ThreatVerdict {
    /// Whether this verdict triggers auto-remediation.
    pub fn needs_remediation(&self) -> bool {
        matches!(self.action, VerdictAction::Quarantine | VerdictAction::Block)
    }
}
