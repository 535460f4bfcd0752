//! Email-type inference
//!
//! Runs the sender registry first, then subject/content heuristics. The
//! resulting classification carries a threat-score modifier in `[0, 1]`
//! that is monotonic in trust, plus gates that switch off BEC and gift-card
//! detection where they only produce noise.

use std::sync::Arc;

use common::ParsedEmail;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::registry::{SenderCategory, SenderInfo, SenderRegistry};
use crate::signals::{MarketingSignals, SignalDetector};

/// Inferred email type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailType {
    Marketing,
    Transactional,
    Automated,
    Personal,
    Unknown,
}

impl std::fmt::Display for EmailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EmailType::Marketing => "marketing",
            EmailType::Transactional => "transactional",
            EmailType::Automated => "automated",
            EmailType::Personal => "personal",
            EmailType::Unknown => "unknown",
        })
    }
}

/// Classification outcome consumed by the scoring pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailClassification {
    pub email_type: EmailType,
    pub confidence: f32,
    /// Multiplicative factor applied to the threat score, in `[0, 1]`.
    pub threat_score_modifier: f32,
    pub skip_bec_detection: bool,
    pub skip_gift_card_detection: bool,
    pub marketing_signals: MarketingSignals,
    #[serde(skip)]
    pub sender: Option<Arc<SenderInfo>>,
}

/// Local parts that identify automated senders.
const AUTOMATED_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "notifications",
    "notification",
    "alerts",
    "alert",
    "system",
    "automated",
];

/// Classifier with compiled subject heuristics.
pub struct EmailClassifier {
    registry: Arc<SenderRegistry>,
    detector: SignalDetector,
    transactional_subject: Regex,
    automated_subject: Regex,
    conversational_subject: Regex,
    greeting: Regex,
}

impl EmailClassifier {
    pub fn new(registry: Arc<SenderRegistry>) -> Self {
        Self {
            registry,
            detector: SignalDetector::new(),
            transactional_subject: Regex::new(
                r"(?i)(order (confirmation|#\d+)|receipt|invoice|password reset|verify your|verification code|shipping (confirmation|update|notification)|your (package|order|delivery)|payment (received|confirmation|due)|account (statement|alert|activity)|two[- ]factor|security (code|alert)|booking confirmation|appointment (reminder|confirmed))",
            )
            .unwrap(),
            automated_subject: Regex::new(
                r"(?i)(do[- ]?not[- ]?reply|automat(ed|ic) (reply|response|notification|message)|system notification|backup (completed|failed)|cron|build (passed|failed|succeeded)|\[jira\]|\[github\]|scheduled (maintenance|report))",
            )
            .unwrap(),
            conversational_subject: Regex::new(r"(?i)^\s*(re|fw|fwd)\s*:").unwrap(),
            greeting: Regex::new(r"(?i)^\s*(hi|hello|hey|dear)\b").unwrap(),
        }
    }

    /// Infers the email type and threat-score modifier for one message.
    pub fn classify(&self, email: &ParsedEmail) -> EmailClassification {
        let marketing = self.detector.detect(email);
        let sender = self
            .registry
            .lookup_sender(&email.from.address, &email.from.domain);

        let classification = if let Some(info) = &sender {
            self.classify_known_sender(Arc::clone(info), marketing)
        } else {
            self.classify_by_content(email, marketing)
        };

        trace!(
            message_id = %email.message_id,
            email_type = %classification.email_type,
            modifier = classification.threat_score_modifier,
            "email classified"
        );
        classification
    }

    fn classify_known_sender(
        &self,
        info: Arc<SenderInfo>,
        marketing: MarketingSignals,
    ) -> EmailClassification {
        let (email_type, confidence, modifier) = match info.category {
            SenderCategory::Trusted => (EmailType::Personal, 0.9, 0.2),
            SenderCategory::Retail | SenderCategory::Ecommerce | SenderCategory::Marketing => {
                (EmailType::Marketing, 0.9, 0.3)
            }
            SenderCategory::Transactional | SenderCategory::Financial => {
                (EmailType::Transactional, 0.85, 0.6)
            }
            SenderCategory::Saas | SenderCategory::Automated => (EmailType::Automated, 0.8, 0.7),
        };
        let skip_gift = email_type == EmailType::Marketing
            || matches!(
                info.category,
                SenderCategory::Retail | SenderCategory::Ecommerce
            );
        EmailClassification {
            email_type,
            confidence,
            // Known-sender trust wins over the generic per-type table.
            threat_score_modifier: modifier,
            skip_bec_detection: matches!(
                email_type,
                EmailType::Marketing | EmailType::Transactional
            ),
            skip_gift_card_detection: skip_gift,
            marketing_signals: marketing,
            sender: Some(info),
        }
    }

    fn classify_by_content(
        &self,
        email: &ParsedEmail,
        marketing: MarketingSignals,
    ) -> EmailClassification {
        if marketing.confidence >= 0.7 {
            let modifier = if marketing.count() >= 4 { 0.4 } else { 0.5 };
            return self.content_classification(
                EmailType::Marketing,
                marketing.confidence,
                modifier,
                marketing,
            );
        }

        if self.transactional_subject.is_match(&email.subject) {
            return self.content_classification(EmailType::Transactional, 0.7, 0.6, marketing);
        }

        if self.is_automated_sender(email) {
            return self.content_classification(EmailType::Automated, 0.7, 0.7, marketing);
        }

        if self.is_conversational(email) {
            return self.content_classification(EmailType::Personal, 0.6, 1.0, marketing);
        }

        self.content_classification(EmailType::Unknown, 0.0, 1.0, marketing)
    }

    fn content_classification(
        &self,
        email_type: EmailType,
        confidence: f32,
        modifier: f32,
        marketing: MarketingSignals,
    ) -> EmailClassification {
        EmailClassification {
            email_type,
            confidence,
            threat_score_modifier: modifier,
            skip_bec_detection: matches!(
                email_type,
                EmailType::Marketing | EmailType::Transactional
            ),
            skip_gift_card_detection: email_type == EmailType::Marketing,
            marketing_signals: marketing,
            sender: None,
        }
    }

    fn is_automated_sender(&self, email: &ParsedEmail) -> bool {
        if self.automated_subject.is_match(&email.subject) {
            return true;
        }
        let local = email.from.local_part().to_ascii_lowercase();
        AUTOMATED_LOCAL_PARTS.iter().any(|p| local == *p)
            || email.has_header("auto-submitted")
    }

    fn is_conversational(&self, email: &ParsedEmail) -> bool {
        let body = email.body.combined();
        let has_unsubscribe = body.to_ascii_lowercase().contains("unsubscribe");
        if has_unsubscribe {
            return false;
        }
        self.conversational_subject.is_match(&email.subject)
            || self.greeting.is_match(body.trim_start())
    }
}
