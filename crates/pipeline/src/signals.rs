/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Threat signal analysis
//!
//! Declarative regex tables over subject, body, links and attachments,
//! combined with the authentication outcome. The classification gates the
//! detectors that only make sense for unsolicited mail: BEC and gift-card
//! detection are skipped for marketing and transactional traffic.

use auth::{DkimResult, DmarcPolicy, DmarcResult, SpfResult};
use classifier::EmailClassification;
use common::ParsedEmail;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::verdict::AuthenticationSummary;

/// One contributing signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatSignal {
    pub name: String,
    pub score: f32,
    pub detail: Option<String>,
}

impl ThreatSignal {
    fn new(name: &str, score: f32) -> Self {
        Self {
            name: name.to_string(),
            score,
            detail: None,
        }
    }

    fn with_detail(name: &str, score: f32, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            score,
            detail: Some(detail.into()),
        }
    }
}

/// Attachment extensions that are executable on arrival.
const EXECUTABLE_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".bat", ".cmd", ".com", ".pif", ".js", ".vbs", ".jar", ".hta",
];

/// Office formats that can carry macros.
const MACRO_EXTENSIONS: &[&str] = &[".docm", ".xlsm", ".pptm", ".dotm"];

/// Compiled detector tables.
pub struct ThreatAnalyzer {
    urgency: Regex,
    credential_bait: Regex,
    bec_language: Regex,
    gift_card: Regex,
    suspicious_tld_link: Regex,
    plain_http_login: Regex,
}

impl ThreatAnalyzer {
    pub fn new() -> Self {
        Self {
            urgency: Regex::new(
                r"(?i)(urgent|immediate(ly)? (action|attention)|action required|within 24 hours|account (will be )?(suspended|closed|locked)|final (notice|warning))",
            )
            .unwrap(),
            credential_bait: Regex::new(
                r"(?i)(verify your (account|identity|password)|confirm your (account|identity|password)|password (has )?expired|unusual (sign[- ]?in|activity)|re[- ]?activate your account|click (here|below) to (verify|confirm|restore))",
            )
            .unwrap(),
            bec_language: Regex::new(
                r"(?i)(wire transfer|bank details? (have )?changed|updated? (our )?(bank|payment) (details|information)|are you (at your desk|available)\??|need (a|your) (quick )?favou?r|process (the|a) payment (today|urgently)|keep this (confidential|between us)|w-?2 forms?)",
            )
            .unwrap(),
            gift_card: Regex::new(
                r"(?i)(gift ?cards?|itunes cards?|google play cards?|amazon cards?|steam cards?|scratch (off )?the (back|code)|send (me )?the (card )?codes?)",
            )
            .unwrap(),
            suspicious_tld_link: Regex::new(r"(?i)https?://[a-z0-9.-]+\.(tk|ml|ga|cf|gq|top|zip)(/|\b)")
                .unwrap(),
            plain_http_login: Regex::new(r#"(?i)http://[^\s"'<>]*(login|signin|account|verify)"#)
                .unwrap(),
        }
    }

    /// Scores one message. Returns the contributing signals; the caller
    /// sums and modulates them.
    pub fn analyze(
        &self,
        email: &ParsedEmail,
        classification: &EmailClassification,
        auth: &AuthenticationSummary,
    ) -> Vec<ThreatSignal> {
        let mut signals = Vec::new();
        let text = format!("{}\n{}", email.subject, email.body.combined());

        if self.urgency.is_match(&text) {
            signals.push(ThreatSignal::new("urgency-language", 15.0));
        }
        if self.credential_bait.is_match(&text) {
            signals.push(ThreatSignal::new("credential-bait", 20.0));
        }
        if !classification.skip_bec_detection && self.bec_language.is_match(&text) {
            signals.push(ThreatSignal::new("bec-language", 25.0));
        }
        if !classification.skip_gift_card_detection && self.gift_card.is_match(&text) {
            signals.push(ThreatSignal::new("gift-card-lure", 25.0));
        }
        if let Some(link) = self.suspicious_tld_link.find(&text) {
            signals.push(ThreatSignal::with_detail(
                "suspicious-link",
                15.0,
                link.as_str(),
            ));
        }
        if self.plain_http_login.is_match(&text) {
            signals.push(ThreatSignal::new("plain-http-login-link", 10.0));
        }

        for attachment in &email.attachments {
            let name = attachment.filename.to_ascii_lowercase();
            if EXECUTABLE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
                signals.push(ThreatSignal::with_detail(
                    "executable-attachment",
                    20.0,
                    attachment.filename.clone(),
                ));
            } else if MACRO_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
                signals.push(ThreatSignal::with_detail(
                    "macro-attachment",
                    10.0,
                    attachment.filename.clone(),
                ));
            }
        }

        signals.extend(self.auth_signals(auth));
        signals
    }

    fn auth_signals(&self, auth: &AuthenticationSummary) -> Vec<ThreatSignal> {
        let mut signals = Vec::new();

        match auth.spf.result {
            SpfResult::Fail => signals.push(ThreatSignal::new("spf-fail", 15.0)),
            SpfResult::SoftFail => signals.push(ThreatSignal::new("spf-softfail", 5.0)),
            _ => {}
        }

        if auth.dmarc.result == DmarcResult::Fail {
            let score = match auth.dmarc.applied_policy {
                Some(DmarcPolicy::Reject) | Some(DmarcPolicy::Quarantine) => 25.0,
                _ => 15.0,
            };
            signals.push(ThreatSignal::new("dmarc-fail", score));
        }

        // Broken signatures on a signed message suggest tampering.
        if !auth.dkim.is_empty() && auth.dkim.iter().all(|d| d.result == DkimResult::Fail) {
            signals.push(ThreatSignal::new("dkim-all-fail", 10.0));
        }

        signals
    }
}

impl Default for ThreatAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
