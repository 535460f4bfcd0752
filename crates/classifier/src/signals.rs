//! Marketing-signal detection
//!
//! Inspects body and headers for bulk-mail fingerprints: unsubscribe
//! affordances, tracking pixels, campaign headers, promotional language and
//! the legal footer that CAN-SPAM compliant senders carry.

use common::ParsedEmail;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Individual marketing signals, reported for explainability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketingSignal {
    ListUnsubscribeHeader,
    UnsubscribeLink,
    ViewInBrowser,
    TrackingPixel,
    SocialMediaLinks,
    PromotionalLanguage,
    TinyPixelDimensions,
    BulkMailHeaders,
    LegalFooter,
}

/// Detection outcome; confidence grows with the number of distinct signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketingSignals {
    pub signals: Vec<MarketingSignal>,
    pub confidence: f32,
}

impl MarketingSignals {
    pub fn count(&self) -> usize {
        self.signals.len()
    }
}

/// Bulk-mail header names observed across major ESPs.
const BULK_MAIL_HEADERS: &[&str] = &[
    "feedback-id",
    "x-feedback-id",
    "x-campaign",
    "x-campaign-id",
    "x-campaignid",
    "x-mailgun-tag",
    "x-sg-eid",
    "x-mc-user",
    "x-mandrill-user",
    "x-marketo-id",
    "list-id",
];

/// Compiled signal patterns; build once and share.
pub struct SignalDetector {
    unsubscribe_link: Regex,
    view_in_browser: Regex,
    tracking_pixel: Regex,
    social_media: Regex,
    promotional: Regex,
    tiny_pixel: Regex,
    copyright: Regex,
    legal_links: Regex,
}

impl SignalDetector {
    pub fn new() -> Self {
        Self {
            unsubscribe_link: Regex::new(r"(?i)unsubscribe").unwrap(),
            view_in_browser: Regex::new(r"(?i)view (this (email|message) )?in (your )?browser")
                .unwrap(),
            tracking_pixel: Regex::new(
                r#"(?i)<img[^>]*(open\.gif|track(ing)?[^>]*\.(gif|png)|pixel\.(gif|png))"#,
            )
            .unwrap(),
            social_media: Regex::new(
                r"(?i)(facebook|instagram|twitter|linkedin|youtube|tiktok|pinterest)\.com/",
            )
            .unwrap(),
            promotional: Regex::new(
                r"(?i)(\d{1,3}\s*%\s*off|discount|flash sale|sale ends|limited[- ]time|special offer|promo code|coupon|free shipping|clearance|deal of the)",
            )
            .unwrap(),
            tiny_pixel: Regex::new(
                r#"(?i)(width|height)\s*=\s*["']?1["']?[^>]*(width|height)\s*=\s*["']?1["']?"#,
            )
            .unwrap(),
            copyright: Regex::new(r"(?i)(©|&copy;|\(c\))\s*(19|20)\d{2}").unwrap(),
            legal_links: Regex::new(r"(?i)(privacy|terms|contact)").unwrap(),
        }
    }

    /// Scans one message and reports every distinct signal found.
    pub fn detect(&self, email: &ParsedEmail) -> MarketingSignals {
        let body = email.body.combined();
        let mut signals = Vec::new();

        if email.has_header("list-unsubscribe") {
            signals.push(MarketingSignal::ListUnsubscribeHeader);
        }
        if self.unsubscribe_link.is_match(&body) {
            signals.push(MarketingSignal::UnsubscribeLink);
        }
        if self.view_in_browser.is_match(&body) {
            signals.push(MarketingSignal::ViewInBrowser);
        }
        if self.tracking_pixel.is_match(&body) {
            signals.push(MarketingSignal::TrackingPixel);
        }
        if self.social_media.is_match(&body) {
            signals.push(MarketingSignal::SocialMediaLinks);
        }
        if self.promotional.is_match(&body) || self.promotional.is_match(&email.subject) {
            signals.push(MarketingSignal::PromotionalLanguage);
        }
        if self.tiny_pixel.is_match(&body) {
            signals.push(MarketingSignal::TinyPixelDimensions);
        }
        if BULK_MAIL_HEADERS.iter().any(|name| email.has_header(name)) {
            signals.push(MarketingSignal::BulkMailHeaders);
        }
        if self.copyright.is_match(&body) && self.legal_links.is_match(&body) {
            signals.push(MarketingSignal::LegalFooter);
        }

        let confidence = confidence_for(signals.len());
        MarketingSignals {
            signals,
            confidence,
        }
    }
}

impl Default for SignalDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn confidence_for(count: usize) -> f32 {
    match count {
        0 => 0.0,
        1 => 0.3,
        2 => 0.5,
        3 => 0.7,
        4 => 0.85,
        _ => 0.95,
    }
}
