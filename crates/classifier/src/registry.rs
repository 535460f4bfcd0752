//! Sender registry
//!
//! Static domain-to-category mapping consulted before any content
//! inspection. Lookup order: exact domain, exact subdomain, parent-domain
//! walk (dropping labels from the left), then auto-recognition of
//! government and education suffixes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sender category; ordering here mirrors decreasing trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderCategory {
    Trusted,
    Retail,
    Ecommerce,
    Marketing,
    Transactional,
    Financial,
    Saas,
    Automated,
}

/// One registered sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Canonical (lowercased) domain.
    pub domain: String,
    pub name: String,
    pub category: SenderCategory,
    /// Additional sending subdomains, matched exactly.
    pub subdomains: Vec<String>,
    /// From-addresses used besides `*@domain`.
    pub alternate_addresses: Vec<String>,
    /// Reply-to domains considered legitimate for this sender.
    pub reply_to_domains: Vec<String>,
}

impl SenderInfo {
    pub fn new(domain: &str, name: &str, category: SenderCategory) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            name: name.to_string(),
            category,
            subdomains: Vec::new(),
            alternate_addresses: Vec::new(),
            reply_to_domains: Vec::new(),
        }
    }

    pub fn with_subdomains(mut self, subdomains: &[&str]) -> Self {
        self.subdomains = subdomains.iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_reply_to(mut self, domains: &[&str]) -> Self {
        self.reply_to_domains = domains.iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }
}

/// Suffixes auto-classified as transactional senders.
const AUTO_TRANSACTIONAL_SUFFIXES: &[&str] = &[".gov", ".gov.uk", ".gc.ca", ".edu", ".ac.uk"];

/// Case-insensitive domain-to-sender index, immutable after construction.
#[derive(Debug, Default)]
pub struct SenderRegistry {
    by_domain: HashMap<String, Arc<SenderInfo>>,
    by_subdomain: HashMap<String, Arc<SenderInfo>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with well-known senders.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for info in builtin_senders() {
            registry.register(info);
        }
        registry
    }

    pub fn register(&mut self, info: SenderInfo) {
        let info = Arc::new(info);
        for subdomain in &info.subdomains {
            self.by_subdomain.insert(subdomain.clone(), Arc::clone(&info));
        }
        self.by_domain.insert(info.domain.clone(), info);
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Resolves a sender by address and domain.
    pub fn lookup_sender(&self, _address: &str, domain: &str) -> Option<Arc<SenderInfo>> {
        let domain = domain.to_ascii_lowercase();

        if let Some(info) = self.by_domain.get(&domain) {
            return Some(Arc::clone(info));
        }
        if let Some(info) = self.by_subdomain.get(&domain) {
            return Some(Arc::clone(info));
        }

        // Walk up: drop labels from the left until two remain.
        let mut labels: Vec<&str> = domain.split('.').collect();
        while labels.len() > 2 {
            labels.remove(0);
            let parent = labels.join(".");
            if let Some(info) = self.by_domain.get(&parent) {
                return Some(Arc::clone(info));
            }
        }

        for suffix in AUTO_TRANSACTIONAL_SUFFIXES {
            if domain.ends_with(suffix) {
                return Some(Arc::new(SenderInfo::new(
                    &domain,
                    "Auto-recognized institution",
                    SenderCategory::Transactional,
                )));
            }
        }

        None
    }
}

fn builtin_senders() -> Vec<SenderInfo> {
    use SenderCategory::*;
    vec![
        SenderInfo::new("amazon.com", "Amazon", Retail)
            .with_subdomains(&["email.amazon.com", "marketing.amazon.com", "order-update.amazon.com"]),
        SenderInfo::new("walmart.com", "Walmart", Retail)
            .with_subdomains(&["email.walmart.com"]),
        SenderInfo::new("target.com", "Target", Retail)
            .with_subdomains(&["e.target.com"]),
        SenderInfo::new("bestbuy.com", "Best Buy", Retail)
            .with_subdomains(&["emailinfo.bestbuy.com"]),
        SenderInfo::new("ebay.com", "eBay", Ecommerce)
            .with_subdomains(&["reply.ebay.com", "ebay.co.uk"]),
        SenderInfo::new("shopify.com", "Shopify", Ecommerce)
            .with_subdomains(&["shopifyemail.com"]),
        SenderInfo::new("etsy.com", "Etsy", Ecommerce),
        SenderInfo::new("mailchimp.com", "Mailchimp", Marketing)
            .with_subdomains(&["mail.mailchimp.com"]),
        SenderInfo::new("sendgrid.net", "SendGrid", Marketing),
        SenderInfo::new("constantcontact.com", "Constant Contact", Marketing),
        SenderInfo::new("hubspot.com", "HubSpot", Marketing),
        SenderInfo::new("linkedin.com", "LinkedIn", Marketing)
            .with_subdomains(&["e.linkedin.com"]),
        SenderInfo::new("facebookmail.com", "Facebook", Marketing),
        SenderInfo::new("paypal.com", "PayPal", Financial)
            .with_subdomains(&["e.paypal.com"])
            .with_reply_to(&["paypal.com"]),
        SenderInfo::new("chase.com", "Chase", Financial)
            .with_subdomains(&["alerts.chase.com"]),
        SenderInfo::new("bankofamerica.com", "Bank of America", Financial),
        SenderInfo::new("wellsfargo.com", "Wells Fargo", Financial),
        SenderInfo::new("stripe.com", "Stripe", Financial),
        SenderInfo::new("intuit.com", "Intuit", Financial),
        SenderInfo::new("usps.com", "USPS", Transactional),
        SenderInfo::new("fedex.com", "FedEx", Transactional),
        SenderInfo::new("ups.com", "UPS", Transactional),
        SenderInfo::new("dhl.com", "DHL", Transactional),
        SenderInfo::new("docusign.net", "DocuSign", Transactional)
            .with_subdomains(&["docusign.com"]),
        SenderInfo::new("google.com", "Google", Saas)
            .with_subdomains(&["accounts.google.com", "googlemail.com"]),
        SenderInfo::new("microsoft.com", "Microsoft", Saas)
            .with_subdomains(&["email.microsoft.com", "microsoftonline.com"]),
        SenderInfo::new("github.com", "GitHub", Saas),
        SenderInfo::new("atlassian.com", "Atlassian", Saas)
            .with_subdomains(&["am.atlassian.com"]),
        SenderInfo::new("salesforce.com", "Salesforce", Saas),
        SenderInfo::new("slack.com", "Slack", Saas),
        SenderInfo::new("zoom.us", "Zoom", Saas),
        SenderInfo::new("dropbox.com", "Dropbox", Saas),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_domain_match() {
        let registry = SenderRegistry::with_builtin();
        let info = registry.lookup_sender("deals@amazon.com", "amazon.com").unwrap();
        assert_eq!(info.category, SenderCategory::Retail);
        assert_eq!(info.name, "Amazon");
    }

    #[test]
    fn subdomain_match() {
        let registry = SenderRegistry::with_builtin();
        let info = registry
            .lookup_sender("store-news@email.amazon.com", "email.amazon.com")
            .unwrap();
        assert_eq!(info.domain, "amazon.com");
        assert_eq!(info.category, SenderCategory::Retail);
    }

    #[test]
    fn parent_domain_walk() {
        let registry = SenderRegistry::with_builtin();
        // Not a registered subdomain, but parent amazon.com is known.
        let info = registry
            .lookup_sender("x@deep.mailer.amazon.com", "deep.mailer.amazon.com")
            .unwrap();
        assert_eq!(info.domain, "amazon.com");
    }

    #[test]
    fn gov_and_edu_auto_classification() {
        let registry = SenderRegistry::new();
        for domain in ["irs.gov", "hmrc.gov.uk", "cra-arc.gc.ca", "mit.edu", "ox.ac.uk"] {
            let info = registry.lookup_sender("noreply@x", domain).unwrap();
            assert_eq!(info.category, SenderCategory::Transactional, "{domain}");
        }
    }

    #[test]
    fn unknown_domain_misses() {
        let registry = SenderRegistry::with_builtin();
        assert!(registry.lookup_sender("a@nowhere.test", "nowhere.test").is_none());
        // Lookalike domains must not match.
        assert!(registry
            .lookup_sender("a@amazon-payments.test", "amazon-payments.test")
            .is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = SenderRegistry::with_builtin();
        assert!(registry.lookup_sender("a@PayPal.com", "PayPal.COM").is_some());
    }
}
