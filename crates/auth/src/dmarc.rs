/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! DMARC evaluation (RFC 7489)
//!
//! Resolves the policy record at `_dmarc.<domain>` (falling back to the
//! organizational domain), computes SPF and DKIM alignment against the
//! RFC 5322.From domain, and derives the applied policy: `sp` for strict
//! subdomains when present, otherwise `p`.

use std::sync::Arc;

use dns::{DnsError, DnsResolver};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dkim::DkimVerification;
use crate::spf::SpfResult;

/// Two-label public suffixes the organizational-domain stub knows about.
/// A full public-suffix list can replace this without changing callers.
const TWO_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "net.uk", "sch.uk", "com.au", "net.au",
    "org.au", "edu.au", "gov.au", "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "co.nz", "net.nz",
    "org.nz", "com.br", "net.br", "org.br", "com.mx", "com.ar", "com.cn", "net.cn", "org.cn",
    "com.tw", "co.kr", "or.kr", "co.in", "net.in", "org.in", "co.za", "org.za", "com.sg",
    "com.hk", "com.my", "co.id", "com.tr", "gc.ca",
];

/// Requested disposition from `p=`/`sp=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

impl DmarcPolicy {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "none" => Some(DmarcPolicy::None),
            "quarantine" => Some(DmarcPolicy::Quarantine),
            "reject" => Some(DmarcPolicy::Reject),
            _ => None,
        }
    }
}

impl std::fmt::Display for DmarcPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DmarcPolicy::None => "none",
            DmarcPolicy::Quarantine => "quarantine",
            DmarcPolicy::Reject => "reject",
        })
    }
}

/// `adkim=`/`aspf=` alignment modes; relaxed is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlignmentMode {
    Strict,
    #[default]
    Relaxed,
}

/// Parsed `v=DMARC1` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmarcRecord {
    pub policy: DmarcPolicy,
    pub subdomain_policy: Option<DmarcPolicy>,
    /// Sampling percentage; observational only, never downgrades the
    /// applied policy here.
    pub pct: u8,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    pub rua: Vec<String>,
    pub ruf: Vec<String>,
    pub report_interval: Option<u32>,
    pub failure_options: Option<String>,
}

/// Evaluation results reported with RFC strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    TempError,
    PermError,
}

impl std::fmt::Display for DmarcResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DmarcResult::Pass => "pass",
            DmarcResult::Fail => "fail",
            DmarcResult::None => "none",
            DmarcResult::TempError => "temperror",
            DmarcResult::PermError => "permerror",
        })
    }
}

/// Inputs to one evaluation: the RFC 5322.From domain, the SPF envelope
/// domain and result, and the per-signature DKIM outcomes.
#[derive(Debug, Clone)]
pub struct DmarcInput<'a> {
    pub header_from_domain: &'a str,
    pub mail_from_domain: &'a str,
    pub spf_result: SpfResult,
    pub dkim_results: &'a [DkimVerification],
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmarcEvaluation {
    pub result: DmarcResult,
    pub record: Option<DmarcRecord>,
    /// Policy to enforce for this message.
    pub applied_policy: Option<DmarcPolicy>,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    /// Domain the record was found at (may be the organizational domain).
    pub record_domain: Option<String>,
}

enum RecordLookup {
    Found(String, DmarcRecord),
    NotFound,
    TempError,
    PermError,
}

/// DMARC policy resolver and alignment evaluator.
pub struct DmarcEvaluator {
    resolver: Arc<dyn DnsResolver>,
}

impl DmarcEvaluator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Fetches the DMARC record for `domain`, falling back to its
    /// organizational domain.
    pub async fn get_record(&self, domain: &str) -> Result<Option<DmarcRecord>, DmarcResult> {
        match self.lookup_chain(domain).await {
            RecordLookup::Found(_, record) => Ok(Some(record)),
            RecordLookup::NotFound => Ok(None),
            RecordLookup::TempError => Err(DmarcResult::TempError),
            RecordLookup::PermError => Err(DmarcResult::PermError),
        }
    }

    /// Evaluates alignment and derives the applied policy.
    pub async fn evaluate(&self, input: DmarcInput<'_>) -> DmarcEvaluation {
        let header_from = input.header_from_domain.to_ascii_lowercase();

        let (record_domain, record) = match self.lookup_chain(&header_from).await {
            RecordLookup::Found(domain, record) => (domain, record),
            RecordLookup::NotFound => {
                return DmarcEvaluation {
                    result: DmarcResult::None,
                    record: None,
                    applied_policy: None,
                    spf_aligned: false,
                    dkim_aligned: false,
                    record_domain: None,
                }
            }
            RecordLookup::TempError => return Self::error_evaluation(DmarcResult::TempError),
            RecordLookup::PermError => return Self::error_evaluation(DmarcResult::PermError),
        };

        let spf_aligned = input.spf_result == SpfResult::Pass
            && domains_aligned(&header_from, input.mail_from_domain, record.aspf);
        let dkim_aligned = input.dkim_results.iter().any(|v| {
            v.result.is_pass() && domains_aligned(&header_from, &v.domain, record.adkim)
        });

        let result = if spf_aligned || dkim_aligned {
            DmarcResult::Pass
        } else {
            DmarcResult::Fail
        };

        // sp= applies only to strict subdomains of the organizational domain.
        let org = organizational_domain(&header_from);
        let applied_policy = if header_from != org {
            record.subdomain_policy.unwrap_or(record.policy)
        } else {
            record.policy
        };

        debug!(
            header_from,
            record_domain,
            %result,
            policy = %applied_policy,
            spf_aligned,
            dkim_aligned,
            "DMARC evaluation finished"
        );

        DmarcEvaluation {
            result,
            record: Some(record),
            applied_policy: Some(applied_policy),
            spf_aligned,
            dkim_aligned,
            record_domain: Some(record_domain),
        }
    }

    fn error_evaluation(result: DmarcResult) -> DmarcEvaluation {
        DmarcEvaluation {
            result,
            record: None,
            applied_policy: None,
            spf_aligned: false,
            dkim_aligned: false,
            record_domain: None,
        }
    }

    async fn lookup_chain(&self, domain: &str) -> RecordLookup {
        match self.lookup_at(domain).await {
            RecordLookup::NotFound => {
                let org = organizational_domain(domain);
                if org != domain {
                    self.lookup_at(&org).await
                } else {
                    RecordLookup::NotFound
                }
            }
            outcome => outcome,
        }
    }

    async fn lookup_at(&self, domain: &str) -> RecordLookup {
        let name = format!("_dmarc.{domain}");
        let records = match self.resolver.resolve_txt(&name).await {
            Ok(records) => records,
            Err(DnsError::Temporary { .. }) => return RecordLookup::TempError,
            Err(_) => return RecordLookup::PermError,
        };

        let versioned: Vec<&String> = records.iter().filter(|r| looks_versioned(r)).collect();
        if versioned.is_empty() {
            return RecordLookup::NotFound;
        }

        match versioned.iter().find(|r| is_dmarc1(r)) {
            Some(record) => match parse_record(record) {
                Some(parsed) => RecordLookup::Found(domain.to_string(), parsed),
                None => RecordLookup::PermError,
            },
            // A v=-tagged record at _dmarc that is not DMARC1 is malformed.
            None => RecordLookup::PermError,
        }
    }
}

fn looks_versioned(record: &str) -> bool {
    record.trim_start().to_ascii_lowercase().starts_with("v=")
}

fn is_dmarc1(record: &str) -> bool {
    let trimmed = record.trim_start();
    let Some(rest) = trimmed.get(..8) else {
        return false;
    };
    rest.eq_ignore_ascii_case("v=DMARC1")
}

fn parse_record(record: &str) -> Option<DmarcRecord> {
    let mut policy = None;
    let mut subdomain_policy = None;
    let mut pct = 100u8;
    let mut adkim = AlignmentMode::Relaxed;
    let mut aspf = AlignmentMode::Relaxed;
    let mut rua = Vec::new();
    let mut ruf = Vec::new();
    let mut report_interval = None;
    let mut failure_options = None;

    for tag in record.split(';') {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let (name, value) = tag.split_once('=')?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "v" => {
                if !value.eq_ignore_ascii_case("DMARC1") {
                    return None;
                }
            }
            "p" => policy = Some(DmarcPolicy::parse(value)?),
            "sp" => subdomain_policy = Some(DmarcPolicy::parse(value)?),
            "pct" => {
                let parsed: u8 = value.parse().ok()?;
                if parsed > 100 {
                    return None;
                }
                pct = parsed;
            }
            "adkim" => adkim = parse_alignment(value)?,
            "aspf" => aspf = parse_alignment(value)?,
            "rua" => rua = value.split(',').map(|s| s.trim().to_string()).collect(),
            "ruf" => ruf = value.split(',').map(|s| s.trim().to_string()).collect(),
            "ri" => report_interval = value.parse().ok(),
            "fo" => failure_options = Some(value.to_string()),
            _ => {}
        }
    }

    Some(DmarcRecord {
        // p= is required.
        policy: policy?,
        subdomain_policy,
        pct,
        adkim,
        aspf,
        rua,
        ruf,
        report_interval,
        failure_options,
    })
}

fn parse_alignment(value: &str) -> Option<AlignmentMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "s" => Some(AlignmentMode::Strict),
        "r" => Some(AlignmentMode::Relaxed),
        _ => None,
    }
}

fn domains_aligned(header_from: &str, other: &str, mode: AlignmentMode) -> bool {
    let header_from = header_from.to_ascii_lowercase();
    let other = other.to_ascii_lowercase();
    if other.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => header_from == other,
        AlignmentMode::Relaxed => {
            organizational_domain(&header_from) == organizational_domain(&other)
        }
    }
}

/// Registrable domain under the public suffix, using the two-label stub
/// list above.
pub fn organizational_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if TWO_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len() - keep.min(labels.len())..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::DkimResult;
    use dns::MockResolver;

    fn dkim_pass(domain: &str) -> DkimVerification {
        DkimVerification {
            result: DkimResult::Pass,
            domain: domain.to_string(),
            selector: "sel".to_string(),
            signature: None,
            error: None,
        }
    }

    fn dkim_fail(domain: &str) -> DkimVerification {
        DkimVerification {
            result: DkimResult::Fail,
            domain: domain.to_string(),
            selector: "sel".to_string(),
            signature: None,
            error: Some("signature verification failed".to_string()),
        }
    }

    #[test]
    fn organizational_domain_stub() {
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("a.b.example.co.uk"), "example.co.uk");
        assert_eq!(organizational_domain("example.co.uk"), "example.co.uk");
        assert_eq!(organizational_domain("deep.sub.mail.example.com.au"), "example.com.au");
    }

    #[tokio::test]
    async fn aligned_spf_passes() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC1; p=reject"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "bounce.example.com",
                spf_result: SpfResult::Pass,
                dkim_results: &[],
            })
            .await;

        assert_eq!(eval.result, DmarcResult::Pass);
        assert!(eval.spf_aligned);
        assert!(!eval.dkim_aligned);
        assert_eq!(eval.applied_policy, Some(DmarcPolicy::Reject));
    }

    #[tokio::test]
    async fn strict_spf_alignment_requires_exact_match() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC1; p=reject; aspf=s"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "bounce.example.com",
                spf_result: SpfResult::Pass,
                dkim_results: &[],
            })
            .await;

        assert!(!eval.spf_aligned);
        assert_eq!(eval.result, DmarcResult::Fail);
    }

    #[tokio::test]
    async fn dkim_alignment_passes_independently() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC1; p=quarantine"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "elsewhere.test",
                spf_result: SpfResult::Fail,
                dkim_results: &[dkim_fail("elsewhere.test"), dkim_pass("mail.example.com")],
            })
            .await;

        assert!(eval.dkim_aligned);
        assert_eq!(eval.result, DmarcResult::Pass);
    }

    #[tokio::test]
    async fn subdomain_policy_applies_to_strict_subdomain() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC1; p=none; sp=reject"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "mail.example.com",
                mail_from_domain: "other.test",
                spf_result: SpfResult::Fail,
                dkim_results: &[dkim_fail("other.test")],
            })
            .await;

        assert_eq!(eval.result, DmarcResult::Fail);
        assert_eq!(eval.applied_policy, Some(DmarcPolicy::Reject));
        // Record was found at the organizational domain.
        assert_eq!(eval.record_domain.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn org_domain_policy_applies_p_at_org() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC1; p=none; sp=reject"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "other.test",
                spf_result: SpfResult::Fail,
                dkim_results: &[],
            })
            .await;

        assert_eq!(eval.applied_policy, Some(DmarcPolicy::None));
    }

    #[tokio::test]
    async fn missing_record_yields_none() {
        let mock = Arc::new(MockResolver::new());
        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "example.com",
                spf_result: SpfResult::Pass,
                dkim_results: &[],
            })
            .await;

        assert_eq!(eval.result, DmarcResult::None);
        assert!(eval.applied_policy.is_none());
    }

    #[tokio::test]
    async fn wrong_version_is_permerror() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("_dmarc.example.com", &["v=DMARC2; p=reject"]);

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "example.com",
                spf_result: SpfResult::Pass,
                dkim_results: &[],
            })
            .await;
        assert_eq!(eval.result, DmarcResult::PermError);
    }

    #[tokio::test]
    async fn transient_dns_failure_is_temperror() {
        let mock = Arc::new(MockResolver::new());
        mock.fail_domain("_dmarc.example.com", "SERVFAIL");

        let evaluator = DmarcEvaluator::new(mock);
        let eval = evaluator
            .evaluate(DmarcInput {
                header_from_domain: "example.com",
                mail_from_domain: "example.com",
                spf_result: SpfResult::Pass,
                dkim_results: &[],
            })
            .await;
        assert_eq!(eval.result, DmarcResult::TempError);
    }

    #[test]
    fn record_parse_defaults() {
        let record = parse_record("v=DMARC1; p=quarantine").unwrap();
        assert_eq!(record.pct, 100);
        assert_eq!(record.adkim, AlignmentMode::Relaxed);
        assert_eq!(record.aspf, AlignmentMode::Relaxed);
        assert!(record.subdomain_policy.is_none());

        assert!(parse_record("v=DMARC1").is_none());
        assert!(parse_record("v=DMARC1; p=blocked").is_none());
        assert!(parse_record("v=DMARC1; p=none; pct=150").is_none());
    }

    #[test]
    fn record_parse_full() {
        let record = parse_record(
            "v=DMARC1; p=reject; sp=quarantine; pct=30; adkim=s; aspf=s; \
             rua=mailto:agg@example.com,mailto:agg2@example.com; ri=86400; fo=1",
        )
        .unwrap();
        assert_eq!(record.policy, DmarcPolicy::Reject);
        assert_eq!(record.subdomain_policy, Some(DmarcPolicy::Quarantine));
        assert_eq!(record.pct, 30);
        assert_eq!(record.adkim, AlignmentMode::Strict);
        assert_eq!(record.rua.len(), 2);
        assert_eq!(record.report_interval, Some(86400));
        assert_eq!(record.failure_options.as_deref(), Some("1"));
    }
}
