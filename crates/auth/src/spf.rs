/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! SPF evaluation (RFC 7208)
//!
//! Parses `v=spf1` policies and checks a sender IP against them. DNS-bearing
//! mechanisms (`a`, `mx`, `include`, `exists`, `redirect=` and every resolved
//! MX exchange) are charged against the 10-lookup budget; exceeding it yields
//! `permerror`. The initial TXT fetch on the policy domain is free.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use dns::{DnsError, DnsResolver};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Maximum number of DNS-bearing terms per evaluation.
const MAX_DNS_LOOKUPS: u32 = 10;

/// RFC 7208 evaluation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfResult {
    pub fn is_pass(self) -> bool {
        matches!(self, SpfResult::Pass)
    }
}

impl std::fmt::Display for SpfResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        })
    }
}

/// Mechanism qualifier: `+`, `-`, `~`, `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpfQualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl SpfQualifier {
    fn result(self) -> SpfResult {
        match self {
            SpfQualifier::Pass => SpfResult::Pass,
            SpfQualifier::Fail => SpfResult::Fail,
            SpfQualifier::SoftFail => SpfResult::SoftFail,
            SpfQualifier::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpfMechanismKind {
    All,
    Ip4,
    Ip6,
    A,
    Mx,
    Ptr,
    Exists,
    Include,
}

/// One parsed mechanism; order within the record is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpfMechanism {
    pub kind: SpfMechanismKind,
    pub qualifier: SpfQualifier,
    pub value: Option<String>,
    pub cidr: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpfRecord {
    mechanisms: Vec<SpfMechanism>,
    redirect: Option<String>,
}

/// Outcome of one `validate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpfEvaluation {
    pub result: SpfResult,
    /// The mechanism that determined the result, when one matched.
    pub mechanism: Option<SpfMechanism>,
    /// DNS-bearing terms charged against the budget.
    pub lookup_count: u32,
}

impl SpfEvaluation {
    fn terminal(result: SpfResult, lookup_count: u32) -> Self {
        Self {
            result,
            mechanism: None,
            lookup_count,
        }
    }
}

struct LookupBudget {
    used: u32,
}

impl LookupBudget {
    fn new() -> Self {
        Self { used: 0 }
    }

    /// Charges one lookup; `false` once the budget is exceeded.
    fn charge(&mut self) -> bool {
        self.used += 1;
        self.used <= MAX_DNS_LOOKUPS
    }
}

enum EvalError {
    Temp,
    Perm,
}

/// SPF policy evaluator over a resolver backend.
pub struct SpfVerifier {
    resolver: Arc<dyn DnsResolver>,
}

impl SpfVerifier {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Checks whether `sender_ip` is authorized to send for `domain`.
    ///
    /// `sender` is the MAIL FROM address; it is carried for parity with the
    /// RFC interface (macro expansion is not supported).
    pub async fn validate(&self, sender_ip: IpAddr, sender: &str, domain: &str) -> SpfEvaluation {
        let _ = sender;
        let mut budget = LookupBudget::new();
        let outcome = self.check_host(sender_ip, domain, &mut budget).await;
        let evaluation = match outcome {
            Ok((result, mechanism)) => SpfEvaluation {
                result,
                mechanism,
                lookup_count: budget.used,
            },
            Err(EvalError::Temp) => SpfEvaluation::terminal(SpfResult::TempError, budget.used),
            Err(EvalError::Perm) => SpfEvaluation::terminal(SpfResult::PermError, budget.used),
        };
        debug!(
            domain,
            ip = %sender_ip,
            result = %evaluation.result,
            lookups = evaluation.lookup_count,
            "SPF evaluation finished"
        );
        evaluation
    }

    fn check_host<'a>(
        &'a self,
        ip: IpAddr,
        domain: &'a str,
        budget: &'a mut LookupBudget,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<(SpfResult, Option<SpfMechanism>), EvalError>,
                > + Send
                + 'a,
        >,
    > {
        // Recursion through include/redirect requires boxing the future.
        Box::pin(async move {
            let records = match self.resolver.resolve_txt(domain).await {
                Ok(records) => records,
                Err(DnsError::Temporary { .. }) => return Err(EvalError::Temp),
                Err(_) => return Err(EvalError::Perm),
            };

            let spf_records: Vec<&String> = records
                .iter()
                .filter(|r| is_spf_record(r))
                .collect();

            match spf_records.len() {
                0 => return Ok((SpfResult::None, None)),
                1 => {}
                _ => {
                    debug!(domain, count = spf_records.len(), "multiple SPF records");
                    return Err(EvalError::Perm);
                }
            }

            let record = parse_record(spf_records[0]).ok_or(EvalError::Perm)?;

            for mechanism in &record.mechanisms {
                let matched = self.matches(ip, domain, mechanism, budget).await?;
                if matched {
                    trace!(domain, ?mechanism.kind, "SPF mechanism matched");
                    return Ok((mechanism.qualifier.result(), Some(mechanism.clone())));
                }
            }

            if let Some(target) = &record.redirect {
                if !budget.charge() {
                    return Err(EvalError::Perm);
                }
                let (result, mechanism) = self.check_host(ip, target, budget).await?;
                // A redirect target without an SPF record is a broken policy.
                if result == SpfResult::None {
                    return Err(EvalError::Perm);
                }
                return Ok((result, mechanism));
            }

            Ok((SpfResult::Neutral, None))
        })
    }

    async fn matches(
        &self,
        ip: IpAddr,
        domain: &str,
        mechanism: &SpfMechanism,
        budget: &mut LookupBudget,
    ) -> Result<bool, EvalError> {
        match mechanism.kind {
            SpfMechanismKind::All => Ok(true),
            SpfMechanismKind::Ip4 => {
                let value = mechanism.value.as_deref().ok_or(EvalError::Perm)?;
                let network: Ipv4Addr = value.parse().map_err(|_| EvalError::Perm)?;
                let prefix = mechanism.cidr.unwrap_or(32);
                if prefix > 32 {
                    return Err(EvalError::Perm);
                }
                Ok(as_ipv4(ip).is_some_and(|ip| ipv4_in_network(ip, network, prefix)))
            }
            SpfMechanismKind::Ip6 => {
                let value = mechanism.value.as_deref().ok_or(EvalError::Perm)?;
                let network: Ipv6Addr = value.parse().map_err(|_| EvalError::Perm)?;
                let prefix = mechanism.cidr.unwrap_or(128);
                if prefix > 128 {
                    return Err(EvalError::Perm);
                }
                match ip {
                    IpAddr::V6(ip) if as_ipv4(IpAddr::V6(ip)).is_none() => {
                        Ok(ipv6_in_network(ip, network, prefix))
                    }
                    _ => Ok(false),
                }
            }
            SpfMechanismKind::A => {
                if !budget.charge() {
                    return Err(EvalError::Perm);
                }
                let target = mechanism.value.as_deref().unwrap_or(domain);
                self.host_matches(ip, target, mechanism.cidr).await
            }
            SpfMechanismKind::Mx => {
                if !budget.charge() {
                    return Err(EvalError::Perm);
                }
                let target = mechanism.value.as_deref().unwrap_or(domain);
                let exchanges = self
                    .resolver
                    .resolve_mx(target)
                    .await
                    .map_err(map_dns_err)?;
                for mx in &exchanges {
                    if !budget.charge() {
                        return Err(EvalError::Perm);
                    }
                    if self.host_matches(ip, &mx.exchange, mechanism.cidr).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            SpfMechanismKind::Include => {
                if !budget.charge() {
                    return Err(EvalError::Perm);
                }
                let target = mechanism.value.as_deref().ok_or(EvalError::Perm)?;
                let (result, _) = self.check_host(ip, target, budget).await?;
                match result {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(EvalError::Temp),
                    // RFC 7208 §5.2: an included domain without a policy is
                    // a permanent error in the including record.
                    SpfResult::None | SpfResult::PermError => Err(EvalError::Perm),
                }
            }
            SpfMechanismKind::Exists => {
                if !budget.charge() {
                    return Err(EvalError::Perm);
                }
                let target = mechanism.value.as_deref().ok_or(EvalError::Perm)?;
                let addrs = self.resolver.resolve_a(target).await.map_err(map_dns_err)?;
                Ok(!addrs.is_empty())
            }
            // Deprecated by RFC 7208; never matches.
            SpfMechanismKind::Ptr => Ok(false),
        }
    }

    /// Whether any address of `host` contains `ip` under the optional CIDR.
    async fn host_matches(
        &self,
        ip: IpAddr,
        host: &str,
        cidr: Option<u8>,
    ) -> Result<bool, EvalError> {
        match as_ipv4(ip) {
            Some(ip4) => {
                let prefix = cidr.unwrap_or(32);
                if prefix > 32 {
                    return Err(EvalError::Perm);
                }
                let addrs = self.resolver.resolve_a(host).await.map_err(map_dns_err)?;
                Ok(addrs
                    .iter()
                    .any(|addr| ipv4_in_network(ip4, *addr, prefix)))
            }
            None => {
                let IpAddr::V6(ip6) = ip else {
                    return Ok(false);
                };
                let prefix = cidr.unwrap_or(128);
                if prefix > 128 {
                    return Err(EvalError::Perm);
                }
                let addrs = self
                    .resolver
                    .resolve_aaaa(host)
                    .await
                    .map_err(map_dns_err)?;
                Ok(addrs
                    .iter()
                    .any(|addr| ipv6_in_network(ip6, *addr, prefix)))
            }
        }
    }
}

fn map_dns_err(err: DnsError) -> EvalError {
    match err {
        DnsError::Temporary { .. } => EvalError::Temp,
        _ => EvalError::Perm,
    }
}

/// IPv4-mapped IPv6 senders are compared as IPv4.
fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

fn ipv4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn ipv6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - prefix as u32);
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}

fn is_spf_record(record: &str) -> bool {
    let trimmed = record.trim();
    trimmed == "v=spf1" || trimmed.starts_with("v=spf1 ")
}

fn parse_record(record: &str) -> Option<SpfRecord> {
    let mut mechanisms = Vec::new();
    let mut redirect = None;

    for term in record.trim().split_ascii_whitespace().skip(1) {
        // Modifiers are name=value pairs; exp= and unknown modifiers are
        // accepted and ignored (exp only affects explanation text).
        if let Some((name, value)) = term.split_once('=') {
            if !name.contains(':') && !name.contains('/') {
                if name.eq_ignore_ascii_case("redirect") {
                    redirect = Some(value.to_ascii_lowercase());
                }
                continue;
            }
        }
        mechanisms.push(parse_mechanism(term)?);
    }

    Some(SpfRecord {
        mechanisms,
        redirect,
    })
}

fn parse_mechanism(term: &str) -> Option<SpfMechanism> {
    let (qualifier, rest) = match term.chars().next()? {
        '+' => (SpfQualifier::Pass, &term[1..]),
        '-' => (SpfQualifier::Fail, &term[1..]),
        '~' => (SpfQualifier::SoftFail, &term[1..]),
        '?' => (SpfQualifier::Neutral, &term[1..]),
        _ => (SpfQualifier::Pass, term),
    };

    let (body, cidr) = match rest.split_once('/') {
        Some((body, suffix)) => (body, Some(suffix.parse::<u8>().ok()?)),
        None => (rest, None),
    };

    let (name, value) = match body.split_once(':') {
        Some((name, value)) if !value.is_empty() => (name, Some(value.to_ascii_lowercase())),
        Some(_) => return None,
        None => (body, None),
    };

    let kind = match name.to_ascii_lowercase().as_str() {
        "all" => SpfMechanismKind::All,
        "ip4" => SpfMechanismKind::Ip4,
        "ip6" => SpfMechanismKind::Ip6,
        "a" => SpfMechanismKind::A,
        "mx" => SpfMechanismKind::Mx,
        "ptr" => SpfMechanismKind::Ptr,
        "exists" => SpfMechanismKind::Exists,
        "include" => SpfMechanismKind::Include,
        // Unknown mechanism: the whole record is unusable.
        _ => return None,
    };

    // ip4/ip6/include/exists require a value; all/ptr take none.
    match kind {
        SpfMechanismKind::Ip4 | SpfMechanismKind::Ip6 | SpfMechanismKind::Include
        | SpfMechanismKind::Exists
            if value.is_none() =>
        {
            return None
        }
        SpfMechanismKind::All if value.is_some() || cidr.is_some() => return None,
        _ => {}
    }

    Some(SpfMechanism {
        kind,
        qualifier,
        value,
        cidr,
    })
}
