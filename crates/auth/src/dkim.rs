/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! DKIM verification (RFC 6376, RFC 8463 for Ed25519)
//!
//! Each DKIM-Signature header is verified independently: parse the tag bag,
//! fetch the public key at `<selector>._domainkey.<domain>`, hash the
//! canonicalized body against `bh=`, then verify `b=` over the canonicalized
//! header set. Retrieved keys are cached per `(selector, domain)` with a
//! configurable TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dns::{DnsError, DnsResolver};
use parking_lot::RwLock;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::Pkcs1v15Sign;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::canonical::{
    canonicalize_body, canonicalize_header, parse_headers, Canonicalization, RawHeader,
};

const DEFAULT_KEY_TTL: Duration = Duration::from_secs(300);

/// RFC 6376 verification results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkimResult {
    Pass,
    Fail,
    Neutral,
    TempError,
    PermError,
}

impl DkimResult {
    pub fn is_pass(self) -> bool {
        matches!(self, DkimResult::Pass)
    }
}

impl std::fmt::Display for DkimResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::Neutral => "neutral",
            DkimResult::TempError => "temperror",
            DkimResult::PermError => "permerror",
        })
    }
}

/// Signing algorithm from the `a=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkimAlgorithm {
    RsaSha1,
    RsaSha256,
    Ed25519Sha256,
}

impl DkimAlgorithm {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "rsa-sha1" => Some(DkimAlgorithm::RsaSha1),
            "rsa-sha256" => Some(DkimAlgorithm::RsaSha256),
            "ed25519-sha256" => Some(DkimAlgorithm::Ed25519Sha256),
            _ => None,
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            DkimAlgorithm::RsaSha1 => Sha1::digest(data).to_vec(),
            DkimAlgorithm::RsaSha256 | DkimAlgorithm::Ed25519Sha256 => {
                Sha256::digest(data).to_vec()
            }
        }
    }
}

/// Parsed DKIM-Signature tag bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimSignature {
    pub algorithm: DkimAlgorithm,
    pub signature: Vec<u8>,
    pub body_hash: Vec<u8>,
    pub canonicalization: CanonPair,
    pub domain: String,
    pub selector: String,
    /// `h=` list, order preserved, names case-folded for matching.
    pub signed_headers: Vec<String>,
    pub identity: Option<String>,
    pub timestamp: Option<u64>,
    pub expiration: Option<u64>,
    pub body_length: Option<u64>,
}

/// `c=` tag value, header and body methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanonPair {
    #[serde(skip)]
    pub header: Canonicalization,
    #[serde(skip)]
    pub body: Canonicalization,
}

/// Public key published at `<selector>._domainkey.<domain>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimPublicKey {
    /// `k=` tag, defaults to rsa.
    pub key_type: String,
    /// Decoded `p=` tag; empty means revoked.
    pub key_data: Vec<u8>,
    pub flags: Vec<String>,
    pub hash_algorithms: Vec<String>,
    pub service_types: Vec<String>,
}

/// Outcome of verifying a single signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimVerification {
    pub result: DkimResult,
    pub domain: String,
    pub selector: String,
    pub signature: Option<DkimSignature>,
    pub error: Option<String>,
}

impl DkimVerification {
    fn failure(result: DkimResult, domain: &str, selector: &str, error: impl Into<String>) -> Self {
        Self {
            result,
            domain: domain.to_string(),
            selector: selector.to_string(),
            signature: None,
            error: Some(error.into()),
        }
    }
}

struct CachedKey {
    key: DkimPublicKey,
    expires_at: Instant,
}

/// Stateless per-signature verifier with a shared key cache.
pub struct DkimVerifier {
    resolver: Arc<dyn DnsResolver>,
    key_cache: RwLock<HashMap<(String, String), CachedKey>>,
    key_ttl: Duration,
}

impl DkimVerifier {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            key_cache: RwLock::new(HashMap::new()),
            key_ttl: DEFAULT_KEY_TTL,
        }
    }

    pub fn with_key_ttl(mut self, ttl: Duration) -> Self {
        self.key_ttl = ttl;
        self
    }

    /// Verifies every DKIM-Signature header in `raw_headers` independently.
    pub async fn verify_all(&self, raw_headers: &str, raw_body: &[u8]) -> Vec<DkimVerification> {
        let headers = parse_headers(raw_headers);
        let mut results = Vec::new();
        for header in &headers {
            if header.name.eq_ignore_ascii_case("dkim-signature") {
                results.push(self.verify(raw_headers, raw_body, &header.raw).await);
            }
        }
        results
    }

    /// Verifies one signature. `signature_header` is the original header
    /// field (with or without the `DKIM-Signature:` prefix).
    pub async fn verify(
        &self,
        raw_headers: &str,
        raw_body: &[u8],
        signature_header: &str,
    ) -> DkimVerification {
        let raw_field = normalize_signature_field(signature_header);
        let value = raw_field
            .split_once(':')
            .map(|(_, v)| v)
            .unwrap_or(raw_field.as_str());

        let signature = match parse_signature(value) {
            Ok(signature) => signature,
            Err(err) => {
                debug!(error = %err, "DKIM signature parse failed");
                return DkimVerification::failure(DkimResult::PermError, "", "", err);
            }
        };
        let domain = signature.domain.clone();
        let selector = signature.selector.clone();

        if let Some(expiration) = signature.expiration {
            if expiration < unix_now() {
                return DkimVerification::failure(
                    DkimResult::Fail,
                    &domain,
                    &selector,
                    "signature expired",
                );
            }
        }

        let key = match self.fetch_key(&selector, &domain).await {
            Ok(key) => key,
            Err(failure) => return failure,
        };
        if key.key_data.is_empty() {
            return DkimVerification::failure(DkimResult::Fail, &domain, &selector, "key revoked");
        }

        // Body hash first; a mismatch short-circuits the expensive part.
        let mut body = canonicalize_body(raw_body, signature.canonicalization.body);
        if let Some(length) = signature.body_length {
            body.truncate(length as usize);
        }
        let body_hash = signature.algorithm.hash(&body);
        if body_hash != signature.body_hash {
            return DkimVerification::failure(
                DkimResult::Fail,
                &domain,
                &selector,
                "body hash mismatch",
            );
        }

        let data = assemble_signed_data(raw_headers, &raw_field, &signature);
        match verify_signature(&key, &signature, &data) {
            Ok(()) => {
                trace!(domain, selector, "DKIM signature verified");
                DkimVerification {
                    result: DkimResult::Pass,
                    domain,
                    selector,
                    signature: Some(signature),
                    error: None,
                }
            }
            Err(failure) => DkimVerification {
                result: failure.result,
                domain,
                selector,
                signature: Some(signature),
                error: Some(failure.message),
            },
        }
    }

    async fn fetch_key(
        &self,
        selector: &str,
        domain: &str,
    ) -> Result<DkimPublicKey, DkimVerification> {
        let cache_key = (selector.to_string(), domain.to_string());
        if let Some(cached) = self.key_cache.read().get(&cache_key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.key.clone());
            }
        }

        let name = format!("{selector}._domainkey.{domain}");
        let records = match self.resolver.resolve_txt(&name).await {
            Ok(records) => records,
            Err(DnsError::Temporary { reason, .. }) => {
                return Err(DkimVerification::failure(
                    DkimResult::TempError,
                    domain,
                    selector,
                    format!("key lookup failed: {reason}"),
                ))
            }
            Err(err) => {
                return Err(DkimVerification::failure(
                    DkimResult::PermError,
                    domain,
                    selector,
                    format!("key lookup failed: {err}"),
                ))
            }
        };

        let record = records
            .iter()
            .find(|r| r.contains("p="))
            .ok_or_else(|| {
                DkimVerification::failure(
                    DkimResult::PermError,
                    domain,
                    selector,
                    "key record not found",
                )
            })?;

        let key = parse_public_key(record).map_err(|err| {
            DkimVerification::failure(DkimResult::PermError, domain, selector, err)
        })?;

        self.key_cache.write().insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                expires_at: Instant::now() + self.key_ttl,
            },
        );
        Ok(key)
    }
}

struct VerifyFailure {
    result: DkimResult,
    message: String,
}

fn verify_signature(
    key: &DkimPublicKey,
    signature: &DkimSignature,
    data: &[u8],
) -> Result<(), VerifyFailure> {
    let digest = signature.algorithm.hash(data);
    match signature.algorithm {
        DkimAlgorithm::RsaSha1 | DkimAlgorithm::RsaSha256 => {
            if !key.key_type.eq_ignore_ascii_case("rsa") {
                return Err(VerifyFailure {
                    result: DkimResult::PermError,
                    message: format!("key type {} incompatible with rsa signature", key.key_type),
                });
            }
            let public_key = rsa::RsaPublicKey::from_public_key_der(&key.key_data)
                .or_else(|_| rsa::RsaPublicKey::from_pkcs1_der(&key.key_data))
                .map_err(|err| VerifyFailure {
                    result: DkimResult::PermError,
                    message: format!("invalid rsa public key: {err}"),
                })?;
            let padding = match signature.algorithm {
                DkimAlgorithm::RsaSha1 => Pkcs1v15Sign::new::<Sha1>(),
                _ => Pkcs1v15Sign::new::<Sha256>(),
            };
            public_key
                .verify(padding, &digest, &signature.signature)
                .map_err(|_| VerifyFailure {
                    result: DkimResult::Fail,
                    message: "signature verification failed".to_string(),
                })
        }
        DkimAlgorithm::Ed25519Sha256 => {
            if !key.key_type.eq_ignore_ascii_case("ed25519") {
                return Err(VerifyFailure {
                    result: DkimResult::PermError,
                    message: format!(
                        "key type {} incompatible with ed25519 signature",
                        key.key_type
                    ),
                });
            }
            let key_bytes: [u8; 32] = key.key_data.as_slice().try_into().map_err(|_| {
                VerifyFailure {
                    result: DkimResult::PermError,
                    message: "ed25519 key must be 32 bytes".to_string(),
                }
            })?;
            let verifying_key =
                ed25519_dalek::VerifyingKey::from_bytes(&key_bytes).map_err(|err| {
                    VerifyFailure {
                        result: DkimResult::PermError,
                        message: format!("invalid ed25519 public key: {err}"),
                    }
                })?;
            let sig_bytes: [u8; 64] =
                signature.signature.as_slice().try_into().map_err(|_| VerifyFailure {
                    result: DkimResult::Fail,
                    message: "ed25519 signature must be 64 bytes".to_string(),
                })?;
            verifying_key
                .verify_strict(&digest, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
                .map_err(|_| VerifyFailure {
                    result: DkimResult::Fail,
                    message: "signature verification failed".to_string(),
                })
        }
    }
}

/// Selects signed headers bottom-up and appends the blanked signature
/// header, producing the exact byte sequence that was signed.
fn assemble_signed_data(raw_headers: &str, raw_field: &str, signature: &DkimSignature) -> Vec<u8> {
    let headers = parse_headers(raw_headers);
    let method = signature.canonicalization.header;

    // DKIM consumes header instances from the bottom of the message up;
    // a name repeated in h= selects the next instance above the last one.
    let mut cursor: HashMap<String, usize> = HashMap::new();
    let mut data = String::new();
    for name in &signature.signed_headers {
        let folded = name.to_ascii_lowercase();
        let next_from = cursor.get(&folded).copied().unwrap_or(headers.len());
        let found = headers[..next_from]
            .iter()
            .rposition(|h| h.name.eq_ignore_ascii_case(name));
        if let Some(index) = found {
            cursor.insert(folded, index);
            data.push_str(&canonicalize_header(&headers[index], method));
        }
        // A name listed in h= but absent from the message contributes
        // nothing (RFC 6376 §5.4).
    }

    let blanked = blank_b_tag(raw_field);
    let sig_header = parse_headers(&blanked)
        .into_iter()
        .next()
        .unwrap_or(RawHeader {
            name: "DKIM-Signature".to_string(),
            value: String::new(),
            raw: blanked.clone(),
        });
    let mut canonical_sig = canonicalize_header(&sig_header, method);
    // The signature header itself is hashed without a trailing CRLF.
    if canonical_sig.ends_with("\r\n") {
        canonical_sig.truncate(canonical_sig.len() - 2);
    }
    data.push_str(&canonical_sig);
    data.into_bytes()
}

/// Replaces the `b=` tag's value with the empty string, preserving the tag.
fn blank_b_tag(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find("b=") {
        let before = &rest[..pos];
        // Must be the b tag itself, not bh= or part of another token.
        let prev = before.chars().rev().find(|c| !c.is_whitespace());
        let is_tag_start = matches!(prev, None | Some(';') | Some(':'));
        out.push_str(before);
        out.push_str("b=");
        let after = &rest[pos + 2..];
        if is_tag_start {
            match after.find(';') {
                Some(end) => rest = &after[end..],
                None => rest = "",
            }
        } else {
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn normalize_signature_field(signature_header: &str) -> String {
    let trimmed = signature_header.trim_end_matches(['\r', '\n']);
    if trimmed
        .to_ascii_lowercase()
        .starts_with("dkim-signature")
    {
        trimmed.to_string()
    } else {
        format!("DKIM-Signature: {trimmed}")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Splits a `;`-separated tag list, unfolding and trimming each tag.
fn parse_tags(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|tag| {
            let tag = tag.trim();
            if tag.is_empty() {
                return None;
            }
            let (name, val) = tag.split_once('=')?;
            Some((name.trim().to_ascii_lowercase(), val.trim().to_string()))
        })
        .collect()
}

fn parse_signature(value: &str) -> Result<DkimSignature, String> {
    let unfolded = value.replace("\r\n", "").replace('\n', "");
    let tags = parse_tags(&unfolded);
    let get = |name: &str| -> Option<&str> {
        tags.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    for required in ["v", "a", "d", "s", "h", "bh", "b"] {
        if get(required).is_none() {
            return Err(format!("missing required tag {required}="));
        }
    }

    let version = get("v").unwrap();
    if version != "1" {
        return Err(format!("unsupported version {version}"));
    }

    let algorithm = DkimAlgorithm::parse(get("a").unwrap())
        .ok_or_else(|| format!("unsupported algorithm {}", get("a").unwrap()))?;

    // Whitespace inside b= and bh= is stripped before decoding.
    let signature = BASE64
        .decode(strip_whitespace(get("b").unwrap()))
        .map_err(|err| format!("invalid b= tag: {err}"))?;
    let body_hash = BASE64
        .decode(strip_whitespace(get("bh").unwrap()))
        .map_err(|err| format!("invalid bh= tag: {err}"))?;

    let canonicalization = match get("c") {
        None => CanonPair::default(),
        Some(c) => {
            let (header, body) = match c.split_once('/') {
                Some((h, b)) => (h, b),
                // A single token names the header method; body defaults
                // to simple.
                None => (c, "simple"),
            };
            CanonPair {
                header: Canonicalization::parse(header)
                    .ok_or_else(|| format!("invalid canonicalization {c}"))?,
                body: Canonicalization::parse(body)
                    .ok_or_else(|| format!("invalid canonicalization {c}"))?,
            }
        }
    };

    let signed_headers: Vec<String> = get("h")
        .unwrap()
        .split(':')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    if signed_headers.is_empty() {
        return Err("h= tag lists no headers".to_string());
    }

    let parse_u64 = |name: &str| -> Result<Option<u64>, String> {
        match get(name) {
            None => Ok(None),
            Some(v) => v
                .parse::<u64>()
                .map(Some)
                .map_err(|_| format!("invalid {name}= tag")),
        }
    };

    Ok(DkimSignature {
        algorithm,
        signature,
        body_hash,
        canonicalization,
        domain: get("d").unwrap().to_ascii_lowercase(),
        selector: get("s").unwrap().to_string(),
        signed_headers,
        identity: get("i").map(|s| s.to_string()),
        timestamp: parse_u64("t")?,
        expiration: parse_u64("x")?,
        body_length: parse_u64("l")?,
    })
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_public_key(record: &str) -> Result<DkimPublicKey, String> {
    let tags = parse_tags(record);
    let get = |name: &str| -> Option<&str> {
        tags.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    if let Some(version) = get("v") {
        if version != "DKIM1" {
            return Err(format!("unsupported key record version {version}"));
        }
    }

    let key_data = match get("p") {
        Some(p) if !p.is_empty() => BASE64
            .decode(strip_whitespace(p))
            .map_err(|err| format!("invalid p= tag: {err}"))?,
        // Empty p= is an explicit revocation, surfaced by the caller.
        Some(_) => Vec::new(),
        None => return Err("key record missing p= tag".to_string()),
    };

    let split_list = |value: Option<&str>| -> Vec<String> {
        value
            .map(|v| v.split(':').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    };

    Ok(DkimPublicKey {
        key_type: get("k").unwrap_or("rsa").to_string(),
        key_data,
        flags: split_list(get("t")),
        hash_algorithms: split_list(get("h")),
        service_types: split_list(get("s")),
    })
}

// COMPREHENSIVE TEST SUITE - ALWAYS AT THE BOTTOM OF EVERY FILE
#[cfg(test)]
mod tests {
    use super::*;
    use dns::MockResolver;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    const TEST_BODY: &[u8] = b"Dear customer,\r\n\r\nYour invoice is attached.\r\n";

    /// Signs `raw_headers`/`body` with a fresh RSA key and publishes the
    /// public half in the mock resolver, returning the signature field.
    fn sign_rsa(
        mock: &MockResolver,
        selector: &str,
        domain: &str,
        raw_headers: &str,
        body: &[u8],
        signed: &[&str],
    ) -> (String, RsaPrivateKey) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let field = sign_rsa_with_key(mock, selector, domain, raw_headers, body, signed, &private_key);
        (field, private_key)
    }

    fn sign_rsa_with_key(
        mock: &MockResolver,
        selector: &str,
        domain: &str,
        raw_headers: &str,
        body: &[u8],
        signed: &[&str],
        private_key: &RsaPrivateKey,
    ) -> String {
        let public_der = private_key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        mock.add_txt(
            &format!("{selector}._domainkey.{domain}"),
            &[format!("v=DKIM1; k=rsa; p={}", BASE64.encode(&public_der)).as_str()],
        );

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body(
            body,
            Canonicalization::Relaxed,
        )));
        let h_list = signed.join(":");
        let unsigned_field = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; d={domain}; s={selector}; h={h_list}; bh={body_hash}; b="
        );

        let signature = parse_signature(unsigned_field.split_once(':').unwrap().1)
            .map(|mut s| {
                // b= is empty pre-signing; fill the parsed struct so the
                // data assembly sees the final h=/c= values.
                s.signature.clear();
                s
            })
            .unwrap();
        let data = assemble_signed_data(raw_headers, &unsigned_field, &signature);
        let digest = Sha256::digest(&data);
        let sig_bytes = private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        format!("{unsigned_field}{}", BASE64.encode(sig_bytes))
    }

    fn headers_block() -> String {
        "From: billing@example.com\r\nTo: customer@example.net\r\nSubject: Invoice 42\r\nDate: Mon, 01 Jan 2024 00:00:00 +0000\r\n".to_string()
    }

    #[tokio::test]
    async fn round_trip_rsa_sha256_passes() {
        let mock = Arc::new(MockResolver::new());
        let raw_headers = headers_block();
        let (field, _) = sign_rsa(
            &mock,
            "sel1",
            "example.com",
            &raw_headers,
            TEST_BODY,
            &["from", "to", "subject"],
        );

        let verifier = DkimVerifier::new(mock);
        let outcome = verifier.verify(&raw_headers, TEST_BODY, &field).await;
        assert_eq!(outcome.result, DkimResult::Pass, "{:?}", outcome.error);
        assert_eq!(outcome.domain, "example.com");
        assert_eq!(outcome.selector, "sel1");
    }

    #[tokio::test]
    async fn verify_is_idempotent() {
        let mock = Arc::new(MockResolver::new());
        let raw_headers = headers_block();
        let (field, _) = sign_rsa(
            &mock,
            "sel1",
            "example.com",
            &raw_headers,
            TEST_BODY,
            &["from", "subject"],
        );

        let verifier = DkimVerifier::new(mock);
        let first = verifier.verify(&raw_headers, TEST_BODY, &field).await;
        let second = verifier.verify(&raw_headers, TEST_BODY, &field).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn tampered_body_fails_with_body_hash_mismatch() {
        let mock = Arc::new(MockResolver::new());
        let raw_headers = headers_block();
        let (field, _) = sign_rsa(
            &mock,
            "sel1",
            "example.com",
            &raw_headers,
            TEST_BODY,
            &["from", "subject"],
        );

        let verifier = DkimVerifier::new(mock);
        let outcome = verifier
            .verify(&raw_headers, b"Tampered body\r\n", &field)
            .await;
        assert_eq!(outcome.result, DkimResult::Fail);
        assert_eq!(outcome.error.as_deref(), Some("body hash mismatch"));
    }

    #[tokio::test]
    async fn tampered_header_fails_verification() {
        let mock = Arc::new(MockResolver::new());
        let raw_headers = headers_block();
        let (field, _) = sign_rsa(
            &mock,
            "sel1",
            "example.com",
            &raw_headers,
            TEST_BODY,
            &["from", "subject"],
        );

        let tampered = raw_headers.replace("Invoice 42", "Invoice 43");
        let verifier = DkimVerifier::new(mock);
        let outcome = verifier.verify(&tampered, TEST_BODY, &field).await;
        assert_eq!(outcome.result, DkimResult::Fail);
        assert_eq!(
            outcome.error.as_deref(),
            Some("signature verification failed")
        );
    }

    #[tokio::test]
    async fn missing_required_tag_is_permerror() {
        let mock = Arc::new(MockResolver::new());
        let verifier = DkimVerifier::new(mock);
        let outcome = verifier
            .verify(
                "From: a@b.c\r\n",
                b"",
                "v=1; a=rsa-sha256; d=example.com; h=from; bh=AAAA; b=BBBB",
            )
            .await;
        assert_eq!(outcome.result, DkimResult::PermError);
        assert!(outcome.error.unwrap().contains("missing required tag s="));
    }

    #[tokio::test]
    async fn expired_signature_fails() {
        let mock = Arc::new(MockResolver::new());
        let verifier = DkimVerifier::new(mock);
        let outcome = verifier
            .verify(
                "From: a@b.c\r\n",
                b"",
                "v=1; a=rsa-sha256; d=example.com; s=sel; h=from; bh=AAAA; b=BBBB; x=10",
            )
            .await;
        assert_eq!(outcome.result, DkimResult::Fail);
        assert_eq!(outcome.error.as_deref(), Some("signature expired"));
    }

    #[tokio::test]
    async fn revoked_key_fails() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("sel._domainkey.example.com", &["v=DKIM1; k=rsa; p="]);
        let verifier = DkimVerifier::new(mock);
        let outcome = verifier
            .verify(
                "From: a@b.c\r\n",
                b"",
                "v=1; a=rsa-sha256; d=example.com; s=sel; h=from; bh=AAAA; b=BBBB",
            )
            .await;
        assert_eq!(outcome.result, DkimResult::Fail);
        assert_eq!(outcome.error.as_deref(), Some("key revoked"));
    }

    #[tokio::test]
    async fn dns_failure_is_temperror() {
        let mock = Arc::new(MockResolver::new());
        mock.fail_domain("sel._domainkey.example.com", "timeout");
        let verifier = DkimVerifier::new(mock);
        let outcome = verifier
            .verify(
                "From: a@b.c\r\n",
                b"",
                "v=1; a=rsa-sha256; d=example.com; s=sel; h=from; bh=AAAA; b=BBBB",
            )
            .await;
        assert_eq!(outcome.result, DkimResult::TempError);
    }

    #[tokio::test]
    async fn keys_are_cached_per_selector_domain() {
        let mock = Arc::new(MockResolver::new());
        let raw_headers = headers_block();
        let (field, _) = sign_rsa(
            &mock,
            "sel1",
            "example.com",
            &raw_headers,
            TEST_BODY,
            &["from"],
        );

        let verifier = DkimVerifier::new(mock.clone());
        verifier.verify(&raw_headers, TEST_BODY, &field).await;
        verifier.verify(&raw_headers, TEST_BODY, &field).await;
        assert_eq!(mock.txt_queries(), 1);
    }

    #[tokio::test]
    async fn verify_all_handles_multiple_signatures() {
        let mock = Arc::new(MockResolver::new());
        let base_headers = headers_block();
        let (field_a, _) = sign_rsa(
            &mock,
            "sela",
            "example.com",
            &base_headers,
            TEST_BODY,
            &["from", "subject"],
        );
        let (field_b, _) = sign_rsa(
            &mock,
            "selb",
            "forwarder.test",
            &base_headers,
            TEST_BODY,
            &["from"],
        );

        let full_headers = format!("{field_a}\r\n{field_b}\r\n{base_headers}");
        let verifier = DkimVerifier::new(mock);
        let outcomes = verifier.verify_all(&full_headers, TEST_BODY).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result == DkimResult::Pass));
        let domains: Vec<_> = outcomes.iter().map(|o| o.domain.as_str()).collect();
        assert!(domains.contains(&"example.com"));
        assert!(domains.contains(&"forwarder.test"));
    }

    #[test]
    fn blank_b_preserves_bh() {
        let field = "DKIM-Signature: v=1; bh=AAAA; b=SECRET; d=x";
        assert_eq!(
            blank_b_tag(field),
            "DKIM-Signature: v=1; bh=AAAA; b=; d=x"
        );

        let trailing = "DKIM-Signature: v=1; bh=AAAA; b=SECRET";
        assert_eq!(blank_b_tag(trailing), "DKIM-Signature: v=1; bh=AAAA; b=");
    }

    #[test]
    fn parse_signature_defaults() {
        let sig = parse_signature(
            "v=1; a=rsa-sha256; d=Example.COM; s=sel; h=From:Subject; bh=AAAA; b=BBBB",
        )
        .unwrap();
        assert_eq!(sig.domain, "example.com");
        assert_eq!(sig.canonicalization.header, Canonicalization::Simple);
        assert_eq!(sig.canonicalization.body, Canonicalization::Simple);
        assert_eq!(sig.signed_headers, vec!["from", "subject"]);
    }

    #[test]
    fn parse_signature_single_canon_token() {
        let sig = parse_signature(
            "v=1; a=rsa-sha256; c=relaxed; d=x.com; s=sel; h=from; bh=AAAA; b=BBBB",
        )
        .unwrap();
        assert_eq!(sig.canonicalization.header, Canonicalization::Relaxed);
        assert_eq!(sig.canonicalization.body, Canonicalization::Simple);
    }

    #[test]
    fn parse_key_defaults_to_rsa() {
        let key = parse_public_key("p=QUJD").unwrap();
        assert_eq!(key.key_type, "rsa");
        assert_eq!(key.key_data, b"ABC".to_vec());
    }
}
