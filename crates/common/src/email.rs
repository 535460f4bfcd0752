/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Parsed message model
//!
//! `ParsedEmail` is the transient input of the scoring pipeline. It is
//! created on ingest, moved by value through classification and
//! authentication, and dropped once the verdict is stored. Header access is
//! case-insensitive on read; `raw_headers` preserves the original CRLF
//! folding because DKIM canonicalization operates on the wire form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while constructing the message model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address has no domain part: {0}")]
    MissingDomain(String),
    #[error("address is empty")]
    Empty,
}

/// A single RFC 5322 mailbox.
///
/// Invariant: `domain` is always the part after the last `@` of `address`,
/// lowercased. The only way to build one is [`EmailAddress::parse`], which
/// enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    pub display_name: Option<String>,
    pub domain: String,
}

impl EmailAddress {
    /// Parses `user@domain` with an optional display name.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        Self::parse_with_name(raw, None)
    }

    pub fn parse_with_name(raw: &str, display_name: Option<&str>) -> Result<Self, AddressError> {
        let address = raw.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let domain = address
            .rsplit_once('@')
            .map(|(_, d)| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AddressError::MissingDomain(address.to_string()))?;
        Ok(Self {
            address: address.to_string(),
            display_name: display_name.map(|n| n.trim().to_string()),
            domain,
        })
    }

    /// Local part of the address (before the final `@`).
    pub fn local_part(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(l, _)| l)
            .unwrap_or(&self.address)
    }
}

/// Message body with optional plain-text and HTML parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl EmailBody {
    /// All body content joined for content inspection, text part first.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        if let Some(html) = &self.html {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(html);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }
}

/// Attachment metadata; content may be present as bytes or only as a digest
/// when the ingest layer has already offloaded the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The transient input of the scoring pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEmail {
    pub message_id: String,
    pub from: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
    pub body: EmailBody,
    /// Ordered header list as parsed; names keep their original case.
    headers: Vec<(String, String)>,
    /// Unfolded raw header block with CRLF preserved, required for DKIM.
    pub raw_headers: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedEmail {
    pub fn new(message_id: impl Into<String>, from: EmailAddress) -> Self {
        Self {
            message_id: message_id.into(),
            from,
            recipients: Vec::new(),
            subject: String::new(),
            body: EmailBody::default(),
            headers: Vec::new(),
            raw_headers: String::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_recipient(mut self, to: EmailAddress) -> Self {
        self.recipients.push(to);
        self
    }

    pub fn with_text_body(mut self, text: impl Into<String>) -> Self {
        self.body.text = Some(text.into());
        self
    }

    pub fn with_html_body(mut self, html: impl Into<String>) -> Self {
        self.body.html = Some(html.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_raw_headers(mut self, raw: impl Into<String>) -> Self {
        self.raw_headers = raw.into();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All header values matching `name`, in message order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// All headers in message order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}
