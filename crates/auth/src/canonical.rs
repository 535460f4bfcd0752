/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! DKIM canonicalization (RFC 6376 §3.4)
//!
//! Both algorithms operate on the wire form: bodies are normalized to CRLF
//! line endings first, headers keep their original folding for `simple` and
//! are unfolded and whitespace-collapsed for `relaxed`.

/// Canonicalization method for one side of the `c=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Canonicalization::Simple),
            "relaxed" => Some(Canonicalization::Relaxed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        })
    }
}

/// One header field as it appeared in the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    /// Unfolded value with leading whitespace trimmed.
    pub value: String,
    /// Original field text including folding, without the trailing CRLF.
    pub raw: String,
}

/// Splits a raw header block into fields, joining folded continuation lines.
/// Parsing stops at the first empty line.
pub fn parse_headers(raw_headers: &str) -> Vec<RawHeader> {
    let mut headers: Vec<RawHeader> = Vec::new();
    for line in raw_headers.split("\r\n").flat_map(|l| l.split('\n')) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.raw.push_str("\r\n");
                last.raw.push_str(line);
                last.value.push(' ');
                last.value.push_str(line.trim_start());
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push(RawHeader {
            name: name.trim().to_string(),
            value: value.trim_start().to_string(),
            raw: line.to_string(),
        });
    }
    headers
}

/// Converts lone LF line endings to CRLF.
pub fn normalize_crlf(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut prev = 0u8;
    for &byte in body {
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        prev = byte;
    }
    out
}

/// Canonicalizes a message body.
pub fn canonicalize_body(body: &[u8], method: Canonicalization) -> Vec<u8> {
    match method {
        Canonicalization::Simple => body_simple(body),
        Canonicalization::Relaxed => body_relaxed(body),
    }
}

fn body_simple(body: &[u8]) -> Vec<u8> {
    let mut out = normalize_crlf(body);
    if out.is_empty() {
        return b"\r\n".to_vec();
    }
    while out.ends_with(b"\r\n") {
        out.truncate(out.len() - 2);
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn body_relaxed(body: &[u8]) -> Vec<u8> {
    let normalized = normalize_crlf(body);
    let mut lines: Vec<Vec<u8>> = Vec::new();
    for line in normalized.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        lines.push(reduce_whitespace(line));
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Strips trailing whitespace and collapses interior runs to one SP.
fn reduce_whitespace(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut in_wsp = false;
    for &byte in line {
        if byte == b' ' || byte == b'\t' {
            in_wsp = true;
        } else {
            if in_wsp && !out.is_empty() {
                out.push(b' ');
            }
            in_wsp = false;
            out.push(byte);
        }
    }
    out
}

/// Canonicalizes one header field, returning the form that is fed to the
/// hash (with trailing CRLF).
pub fn canonicalize_header(header: &RawHeader, method: Canonicalization) -> String {
    match method {
        Canonicalization::Simple => format!("{}\r\n", header.raw),
        Canonicalization::Relaxed => {
            let unfolded = header.value.replace("\r\n", "");
            let collapsed =
                String::from_utf8(reduce_whitespace(unfolded.trim().as_bytes())).unwrap_or_default();
            format!("{}:{}\r\n", header.name.trim().to_ascii_lowercase(), collapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_body_collapses_trailing_empty_lines() {
        assert_eq!(
            canonicalize_body(b"hello\r\nworld\r\n\r\n\r\n", Canonicalization::Simple),
            b"hello\r\nworld\r\n".to_vec()
        );
    }

    #[test]
    fn simple_empty_body_is_single_crlf() {
        assert_eq!(
            canonicalize_body(b"", Canonicalization::Simple),
            b"\r\n".to_vec()
        );
    }

    #[test]
    fn relaxed_body_collapses_whitespace() {
        assert_eq!(
            canonicalize_body(b"hello \t world  \r\n\r\n", Canonicalization::Relaxed),
            b"hello world\r\n".to_vec()
        );
    }

    #[test]
    fn relaxed_empty_body_stays_empty() {
        assert_eq!(
            canonicalize_body(b"", Canonicalization::Relaxed),
            Vec::<u8>::new()
        );
        assert_eq!(
            canonicalize_body(b"\r\n\r\n", Canonicalization::Relaxed),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn relaxed_body_is_idempotent() {
        let inputs: &[&[u8]] = &[
            b"a  b\tc \r\nnext line\r\n\r\n",
            b"no trailing newline",
            b"",
            b"   leading\r\n",
        ];
        for input in inputs {
            let once = canonicalize_body(input, Canonicalization::Relaxed);
            let twice = canonicalize_body(&once, Canonicalization::Relaxed);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn lf_only_bodies_are_normalized() {
        assert_eq!(
            canonicalize_body(b"line1\nline2\n", Canonicalization::Simple),
            b"line1\r\nline2\r\n".to_vec()
        );
    }

    #[test]
    fn relaxed_header_lowercases_and_collapses() {
        let header = RawHeader {
            name: "Subject".into(),
            value: "Hello   folded\r\n world".into(),
            raw: "Subject: Hello   folded\r\n world".into(),
        };
        assert_eq!(
            canonicalize_header(&header, Canonicalization::Relaxed),
            "subject:Hello folded world\r\n"
        );
    }

    #[test]
    fn simple_header_keeps_original_text() {
        let header = RawHeader {
            name: "Subject".into(),
            value: "Hi".into(),
            raw: "Subject: Hi".into(),
        };
        assert_eq!(
            canonicalize_header(&header, Canonicalization::Simple),
            "Subject: Hi\r\n"
        );
    }

    #[test]
    fn parse_headers_joins_folded_lines() {
        let raw = "From: a@example.com\r\nSubject: part one\r\n\tpart two\r\nTo: b@example.com\r\n\r\nbody";
        let headers = parse_headers(raw);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[1].name, "Subject");
        assert_eq!(headers[1].value, "part one part two");
        assert_eq!(headers[1].raw, "Subject: part one\r\n\tpart two");
    }
}
