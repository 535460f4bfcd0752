/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # MailWarden Authentication Engine
//!
//! SPF (RFC 7208), DKIM (RFC 6376/8463) and DMARC (RFC 7489) evaluation over
//! the pluggable DNS layer. Results are reported with the RFC-defined result
//! strings (`pass`, `fail`, `softfail`, `neutral`, `none`, `temperror`,
//! `permerror`) so downstream consumers and Authentication-Results headers
//! agree on vocabulary.
//!
//! ## Evaluation order
//!
//! The scoring pipeline runs SPF against the envelope sender, verifies every
//! DKIM-Signature header independently, then feeds both outcomes into DMARC
//! alignment to derive the applied policy.

pub mod canonical;
pub mod dkim;
pub mod dmarc;
pub mod spf;

pub use canonical::Canonicalization;
pub use dkim::{
    CanonPair, DkimAlgorithm, DkimPublicKey, DkimResult, DkimSignature, DkimVerification,
    DkimVerifier,
};
pub use dmarc::{
    organizational_domain, AlignmentMode, DmarcEvaluation, DmarcEvaluator, DmarcInput, DmarcPolicy,
    DmarcRecord, DmarcResult,
};
pub use spf::{SpfEvaluation, SpfMechanism, SpfMechanismKind, SpfQualifier, SpfResult, SpfVerifier};
