/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # MailWarden Pipeline
//!
//! The scoring pipeline glues the core together: classify the message
//! (C5), authenticate it over the cached DNS layer (C1-C4), score threat
//! signals gated and modulated by the classification, derive a verdict,
//! and drive auto-remediation (C9) for blocking verdicts. External DNS
//! runs under the resilience wrappers (C6); the worker queue (C7) feeds
//! the pipeline through its [`queue::JobProcessor`] implementation.

pub mod resilient;
pub mod scoring;
pub mod signals;
pub mod verdict;

pub use resilient::ResilientResolver;
pub use scoring::{PipelineConfig, ScoringContext, ScoringPipeline};
pub use signals::{ThreatAnalyzer, ThreatSignal};
pub use verdict::{AuthenticationSummary, DkimOutcome, ThreatVerdict, VerdictAction};
