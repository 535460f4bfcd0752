//! # MailWarden Classifier
//!
//! Email-type inference that runs ahead of threat scoring. The inferred type
//! (marketing, transactional, automated, personal) gates expensive detectors
//! and modulates the final threat score: a newsletter from a known retailer
//! carries a much lower prior than an unsolicited personal message.
//!
//! The sender registry is built once at process start and is read-only
//! afterwards; tests construct isolated instances.

pub mod classify;
pub mod registry;
pub mod signals;

pub use classify::{EmailClassification, EmailClassifier, EmailType};
pub use registry::{SenderCategory, SenderInfo, SenderRegistry};
pub use signals::{MarketingSignal, MarketingSignals, SignalDetector};
