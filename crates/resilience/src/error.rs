//! Error types for the resilience substrate.

use thiserror::Error;

use crate::breaker::BreakerStats;
use crate::pool::PoolStats;

/// Failures surfaced by [`crate::breaker::CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{name}' is open")]
    Open { name: String, stats: BreakerStats },
    /// The operation exceeded the per-call timeout.
    #[error("circuit '{name}' call timed out after {elapsed_ms} ms")]
    Timeout { name: String, elapsed_ms: u64 },
    /// The operation itself failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// The wrapped operation error, if the call got that far.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(err) => Some(err),
            _ => None,
        }
    }
}

/// Failures surfaced by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the acquire timeout. Carries a
    /// stats snapshot for the capacity error report.
    #[error(
        "connection acquire timed out after {timeout_ms} ms ({} total, {} idle, {} waiting)",
        stats.total,
        stats.idle,
        stats.waiting
    )]
    AcquireTimeout { timeout_ms: u64, stats: PoolStats },
    /// The pool is draining or has been drained.
    #[error("connection pool is draining")]
    Draining,
    /// The factory failed to create a connection.
    #[error("connection factory failed: {0}")]
    Factory(String),
}

impl common::error::ClassifyError for PoolError {
    fn class(&self) -> common::ErrorClass {
        match self {
            PoolError::AcquireTimeout { .. } => common::ErrorClass::Capacity,
            PoolError::Draining => common::ErrorClass::Capacity,
            PoolError::Factory(_) => common::ErrorClass::Transient,
        }
    }
}
