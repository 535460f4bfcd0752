//! # MailWarden Resilience
//!
//! The substrate every external dependency is called through: named circuit
//! breakers with a registry, retry with exponential backoff and jitter, a
//! bounded connection pool with FIFO waiters, and an LRU/TTL query cache
//! with single-flight population.
//!
//! Locking discipline: no lock in this crate is held across an I/O
//! suspension point; breaker hooks fire after the state lock is released.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod retry;
pub mod pool;

pub use breaker::{
    BreakerEvent, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use cache::{
    EntryOptions, EntrySnapshot, NamespacedCache, QueryCache, QueryCacheConfig, QueryCacheStats,
};
pub use error::{BreakerError, PoolError};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use retry::{retry, RetryError, RetryOptions, RetryPolicy};
