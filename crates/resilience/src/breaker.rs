//! Circuit breaker
//!
//! Named breakers guard each external dependency. State transitions:
//! CLOSED opens after `failure_threshold` consecutive failures; OPEN moves
//! to HALF_OPEN lazily once `reset_timeout` has elapsed (observed on the
//! next call or state read); HALF_OPEN closes after `success_threshold`
//! consecutive successes and re-opens on any failure. Calls in OPEN are
//! rejected without invoking the operation. Every call is bounded by the
//! per-call timeout; a timeout is recorded as a failure.
//!
//! Hooks receive a state snapshot and fire after the breaker lock is
//! released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::error::ClassifyError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BreakerError;

/// Breaker thresholds and timeouts.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Per-call timeout; a timeout counts as a failure.
    pub call_timeout: Duration,
    /// How long OPEN lasts before the next call probes in HALF_OPEN.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Counter snapshot, also embedded in capacity errors and hook events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    /// Milliseconds since the last state change.
    pub since_state_change_ms: u64,
}

/// Snapshot passed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub name: String,
    pub state: CircuitState,
    pub stats: BreakerStats,
}

type Hook = Box<dyn Fn(&BreakerEvent) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_open: Vec<Hook>,
    on_close: Vec<Hook>,
    on_half_open: Vec<Hook>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
    total_timeouts: u64,
    last_state_change: Instant,
}

impl BreakerInner {
    fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejected: self.total_rejected,
            total_timeouts: self.total_timeouts,
            since_state_change_ms: self.last_state_change.elapsed().as_millis() as u64,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.last_state_change = Instant::now();
    }
}

/// A named circuit breaker; lives for the process once created.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    hooks: RwLock<Hooks>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
                total_timeouts: 0,
                last_state_change: Instant::now(),
            }),
            hooks: RwLock::new(Hooks::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; performs the lazy OPEN to HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        let event = {
            let mut inner = self.inner.lock();
            self.maybe_probe(&mut inner)
        };
        self.fire(event);
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().stats()
    }

    /// Runs `operation` under the breaker, bounding it with the per-call
    /// timeout. Every error counts as a failure; use
    /// [`execute_classified`](Self::execute_classified) to exempt permanent
    /// dependency errors.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but failures that classify as
    /// permanent (4xx responses, parse errors) do not move the state
    /// machine.
    pub async fn execute_classified<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError,
    {
        self.run(operation, |err: &E| err.class().counts_toward_breaker())
            .await
    }

    async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        counts_as_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let rejection = {
            let mut inner = self.inner.lock();
            let event = self.maybe_probe(&mut inner);
            if inner.state == CircuitState::Open {
                inner.total_rejected += 1;
                Some((event, inner.stats()))
            } else {
                drop(inner);
                self.fire(event);
                None
            }
        };
        if let Some((event, stats)) = rejection {
            self.fire(event);
            return Err(BreakerError::Open {
                name: self.name.clone(),
                stats,
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if counts_as_failure(&err) {
                    self.record_failure(false);
                }
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure(true);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Records a success observed outside `execute`.
    pub fn record_success(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            inner.consecutive_failures = 0;
            inner.consecutive_successes += 1;
            match inner.state {
                CircuitState::HalfOpen
                    if inner.consecutive_successes >= self.config.success_threshold =>
                {
                    inner.transition(CircuitState::Closed);
                    info!(breaker = %self.name, "circuit closed after successful probes");
                    Some(self.event_for(&inner))
                }
                _ => None,
            }
        };
        self.fire(event);
    }

    /// Records a failure observed outside `execute`.
    pub fn record_failure(&self, timed_out: bool) {
        let event = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            if timed_out {
                inner.total_timeouts += 1;
            }
            inner.consecutive_successes = 0;
            inner.consecutive_failures += 1;
            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.transition(CircuitState::Open);
                    warn!(breaker = %self.name, "circuit opened");
                    Some(self.event_for(&inner))
                }
                CircuitState::HalfOpen => {
                    inner.transition(CircuitState::Open);
                    warn!(breaker = %self.name, "probe failed, circuit re-opened");
                    Some(self.event_for(&inner))
                }
                _ => None,
            }
        };
        self.fire(event);
    }

    /// Forces the breaker open regardless of counters.
    pub fn force_open(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.transition(CircuitState::Open);
            Some(self.event_for(&inner))
        };
        self.fire(event);
    }

    /// Forces the breaker closed regardless of counters.
    pub fn force_close(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.transition(CircuitState::Closed);
            Some(self.event_for(&inner))
        };
        self.fire(event);
    }

    /// Forces CLOSED and clears all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.total_successes = 0;
        inner.total_failures = 0;
        inner.total_rejected = 0;
        inner.total_timeouts = 0;
    }

    pub fn on_open(&self, hook: impl Fn(&BreakerEvent) + Send + Sync + 'static) {
        self.hooks.write().on_open.push(Box::new(hook));
    }

    pub fn on_close(&self, hook: impl Fn(&BreakerEvent) + Send + Sync + 'static) {
        self.hooks.write().on_close.push(Box::new(hook));
    }

    pub fn on_half_open(&self, hook: impl Fn(&BreakerEvent) + Send + Sync + 'static) {
        self.hooks.write().on_half_open.push(Box::new(hook));
    }

    /// Lazy OPEN to HALF_OPEN transition; returns the event to fire after
    /// the lock is released.
    fn maybe_probe(&self, inner: &mut BreakerInner) -> Option<BreakerEvent> {
        if inner.state == CircuitState::Open
            && inner.last_state_change.elapsed() >= self.config.reset_timeout
        {
            inner.transition(CircuitState::HalfOpen);
            debug!(breaker = %self.name, "circuit half-open, probing");
            return Some(self.event_for(inner));
        }
        None
    }

    fn event_for(&self, inner: &BreakerInner) -> BreakerEvent {
        BreakerEvent {
            name: self.name.clone(),
            state: inner.state,
            stats: inner.stats(),
        }
    }

    fn fire(&self, event: Option<BreakerEvent>) {
        let Some(event) = event else { return };
        let hooks = self.hooks.read();
        let list = match event.state {
            CircuitState::Open => &hooks.on_open,
            CircuitState::Closed => &hooks.on_close,
            CircuitState::HalfOpen => &hooks.on_half_open,
        };
        for hook in list {
            hook(&event);
        }
    }
}

/// Name-to-breaker registry shared by the process.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Returns the breaker for `name`, creating it with the registry's
    /// default configuration on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
        }))
    }

    /// Registers a breaker with custom configuration, replacing any
    /// existing breaker of the same name.
    pub fn insert(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.breakers
            .write()
            .insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Aggregate stats for every registered breaker.
    pub fn stats(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    /// Forces every breaker CLOSED and clears counters.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

// COMPREHENSIVE TEST SUITE - ALWAYS AT THE BOTTOM OF EVERY FILE
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_millis(reset_ms),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute::<(), _, _, _>(|| async { Err::<(), _>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker
            .execute::<_, &str, _, _>(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", config(60_000));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Calls in OPEN are rejected without running the operation.
        let ran = AtomicU32::new(0);
        let result = breaker
            .execute::<(), &str, _, _>(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().total_rejected, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_counter_in_closed() {
        let breaker = CircuitBreaker::new("test", config(60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.stats().consecutive_failures, 0);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_half_open_closed_cycle() {
        let breaker = CircuitBreaker::new("test", config(50));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // First call after the reset timeout probes in HALF_OPEN.
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(50));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", config(60_000));
        let result = breaker
            .execute::<(), &str, _, _>(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        let stats = breaker.stats();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn hooks_fire_on_transitions() {
        let breaker = Arc::new(CircuitBreaker::new("test", config(50)));
        let opened = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicU32::new(0));
        let half = Arc::new(AtomicU32::new(0));

        let o = Arc::clone(&opened);
        breaker.on_open(move |event| {
            assert_eq!(event.name, "test");
            o.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&closed);
        breaker.on_close(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&half);
        breaker.on_half_open(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        succeed(&breaker).await;
        succeed(&breaker).await;

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(half.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_force_and_reset() {
        let breaker = CircuitBreaker::new("test", config(60_000));
        breaker.force_open();
        assert_eq!(breaker.stats().state, CircuitState::Open);
        breaker.force_close();
        assert_eq!(breaker.stats().state, CircuitState::Closed);

        fail(&breaker).await;
        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_returns_same_instance_and_resets_all() {
        let registry = BreakerRegistry::new(config(60_000));
        let a = registry.get_or_create("dns");
        let b = registry.get_or_create("dns");
        assert!(Arc::ptr_eq(&a, &b));

        for _ in 0..3 {
            fail(&a).await;
        }
        assert_eq!(a.stats().state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(a.stats().state, CircuitState::Closed);
        assert_eq!(registry.stats().len(), 1);
    }

    #[tokio::test]
    async fn classified_execute_ignores_permanent_failures() {
        use common::error::{ClassifyError, ErrorClass};

        #[derive(Debug)]
        struct PermanentError;
        impl std::fmt::Display for PermanentError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "permanent")
            }
        }
        impl ClassifyError for PermanentError {
            fn class(&self) -> ErrorClass {
                ErrorClass::Permanent
            }
        }

        let breaker = CircuitBreaker::new("test", config(60_000));
        for _ in 0..5 {
            let _ = breaker
                .execute_classified::<(), _, _, _>(|| async { Err(PermanentError) })
                .await;
        }
        // Permanent errors never trip the breaker.
        assert_eq!(breaker.stats().state, CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }
}
