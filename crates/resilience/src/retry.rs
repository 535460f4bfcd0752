//! Retry with exponential backoff
//!
//! Delay for attempt `n` is `min(max_delay, base_delay * 2^(n-1))`, plus an
//! optional uniform jitter in `[0, 0.5 * delay)`. The default predicate
//! retries transient-looking failures (HTTP 429/5xx, socket and DNS error
//! phrases). A cancellation token aborts the backoff sleep immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use common::error::is_transient_failure;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before attempt `attempt + 1`
    /// (1-based attempt that just failed).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.max_delay)
    }
}

/// Per-call options; the predicate and hook see the typed error.
pub struct RetryOptions<E> {
    pub policy: RetryPolicy,
    /// Returns true when the error is worth another attempt. Defaults to
    /// the transient-failure heuristic over the error's Display form.
    pub should_retry: Option<Box<dyn Fn(&E) -> bool + Send + Sync>>,
    /// Invoked before each backoff sleep with (attempt, error, delay).
    pub on_retry: Option<Box<dyn Fn(u32, &E, Duration) + Send + Sync>>,
    pub cancel: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            should_retry: None,
            on_retry: None,
            cancel: None,
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn should_retry(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Box::new(predicate));
        self
    }

    pub fn on_retry(mut self, hook: impl Fn(u32, &E, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Terminal retry failures.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed; carries the attempt count and the last error.
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    /// The predicate declined to retry this error.
    #[error("operation failed with non-retryable error: {0}")]
    NotRetryable(E),
    /// The cancellation token fired during a backoff sleep.
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::NotRetryable(err) => Some(err),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Runs `operation` until it succeeds, the predicate declines, the attempt
/// budget is spent, or the token is cancelled.
pub async fn retry<T, E, F, Fut>(mut operation: F, options: RetryOptions<E>) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let policy = &options.policy;
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = match &options.should_retry {
                    Some(predicate) => predicate(&err),
                    None => is_transient_failure(&err.to_string()),
                };
                if !retryable {
                    debug!(attempt, error = %err, "error is not retryable");
                    return Err(RetryError::NotRetryable(err));
                }
                if attempt == max_attempts {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                let mut delay = policy.delay_for(attempt);
                if policy.jitter && !delay.is_zero() {
                    let extra = rand::thread_rng().gen_range(0.0..0.5);
                    delay += delay.mul_f64(extra);
                }
                if let Some(hook) = &options.on_retry {
                    hook(attempt, &err, delay);
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");

                match &options.cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                return Err(RetryError::Cancelled { attempts: attempt });
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
    unreachable!("loop returns on success or final failure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result = retry(
            move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection reset by peer")
                    } else {
                        Ok(42)
                    }
                }
            },
            RetryOptions::with_policy(fast_policy(5)),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_reports_count() {
        let result: Result<(), _> = retry(
            |_| async { Err::<(), _>("HTTP 503 unavailable") },
            RetryOptions::with_policy(fast_policy(3)),
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_predicate_rejects_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<(), _> = retry(
            move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("404 not found")
                }
            },
            RetryOptions::with_policy(fast_policy(5)),
        )
        .await;

        assert!(matches!(result, Err(RetryError::NotRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_wins() {
        let result: Result<(), _> = retry(
            |_| async { Err::<(), _>("weird domain-specific failure") },
            RetryOptions::with_policy(fast_policy(2)).should_retry(|_| true),
        )
        .await;
        assert!(matches!(result, Err(RetryError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(450));
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff_immediately() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        let started = std::time::Instant::now();
        let result: Result<(), _> = retry(
            |_| async { Err::<(), _>("timeout talking to upstream") },
            RetryOptions::with_policy(policy).cancel_with(token),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn on_retry_hook_sees_each_attempt() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in = Arc::clone(&seen);
        let _ = retry(
            |_| async { Err::<(), _>("connection reset") },
            RetryOptions::with_policy(fast_policy(3)).on_retry(move |attempt, _, _| {
                seen_in.fetch_add(attempt, Ordering::SeqCst);
            }),
        )
        .await;
        // Hook fires before sleeps: attempts 1 and 2.
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
