/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Resilience wrapper for DNS
//!
//! Every external DNS call runs under a named circuit breaker with retry.
//! Permanent resolver errors pass through without tripping the breaker;
//! exhausted retries and open-circuit rejections surface as transient
//! failures so the authentication layer reports `temperror`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use dns::{DnsError, DnsResolver, MxRecord};
use resilience::{retry, BreakerError, CircuitBreaker, RetryError, RetryOptions, RetryPolicy};

/// Breaker + retry in front of any resolver backend.
pub struct ResilientResolver {
    inner: Arc<dyn DnsResolver>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl ResilientResolver {
    pub fn new(inner: Arc<dyn DnsResolver>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            breaker,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(50),
                max_delay: std::time::Duration::from_secs(2),
                jitter: true,
            },
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn call<T, F, Fut>(&self, domain: &str, operation: F) -> Result<T, DnsError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, DnsError>>,
    {
        let breaker = Arc::clone(&self.breaker);
        let outcome = retry(
            |_attempt| {
                let breaker = Arc::clone(&breaker);
                let fut = operation();
                async move { breaker.execute_classified(|| fut).await }
            },
            RetryOptions::with_policy(self.policy.clone()).should_retry(|err| match err {
                // An open circuit will not recover within one retry cycle.
                BreakerError::Open { .. } => false,
                BreakerError::Timeout { .. } => true,
                BreakerError::Inner(DnsError::Temporary { .. }) => true,
                BreakerError::Inner(_) => false,
            }),
        )
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::NotRetryable(BreakerError::Inner(err))) => Err(err),
            Err(RetryError::NotRetryable(BreakerError::Open { name, .. })) => Err(
                DnsError::temporary(domain, format!("resolver circuit '{name}' is open")),
            ),
            Err(RetryError::NotRetryable(BreakerError::Timeout { .. })) => {
                Err(DnsError::temporary(domain, "resolver call timed out"))
            }
            Err(RetryError::Exhausted { attempts, last_error }) => Err(DnsError::temporary(
                domain,
                format!("resolver failed after {attempts} attempts: {last_error}"),
            )),
            Err(RetryError::Cancelled { .. }) => {
                Err(DnsError::temporary(domain, "resolver call cancelled"))
            }
        }
    }
}

#[async_trait]
impl DnsResolver for ResilientResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        self.call(domain, || self.inner.resolve_txt(domain)).await
    }

    async fn resolve_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.call(domain, || self.inner.resolve_a(domain)).await
    }

    async fn resolve_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.call(domain, || self.inner.resolve_aaaa(domain)).await
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.call(domain, || self.inner.resolve_mx(domain)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns::MockResolver;
    use resilience::CircuitBreakerConfig;
    use std::time::Duration;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "dns",
            CircuitBreakerConfig {
                failure_threshold: 3,
                call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn passes_through_successful_lookups() {
        let mock = Arc::new(MockResolver::new());
        mock.add_txt("example.com", &["v=spf1 -all"]);
        let resolver = ResilientResolver::new(mock, breaker()).with_policy(fast_policy());

        let records = resolver.resolve_txt("example.com").await.unwrap();
        assert_eq!(records, vec!["v=spf1 -all".to_string()]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_reported() {
        let mock = Arc::new(MockResolver::new());
        mock.fail_domain("down.test", "SERVFAIL");
        let resolver = ResilientResolver::new(mock.clone(), breaker()).with_policy(fast_policy());

        let err = resolver.resolve_txt("down.test").await.unwrap_err();
        assert!(matches!(err, DnsError::Temporary { .. }));
        assert_eq!(mock.txt_queries(), 3);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_lookups() {
        let mock = Arc::new(MockResolver::new());
        mock.fail_domain("down.test", "SERVFAIL");
        let breaker = breaker();
        let resolver =
            ResilientResolver::new(mock.clone(), Arc::clone(&breaker)).with_policy(fast_policy());

        // One exhausted retry cycle records three breaker failures.
        let _ = resolver.resolve_txt("down.test").await;
        assert_eq!(breaker.stats().total_failures, 3);

        let queries_before = mock.txt_queries();
        let err = resolver.resolve_txt("down.test").await.unwrap_err();
        assert!(matches!(err, DnsError::Temporary { .. }));
        // The circuit rejected the call without reaching the backend.
        assert_eq!(mock.txt_queries(), queries_before);
    }
}
