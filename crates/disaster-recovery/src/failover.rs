//! Failover manager
//!
//! Watches the primary endpoint with a supplied health check. Sustained
//! failures first mark the primary as failing; the next failure triggers
//! the switchover and flips the active endpoint to the secondary.
//! Failback requires a healthy primary and is refused otherwise. Every
//! transition is retained in the history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DrError, Result};

/// Probes one endpoint; implementations live with the host service.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, endpoint: &str) -> bool;
}

/// Invoked when traffic switches between endpoints.
#[async_trait]
pub trait SwitchoverHandler: Send + Sync {
    async fn switchover(&self, from: &str, to: &str) -> std::result::Result<(), String>;
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub check_interval: Duration,
    /// Consecutive failures that mark the primary as failing; the next
    /// failure after that triggers the failover.
    pub failover_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failover_threshold: 3,
        }
    }
}

/// Observable monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverState {
    Healthy,
    PrimaryFailing,
    FailedOver,
}

/// One retained transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

struct MonitorState {
    state: FailoverState,
    active: String,
    consecutive_failures: u32,
    history: Vec<FailoverEvent>,
}

/// Primary/secondary failover controller.
pub struct FailoverManager {
    config: FailoverConfig,
    primary: String,
    secondary: String,
    health: Arc<dyn HealthCheck>,
    switchover: Arc<dyn SwitchoverHandler>,
    state: Mutex<MonitorState>,
    running: Arc<AtomicBool>,
}

impl FailoverManager {
    pub fn new(
        primary: impl Into<String>,
        secondary: impl Into<String>,
        health: Arc<dyn HealthCheck>,
        switchover: Arc<dyn SwitchoverHandler>,
        config: FailoverConfig,
    ) -> Self {
        let primary = primary.into();
        Self {
            config,
            primary: primary.clone(),
            secondary: secondary.into(),
            health,
            switchover,
            state: Mutex::new(MonitorState {
                state: FailoverState::Healthy,
                active: primary,
                consecutive_failures: 0,
                history: Vec::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Endpoint traffic should currently go to.
    pub fn active_endpoint(&self) -> String {
        self.state.lock().active.clone()
    }

    pub fn state(&self) -> FailoverState {
        self.state.lock().state
    }

    pub fn history(&self) -> Vec<FailoverEvent> {
        self.state.lock().history.clone()
    }

    /// One health probe of the primary, advancing the state machine.
    pub async fn check_health(&self) -> Result<FailoverState> {
        let healthy = self.health.check(&self.primary).await;

        if healthy {
            let mut state = self.state.lock();
            state.consecutive_failures = 0;
            if state.state == FailoverState::PrimaryFailing {
                info!(primary = %self.primary, "primary recovered before failover");
                state.state = FailoverState::Healthy;
            }
            return Ok(state.state);
        }

        let should_fail_over = {
            let mut state = self.state.lock();
            if state.state == FailoverState::FailedOver {
                // Already on the secondary; nothing further to do.
                return Ok(state.state);
            }
            state.consecutive_failures += 1;
            warn!(
                primary = %self.primary,
                failures = state.consecutive_failures,
                "primary health check failed"
            );
            match state.state {
                FailoverState::Healthy
                    if state.consecutive_failures >= self.config.failover_threshold =>
                {
                    state.state = FailoverState::PrimaryFailing;
                    false
                }
                FailoverState::PrimaryFailing => true,
                _ => false,
            }
        };

        if should_fail_over {
            self.fail_over().await?;
        }
        Ok(self.state.lock().state)
    }

    async fn fail_over(&self) -> Result<()> {
        error!(primary = %self.primary, secondary = %self.secondary, "automatic failover");
        self.switchover
            .switchover(&self.primary, &self.secondary)
            .await
            .map_err(DrError::Switchover)?;

        let mut state = self.state.lock();
        state.state = FailoverState::FailedOver;
        state.active = self.secondary.clone();
        state.consecutive_failures = 0;
        state.history.push(FailoverEvent {
            from: self.primary.clone(),
            to: self.secondary.clone(),
            at: Utc::now(),
            reason: "primary health checks exhausted".to_string(),
        });
        Ok(())
    }

    /// Switches back to the primary; refused while it is still unhealthy.
    pub async fn failback(&self) -> Result<()> {
        if self.state.lock().state != FailoverState::FailedOver {
            return Ok(());
        }
        if !self.health.check(&self.primary).await {
            warn!(primary = %self.primary, "failback refused, primary unhealthy");
            return Err(DrError::PrimaryUnhealthy);
        }

        self.switchover
            .switchover(&self.secondary, &self.primary)
            .await
            .map_err(DrError::Switchover)?;

        let mut state = self.state.lock();
        state.state = FailoverState::Healthy;
        state.active = self.primary.clone();
        state.consecutive_failures = 0;
        state.history.push(FailoverEvent {
            from: self.secondary.clone(),
            to: self.primary.clone(),
            at: Utc::now(),
            reason: "manual failback".to_string(),
        });
        info!(primary = %self.primary, "failback complete");
        Ok(())
    }

    /// Starts periodic health checking; stops when [`stop`](Self::stop) is
    /// called or the manager is dropped.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::downgrade(self);
        let running = Arc::clone(&self.running);
        let interval = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                if let Err(err) = manager.check_health().await {
                    error!(%err, "health check cycle failed");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
