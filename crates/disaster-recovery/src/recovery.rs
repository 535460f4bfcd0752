//! Recovery plans
//!
//! An ordered list of steps, each with a timeout, an optional rollback and
//! a criticality flag. Steps run sequentially; a failing critical step
//! stops the plan, failing non-critical steps are recorded and execution
//! continues. With rollback enabled, completed steps' rollback handlers
//! run in reverse order, best-effort.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{error, info, warn};

type StepFn = Box<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// One recovery step.
pub struct RecoveryStep {
    pub name: String,
    pub action: StepFn,
    pub rollback: Option<StepFn>,
    pub timeout: Duration,
    pub critical: bool,
}

impl RecoveryStep {
    pub fn new(
        name: impl Into<String>,
        action: impl Fn() -> BoxFuture<'static, std::result::Result<(), String>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            rollback: None,
            timeout: Duration::from_secs(60),
            critical: true,
        }
    }

    pub fn with_rollback(
        mut self,
        rollback: impl Fn() -> BoxFuture<'static, std::result::Result<(), String>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Per-step outcome.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub timed_out: bool,
    pub rolled_back: bool,
}

/// Whole-plan outcome.
#[derive(Debug, Clone)]
pub struct PlanReport {
    pub success: bool,
    pub duration: Duration,
    pub steps: Vec<StepReport>,
    /// Whether the plan finished within its recovery-time objective.
    pub rto_met: bool,
}

/// Ordered recovery plan with an RTO target.
pub struct RecoveryPlan {
    name: String,
    steps: Vec<RecoveryStep>,
    rto: Duration,
}

impl RecoveryPlan {
    pub fn new(name: impl Into<String>, rto: Duration) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            rto,
        }
    }

    pub fn add_step(mut self, step: RecoveryStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Runs the plan. With `rollback_on_failure`, a stop caused by a
    /// critical step triggers reverse-order rollback of completed steps;
    /// rollback errors are swallowed (best-effort by design of the plan,
    /// logged for the operator).
    pub async fn execute(&self, rollback_on_failure: bool) -> PlanReport {
        let started = Instant::now();
        info!(plan = %self.name, steps = self.steps.len(), "executing recovery plan");

        let mut reports: Vec<StepReport> = Vec::with_capacity(self.steps.len());
        let mut completed: Vec<usize> = Vec::new();
        let mut aborted = false;

        for (index, step) in self.steps.iter().enumerate() {
            let step_start = Instant::now();
            let outcome = tokio::time::timeout(step.timeout, (step.action)()).await;
            let duration = step_start.elapsed();

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some((err, false)),
                Err(_) => Some((
                    format!("step timed out after {} ms", step.timeout.as_millis()),
                    true,
                )),
            };

            match failure {
                None => {
                    info!(plan = %self.name, step = %step.name, "step complete");
                    completed.push(index);
                    reports.push(StepReport {
                        name: step.name.clone(),
                        success: true,
                        error: None,
                        duration,
                        timed_out: false,
                        rolled_back: false,
                    });
                }
                Some((message, timed_out)) => {
                    reports.push(StepReport {
                        name: step.name.clone(),
                        success: false,
                        error: Some(message.clone()),
                        duration,
                        timed_out,
                        rolled_back: false,
                    });

                    if step.critical {
                        error!(plan = %self.name, step = %step.name, %message, "critical step failed, stopping plan");
                        aborted = true;
                        break;
                    }
                    warn!(plan = %self.name, step = %step.name, %message, "non-critical step failed, continuing");
                }
            }
        }

        if aborted && rollback_on_failure {
            for &index in completed.iter().rev() {
                let step = &self.steps[index];
                let Some(rollback) = &step.rollback else { continue };
                match rollback().await {
                    Ok(()) => {
                        info!(plan = %self.name, step = %step.name, "rolled back");
                        if let Some(report) = reports.get_mut(index) {
                            report.rolled_back = true;
                        }
                    }
                    Err(err) => {
                        warn!(plan = %self.name, step = %step.name, %err, "rollback failed");
                    }
                }
            }
        }

        let duration = started.elapsed();
        let rto_met = duration <= self.rto;
        let success = !aborted;
        info!(
            plan = %self.name,
            success,
            rto_met,
            duration_ms = duration.as_millis() as u64,
            "recovery plan finished"
        );
        PlanReport {
            success,
            duration,
            steps: reports,
            rto_met,
        }
    }
}
