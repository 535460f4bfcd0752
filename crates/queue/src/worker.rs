//! Priority worker queue
//!
//! A single bounded queue per worker instance. `process_all` pulls up to
//! `max_concurrent` jobs at a time in priority order; per-job failures
//! retry with a fixed delay, and jobs that exhaust the retry budget move to
//! the dead-letter list. A threat callback fires when a verdict's score
//! reaches the configured threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::ProcessingJob;

/// Queue limits and retry policy.
#[derive(Debug, Clone)]
pub struct WorkerQueueConfig {
    /// Maximum pending jobs; enqueue beyond this is a capacity error.
    pub max_depth: usize,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Scores at or above this trigger the threat callback.
    pub threat_score_threshold: f32,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            max_concurrent: 8,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            threat_score_threshold: 50.0,
        }
    }
}

/// What the processor reports back per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub threat_score: f32,
}

/// The scoring pipeline, as seen by the queue.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &ProcessingJob) -> Result<JobOutcome, String>;
}

/// Queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({depth}/{max_depth} jobs)")]
    Full { depth: usize, max_depth: usize },
    #[error("queue serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rolling statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub processed: u64,
    pub failed: u64,
    pub threats_detected: u64,
    pub average_processing_ms: f64,
    pub threat_rate: f64,
    pub depth: usize,
    pub dead_letter_depth: usize,
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub job: ProcessingJob,
    pub final_error: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedQueue {
    pending: Vec<ProcessingJob>,
    dead_letter: Vec<DeadLetterJob>,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    failed: u64,
    threats_detected: u64,
    total_processing_ms: u64,
}

type ThreatCallback = Box<dyn Fn(&ProcessingJob, &JobOutcome) + Send + Sync>;

/// Bounded priority queue with retries and a dead-letter list.
pub struct WorkerQueue<P: JobProcessor> {
    config: WorkerQueueConfig,
    processor: Arc<P>,
    pending: Mutex<Vec<ProcessingJob>>,
    processing: Mutex<Vec<ProcessingJob>>,
    dead_letter: Mutex<Vec<DeadLetterJob>>,
    counters: Mutex<Counters>,
    on_threat: Mutex<Option<ThreatCallback>>,
}

impl<P: JobProcessor> WorkerQueue<P> {
    pub fn new(processor: Arc<P>, config: WorkerQueueConfig) -> Self {
        Self {
            config,
            processor,
            pending: Mutex::new(Vec::new()),
            processing: Mutex::new(Vec::new()),
            dead_letter: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            on_threat: Mutex::new(None),
        }
    }

    /// Registers the callback fired when a verdict crosses the threshold.
    pub fn on_threat_detected(&self, callback: impl Fn(&ProcessingJob, &JobOutcome) + Send + Sync + 'static) {
        *self.on_threat.lock() = Some(Box::new(callback));
    }

    /// Inserts a job and re-sorts by (priority rank, created_at).
    pub fn enqueue(&self, job: ProcessingJob) -> Result<(), QueueError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.max_depth {
            warn!(depth = pending.len(), "worker queue is full");
            return Err(QueueError::Full {
                depth: pending.len(),
                max_depth: self.config.max_depth,
            });
        }
        pending.push(job);
        pending.sort_by_key(|j| j.order_key());
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drains the queue: repeatedly takes up to `max_concurrent` jobs in
    /// priority order and processes them in parallel until none remain.
    pub async fn process_all(&self) {
        loop {
            let batch: Vec<ProcessingJob> = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    break;
                }
                let take = self.config.max_concurrent.min(pending.len());
                let batch: Vec<_> = pending.drain(..take).collect();
                self.processing.lock().extend(batch.iter().cloned());
                batch
            };

            debug!(batch = batch.len(), "processing job batch");
            join_all(batch.into_iter().map(|job| self.process_one(job))).await;
        }
    }

    async fn process_one(&self, mut job: ProcessingJob) {
        let started = std::time::Instant::now();
        loop {
            match self.processor.process(&job).await {
                Ok(outcome) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let threat = outcome.threat_score >= self.config.threat_score_threshold;
                    {
                        let mut counters = self.counters.lock();
                        counters.processed += 1;
                        counters.total_processing_ms += elapsed_ms;
                        if threat {
                            counters.threats_detected += 1;
                        }
                    }
                    if threat {
                        info!(
                            job = %job.id,
                            score = outcome.threat_score,
                            "threat detected"
                        );
                        if let Some(callback) = self.on_threat.lock().as_ref() {
                            callback(&job, &outcome);
                        }
                    }
                    self.finish(&job.id);
                    return;
                }
                Err(error) => {
                    job.retry_count += 1;
                    job.last_error = Some(error.clone());
                    if job.retry_count > self.config.max_retries {
                        warn!(job = %job.id, error, "job moved to dead-letter queue");
                        self.counters.lock().failed += 1;
                        self.finish(&job.id);
                        self.dead_letter.lock().push(DeadLetterJob {
                            job,
                            final_error: error,
                        });
                        return;
                    }
                    debug!(job = %job.id, attempt = job.retry_count, error, "job retry");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn finish(&self, job_id: &str) {
        self.processing.lock().retain(|j| j.id != job_id);
    }

    pub fn dead_letter_jobs(&self) -> Vec<DeadLetterJob> {
        self.dead_letter.lock().clone()
    }

    /// Moves a dead-lettered job back to pending with a reset retry budget.
    pub fn requeue_dead_letter(&self, job_id: &str) -> bool {
        let mut dead = self.dead_letter.lock();
        let Some(index) = dead.iter().position(|d| d.job.id == job_id) else {
            return false;
        };
        let mut job = dead.remove(index).job;
        drop(dead);
        job.retry_count = 0;
        job.last_error = None;
        self.enqueue(job).is_ok()
    }

    pub fn stats(&self) -> QueueStats {
        let counters = self.counters.lock();
        let average_processing_ms = if counters.processed > 0 {
            counters.total_processing_ms as f64 / counters.processed as f64
        } else {
            0.0
        };
        let threat_rate = if counters.processed > 0 {
            counters.threats_detected as f64 / counters.processed as f64
        } else {
            0.0
        };
        QueueStats {
            processed: counters.processed,
            failed: counters.failed,
            threats_detected: counters.threats_detected,
            average_processing_ms,
            threat_rate,
            depth: self.pending.lock().len(),
            dead_letter_depth: self.dead_letter.lock().len(),
        }
    }

    /// Serializes pending, in-flight and dead-lettered jobs for restart.
    pub fn serialize(&self) -> Result<String, QueueError> {
        let mut pending = self.pending.lock().clone();
        // In-flight jobs rehydrate as pending.
        pending.extend(self.processing.lock().iter().cloned());
        pending.sort_by_key(|j| j.order_key());
        let persisted = PersistedQueue {
            pending,
            dead_letter: self.dead_letter.lock().clone(),
        };
        Ok(serde_json::to_string(&persisted)?)
    }

    /// Restores a previously serialized queue; existing contents are
    /// replaced.
    pub fn deserialize(&self, data: &str) -> Result<(), QueueError> {
        let persisted: PersistedQueue = serde_json::from_str(data)?;
        let mut pending = self.pending.lock();
        pending.clear();
        pending.extend(persisted.pending);
        pending.sort_by_key(|j| j.order_key());
        drop(pending);
        self.processing.lock().clear();
        *self.dead_letter.lock() = persisted.dead_letter;
        Ok(())
    }
}
