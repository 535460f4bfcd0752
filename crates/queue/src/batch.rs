//! Batch processing
//!
//! `parallel_map` runs a fallible async function over a list with bounded
//! concurrency while preserving input order in the output. Three failure
//! policies: fail fast (default, in-flight work is cancelled), stop on
//! error (no new work starts, in-flight completes), and collect errors
//! (everything runs, errors are gathered). `BatchProcessor` layers chunking,
//! per-chunk progress and an inter-chunk delay on top.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, info};

/// Failure policy and concurrency for one `parallel_map` call.
#[derive(Debug, Clone)]
pub struct ParallelMapOptions {
    pub concurrency: usize,
    /// Gather every item's error instead of failing fast.
    pub collect_errors: bool,
    /// Stop launching new items after the first error but let in-flight
    /// items finish.
    pub stop_on_error: bool,
}

impl Default for ParallelMapOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            collect_errors: false,
            stop_on_error: false,
        }
    }
}

/// Failure of a `parallel_map` call.
#[derive(Debug, Error)]
pub enum ParallelMapError<E> {
    #[error("item {index} failed: {error}")]
    Failed { index: usize, error: E },
    #[error("{} items failed", errors.len())]
    Collected { errors: Vec<(usize, E)> },
}

/// Runs every item to completion with bounded concurrency, returning each
/// item's outcome in input order.
pub async fn try_parallel_map<T, U, E, F, Fut>(
    items: Vec<T>,
    f: F,
    concurrency: usize,
) -> Vec<Result<U, E>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    let total = items.len();
    let concurrency = concurrency.max(1);
    let mut slots: Vec<Option<Result<U, E>>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    let mut input = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    loop {
        while in_flight.len() < concurrency {
            match input.next() {
                Some((index, item)) => {
                    let fut = f(item);
                    in_flight.push(async move { (index, fut.await) });
                }
                None => break,
            }
        }
        match in_flight.next().await {
            Some((index, outcome)) => slots[index] = Some(outcome),
            None => break,
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.expect("every item completed"))
        .collect()
}

/// Runs `f` over `items` with at most `concurrency` in flight; the output
/// preserves input order. The failure policy comes from `options`.
pub async fn parallel_map<T, U, E, F, Fut>(
    items: Vec<T>,
    f: F,
    options: ParallelMapOptions,
) -> Result<Vec<U>, ParallelMapError<E>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    if options.collect_errors {
        let outcomes = try_parallel_map(items, f, options.concurrency).await;
        let mut values = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(error) => errors.push((index, error)),
            }
        }
        return if errors.is_empty() {
            Ok(values)
        } else {
            Err(ParallelMapError::Collected { errors })
        };
    }

    let total = items.len();
    let concurrency = options.concurrency.max(1);
    let mut results: Vec<Option<U>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut first_error: Option<(usize, E)> = None;
    let mut halted = false;
    let mut input = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < concurrency && !halted {
            match input.next() {
                Some((index, item)) => {
                    let fut = f(item);
                    in_flight.push(async move { (index, fut.await) });
                }
                None => break,
            }
        }

        match in_flight.next().await {
            Some((index, Ok(value))) => {
                results[index] = Some(value);
            }
            Some((index, Err(error))) => {
                if options.stop_on_error {
                    // Stop feeding; drain what is already running.
                    halted = true;
                    if first_error.is_none() {
                        first_error = Some((index, error));
                    }
                } else {
                    // Fail fast: dropping the set cancels in-flight work.
                    return Err(ParallelMapError::Failed { index, error });
                }
            }
            None => break,
        }
    }

    if let Some((index, error)) = first_error {
        return Err(ParallelMapError::Failed { index, error });
    }
    Ok(results
        .into_iter()
        .map(|slot| slot.expect("missing result"))
        .collect())
}

/// Chunked batch configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub concurrency: usize,
    /// Pause between chunks, for rate-limited downstreams.
    pub inter_chunk_delay: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            concurrency: 8,
            inter_chunk_delay: None,
        }
    }
}

/// Emitted after each chunk completes.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub items_processed: usize,
    pub total_items: usize,
    pub errors_so_far: usize,
}

/// Final report of a batch run.
#[derive(Debug)]
pub struct BatchResult<U, E> {
    /// Successful outputs as (input index, value), in input order.
    pub outputs: Vec<(usize, U)>,
    /// Per-item failures as (input index, error), in input order.
    pub errors: Vec<(usize, E)>,
    pub duration: Duration,
}

impl<U, E> BatchResult<U, E> {
    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Chunked parallel executor with progress reporting.
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Processes `items` chunk by chunk. Every item runs; per-item errors
    /// are reported in the result rather than aborting the batch.
    pub async fn process<T, U, E, F, Fut>(
        &self,
        items: Vec<T>,
        f: F,
        mut on_progress: Option<&mut dyn FnMut(BatchProgress)>,
    ) -> BatchResult<U, E>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        let started = Instant::now();
        let total_items = items.len();
        let chunk_size = self.config.chunk_size.max(1);
        let total_chunks = total_items.div_ceil(chunk_size);

        let mut outputs: Vec<(usize, U)> = Vec::new();
        let mut errors: Vec<(usize, E)> = Vec::new();
        let mut items = items.into_iter();
        let mut processed = 0usize;

        for chunk_index in 0..total_chunks {
            let chunk: Vec<T> = (&mut items).take(chunk_size).collect();
            let chunk_len = chunk.len();
            let base_index = processed;

            let outcomes = try_parallel_map(chunk, &f, self.config.concurrency).await;
            for (offset, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    Ok(value) => outputs.push((base_index + offset, value)),
                    Err(error) => errors.push((base_index + offset, error)),
                }
            }

            processed += chunk_len;
            if let Some(callback) = on_progress.as_deref_mut() {
                callback(BatchProgress {
                    chunk_index,
                    total_chunks,
                    items_processed: processed,
                    total_items,
                    errors_so_far: errors.len(),
                });
            }
            debug!(chunk_index, processed, total_items, "batch chunk complete");

            if let Some(delay) = self.config.inter_chunk_delay {
                if chunk_index + 1 < total_chunks {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let duration = started.elapsed();
        info!(
            total_items,
            failures = errors.len(),
            duration_ms = duration.as_millis() as u64,
            "batch run finished"
        );
        BatchResult {
            outputs,
            errors,
            duration,
        }
    }
}
