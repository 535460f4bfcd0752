//! # MailWarden Queue
//!
//! The bounded priority queue that drives message scoring, plus the chunked
//! batch processor used for bulk work (rescoring, backfills). Jobs are
//! dequeued in `(priority rank, created_at)` order; failed jobs retry with a
//! fixed delay and land in the dead-letter list once the retry budget is
//! spent. Pending work survives restarts through serde round-trips.

pub mod batch;
pub mod job;
pub mod worker;

pub use batch::{
    parallel_map, try_parallel_map, BatchConfig, BatchProcessor, BatchProgress, BatchResult,
    ParallelMapError, ParallelMapOptions,
};
pub use job::{JobPriority, ProcessingJob};
pub use worker::{
    DeadLetterJob, JobOutcome, JobProcessor, QueueError, QueueStats, WorkerQueue,
    WorkerQueueConfig,
};
