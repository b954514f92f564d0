//! Priority job queue
//!
//! The store tracks every job through
//! `pending -> queued -> active -> {completed | failed | cancelled}`, hands
//! jobs to workers through atomic claims, and re-queues transient failures
//! with capped exponential backoff. The reaper task sweeps for stalled
//! workers and expired terminal jobs.

pub mod backoff;
pub mod job;
pub mod reaper;
pub mod store;

pub use backoff::RetryPolicy;
pub use job::{Job, JobId, NewJob, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
pub use store::{FailureKind, JobLease, JobStore, QueueStats, StallSweep, StoreError};
