//! Job Store
//!
//! In-process, priority-ordered holding area for jobs and the single source
//! of truth for their state. All state-mutating operations go through one
//! lock, which is what makes `claim_next` an atomic claim: no two workers can
//! hold the same job.
//!
//! Scheduling order is `(priority desc, enqueue order asc)`. Re-queued jobs
//! re-enter at the tail of their priority tier, optionally delayed by the
//! retry backoff. Terminal reports are guarded by a lease (job id + attempt
//! epoch) so a worker that was presumed dead and stall-recovered cannot
//! clobber the re-queued job with a late `complete` or `fail`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::backoff::RetryPolicy;
use crate::queue::job::{Job, JobId};
use crate::types::JobState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    Duplicate(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} cannot be cancelled: already {1}")]
    CannotCancel(JobId, JobState),

    /// The job moved on while the worker held its lease (cancelled, stall
    /// recovered, or re-claimed by another worker). The late report is
    /// dropped.
    #[error("stale lease for job {0} at attempt {1}")]
    StaleLease(JobId, u32),

    #[error("{0} is not a terminal state")]
    NotTerminal(JobState),
}

/// Whether a failure may consume a retry or ends the job outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Fatal,
    Transient,
}

/// A worker's claim on an active job. The attempt value is the lease epoch:
/// terminal reports are only accepted while it matches the stored job.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job: Job,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Per-state counts for dashboards and the metrics endpoint. `waiting` is
/// queued-and-due; `delayed` is queued behind a backoff timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub cancelled: usize,
}

/// Outcome of one stall sweep.
#[derive(Debug, Clone, Default)]
pub struct StallSweep {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

/// `now - age`, saturating at the datetime minimum so an oversized window
/// simply matches nothing.
fn horizon(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    /// Every queued job has exactly one live entry here; entries whose seq no
    /// longer matches the job are stale and dropped on pop.
    ready: BinaryHeap<ReadyEntry>,
    /// Cancellation token per active job; firing it asks the executing
    /// pipeline to stop at the next stage boundary.
    tokens: HashMap<JobId, CancellationToken>,
    seq: u64,
}

pub struct JobStore {
    inner: Mutex<StoreInner>,
    notify: Notify,
    policy: RetryPolicy,
}

impl JobStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Admit a job. Rejects an already-known id with `Duplicate`; otherwise
    /// the job becomes visible to the dispatcher in `queued` state.
    pub async fn enqueue(&self, mut job: Job) -> Result<JobId, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        inner.seq += 1;
        let seq = inner.seq;
        job.make_visible(seq);
        let entry = ReadyEntry {
            priority: job.priority,
            seq,
            id: job.id.clone(),
        };
        let id = job.id.clone();
        inner.jobs.insert(id.clone(), job);
        inner.ready.push(entry);
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.lock().await.jobs.get(id).cloned()
    }

    /// True when at least one queued job is past its backoff delay.
    pub async fn has_ready(&self) -> bool {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        inner.jobs.values().any(|j| j.is_due(now))
    }

    /// Parks the caller until `enqueue` or a retry re-queue signals new work.
    /// Callers still poll on an interval; the notify is a fast path, not a
    /// completeness guarantee for delayed jobs.
    pub async fn wait_ready(&self) {
        self.notify.notified().await;
    }

    /// Atomically claim the highest-priority due job, activating it and
    /// minting a cancellation token. Returns `None` when nothing is due.
    pub async fn claim_next(&self) -> Option<JobLease> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut deferred: Vec<ReadyEntry> = Vec::new();
        let mut claimed: Option<ReadyEntry> = None;

        while let Some(entry) = inner.ready.pop() {
            let current = match inner.jobs.get(&entry.id) {
                Some(job) if job.state == JobState::Queued && job.ready_seq == entry.seq => job,
                // Stale entry: cancelled, already re-queued under a new seq,
                // or reaped. Drop it.
                _ => continue,
            };
            if !current.is_due(now) {
                deferred.push(entry);
                continue;
            }
            claimed = Some(entry);
            break;
        }
        for entry in deferred {
            inner.ready.push(entry);
        }

        let entry = claimed?;
        let job = inner.jobs.get_mut(&entry.id)?;
        job.activate(now);
        let lease = JobLease {
            attempt: job.attempt,
            job: job.clone(),
            cancel: CancellationToken::new(),
        };
        inner.tokens.insert(entry.id, lease.cancel.clone());
        Some(lease)
    }

    /// Progress write from the executing pipeline; a no-op unless the job is
    /// still active under the reporting attempt.
    pub async fn update_progress(
        &self,
        id: &str,
        attempt: u32,
        percent: u8,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if job.attempt == attempt {
            job.record_progress(percent, Utc::now());
        }
        Ok(())
    }

    /// active -> completed, guarded by the lease epoch.
    pub async fn complete(&self, lease: &JobLease, result: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&lease.job.id)
            .ok_or_else(|| StoreError::NotFound(lease.job.id.clone()))?;
        if job.state != JobState::Active || job.attempt != lease.attempt {
            return Err(StoreError::StaleLease(lease.job.id.clone(), lease.attempt));
        }
        job.complete_with(result, Utc::now());
        inner.tokens.remove(&lease.job.id);
        Ok(())
    }

    /// Report a failed execution. Transient failures re-queue with backoff
    /// until the attempt ceiling; fatal failures (and exhausted retries) end
    /// the job with the reason retained. Returns the state the job landed in.
    pub async fn fail(
        &self,
        lease: &JobLease,
        reason: &str,
        kind: FailureKind,
    ) -> Result<JobState, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let next_seq = inner.seq + 1;

        let requeue_entry = {
            let job = inner
                .jobs
                .get_mut(&lease.job.id)
                .ok_or_else(|| StoreError::NotFound(lease.job.id.clone()))?;
            if job.state != JobState::Active || job.attempt != lease.attempt {
                return Err(StoreError::StaleLease(lease.job.id.clone(), lease.attempt));
            }
            if kind == FailureKind::Transient && self.policy.can_retry(job.attempt) {
                let delay = self.policy.next_delay(job.attempt + 1);
                job.requeue_for_retry(reason, delay, now);
                job.ready_seq = next_seq;
                Some(ReadyEntry {
                    priority: job.priority,
                    seq: next_seq,
                    id: job.id.clone(),
                })
            } else {
                job.fail_terminal(reason, now);
                None
            }
        };

        inner.tokens.remove(&lease.job.id);
        let landed = match requeue_entry {
            Some(entry) => {
                inner.seq = next_seq;
                inner.ready.push(entry);
                drop(inner);
                self.notify.notify_one();
                JobState::Queued
            }
            None => JobState::Failed,
        };
        Ok(landed)
    }

    /// Cancel a job in any non-terminal state. Queued jobs die immediately;
    /// active jobs are marked cancelled and their token is fired so the
    /// pipeline stops at the next stage boundary.
    pub async fn cancel(&self, id: &str) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if job.is_terminal() {
            return Err(StoreError::CannotCancel(id.to_string(), job.state));
        }
        job.cancel(Utc::now());
        let snapshot = job.clone();
        if let Some(token) = inner.tokens.remove(id) {
            token.cancel();
        }
        Ok(snapshot)
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => stats.waiting += 1,
                JobState::Queued => {
                    if job.is_due(now) {
                        stats.waiting += 1;
                    } else {
                        stats.delayed += 1;
                    }
                }
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Remove terminal jobs of the given state that finished more than
    /// `older_than` ago, oldest first, at most `limit` of them.
    pub async fn reap(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<usize, StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::NotTerminal(state));
        }
        let mut inner = self.inner.lock().await;
        let cutoff = horizon(Utc::now(), older_than);

        let mut expired: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .filter_map(|j| {
                j.finished_at
                    .filter(|t| *t < cutoff)
                    .map(|t| (t, j.id.clone()))
            })
            .collect();
        expired.sort_by_key(|(finished, _)| *finished);
        expired.truncate(limit);

        for (_, id) in &expired {
            inner.jobs.remove(id);
            inner.tokens.remove(id);
        }
        Ok(expired.len())
    }

    /// Return active jobs with no progress update for `stall_after` to the
    /// queue (attempt incremented, no backoff delay), or fail them once the
    /// stall or retry ceiling is hit. The old worker's token is fired and its
    /// lease epoch invalidated either way.
    pub async fn recover_stalled(&self, stall_after: Duration) -> StallSweep {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let cutoff = horizon(now, stall_after);

        let stalled: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .filter(|j| {
                j.last_progress_at
                    .or(j.started_at)
                    .map_or(false, |t| t < cutoff)
            })
            .map(|j| j.id.clone())
            .collect();

        let mut sweep = StallSweep::default();
        for id in stalled {
            inner.seq += 1;
            let seq = inner.seq;
            let requeue_entry = {
                let Some(job) = inner.jobs.get_mut(&id) else {
                    continue;
                };
                if job.stalls < self.policy.max_stalled && self.policy.can_retry(job.attempt) {
                    job.recover_from_stall(now);
                    job.ready_seq = seq;
                    Some(ReadyEntry {
                        priority: job.priority,
                        seq,
                        id: id.clone(),
                    })
                } else {
                    job.fail_terminal("stalled beyond the stall-retry ceiling", now);
                    None
                }
            };
            if let Some(token) = inner.tokens.remove(&id) {
                token.cancel();
            }
            match requeue_entry {
                Some(entry) => {
                    inner.ready.push(entry);
                    debug!(job_id = %id, "stalled job returned to queue");
                    sweep.requeued.push(id);
                }
                None => sweep.failed.push(id),
            }
        }

        if !sweep.requeued.is_empty() {
            self.notify.notify_one();
        }
        sweep
    }
}
