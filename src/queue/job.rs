//! Job record and lifecycle transitions
//!
//! A job moves `pending -> queued -> active -> {completed | failed |
//! cancelled}`; `active -> queued` happens only through retry backoff or
//! stall recovery. The transition methods here mutate the record; the Job
//! Store is the only caller and serializes them per job id.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::types::{JobState, Modality};

pub type JobId = String;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Admission-side description of a job. `id` is generated when the caller
/// does not supply one; internal callers may pin ids (and get `DUPLICATE_JOB`
/// back on reuse).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub owner_id: String,
    pub modality: Modality,
    pub operation: String,
    pub source_ref: String,
    pub parameters: serde_json::Map<String, Value>,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub modality: Modality,
    pub operation: String,
    /// Opaque blob reference(s), comma-joined when an operation takes several
    /// inputs (radar scene pairs, fusion stacks).
    pub source_ref: String,
    /// Operation options, forwarded verbatim to the compute service.
    pub parameters: serde_json::Map<String, Value>,
    pub priority: u8,
    pub state: JobState,
    /// 0-100, meaningful only while active; resets on every retry attempt.
    pub progress: u8,
    /// Retry counter, 0 on the first execution.
    pub attempt: u32,
    /// Stall-recovery counter, tracked separately from failure retries.
    pub stalls: u32,
    pub result: Option<Value>,
    /// Most recent failure; survives a retry so the last reason is retained
    /// if the ceiling is reached. Exposed to callers only in `failed`.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest instant a re-queued job may be claimed again.
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
    /// Last progress write; drives stall detection.
    pub(crate) last_progress_at: Option<DateTime<Utc>>,
    /// Sequence number of the current ready-queue entry; a mismatch marks a
    /// heap entry as stale.
    pub(crate) ready_seq: u64,
}

impl Job {
    pub fn new(spec: NewJob) -> Self {
        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: spec.owner_id,
            modality: spec.modality,
            operation: spec.operation,
            source_ref: spec.source_ref,
            parameters: spec.parameters,
            priority: spec.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            state: JobState::Pending,
            progress: 0,
            attempt: 0,
            stalls: 0,
            result: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
            last_progress_at: None,
            ready_seq: 0,
        }
    }

    /// Split the comma-joined `source_ref` into individual references.
    pub fn source_refs(&self) -> Vec<&str> {
        self.source_ref
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Ready to be claimed: queued and past any backoff delay.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.next_attempt_at.map_or(true, |due| due <= now)
    }

    /// pending -> queued; the job becomes visible to the dispatcher.
    pub(crate) fn make_visible(&mut self, seq: u64) {
        self.state = JobState::Queued;
        self.ready_seq = seq;
    }

    /// queued -> active. Progress resets at the start of every attempt;
    /// `started_at` records the first activation only.
    pub(crate) fn activate(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.progress = 0;
        self.started_at.get_or_insert(now);
        self.last_progress_at = Some(now);
        self.next_attempt_at = None;
    }

    /// Monotonic progress write; ignored unless active.
    pub(crate) fn record_progress(&mut self, percent: u8, now: DateTime<Utc>) {
        if self.state != JobState::Active {
            return;
        }
        self.progress = percent.min(100).max(self.progress);
        self.last_progress_at = Some(now);
    }

    /// active -> completed.
    pub(crate) fn complete_with(&mut self, result: Value, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.finished_at = Some(now);
    }

    /// active -> failed, terminal.
    pub(crate) fn fail_terminal(&mut self, reason: &str, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.failure_reason = Some(reason.to_string());
        self.finished_at = Some(now);
    }

    /// active -> queued with a backoff delay; consumes one retry.
    pub(crate) fn requeue_for_retry(&mut self, reason: &str, delay: Duration, now: DateTime<Utc>) {
        self.attempt += 1;
        self.state = JobState::Queued;
        self.progress = 0;
        self.failure_reason = Some(reason.to_string());
        self.next_attempt_at =
            Some(now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero()));
    }

    /// active -> queued after a presumed-dead worker; immediate re-queue, no
    /// backoff, counted against the stall ceiling.
    pub(crate) fn recover_from_stall(&mut self, now: DateTime<Utc>) {
        let stalled_at = self.progress;
        self.attempt += 1;
        self.stalls += 1;
        self.state = JobState::Queued;
        self.progress = 0;
        self.failure_reason = Some(format!("stalled at {}% with no progress updates", stalled_at));
        self.next_attempt_at = None;
        self.last_progress_at = Some(now);
    }

    /// Any non-terminal state -> cancelled.
    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.finished_at = Some(now);
    }
}
