use std::sync::Arc;

use crate::config::Config;
use crate::queue::{Job, JobStore};
use crate::types::{JobState, Modality};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub config: Config,
}

/// Admission request for a new analysis job.
#[derive(Debug, Clone, serde::Deserialize, validator::Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Client-pinned job id; omitted means the server mints a UUID. Reusing
    /// an id that is still stored is rejected with `DUPLICATE_JOB`.
    #[serde(default)]
    pub id: Option<String>,
    pub modality: String,
    pub operation: String,
    /// Opaque blob reference(s), comma-joined when the operation takes
    /// several inputs (radar pairs, fusion stacks).
    #[serde(default)]
    pub source_ref: String,
    /// Operation options, forwarded to the compute service uninterpreted.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[validate(range(min = 1, max = 10, message = "priority must be between 1 and 10"))]
    pub priority: Option<u8>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Receipt returned by `POST /api/jobs` on admission.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobState,
    pub status_url: String,
    /// Per-modality typical duration scaled by the backlog ahead of this job.
    pub estimated_time_ms: u64,
}

/// Poll view of a job. `result` appears only once completed, `failureReason`
/// only once failed; while active, `progress` and `attempt` tell the story.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: String,
    pub modality: Modality,
    pub operation: String,
    pub state: JobState,
    pub progress: u8,
    pub priority: u8,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            modality: job.modality,
            operation: job.operation.clone(),
            state: job.state,
            progress: job.progress,
            priority: job.priority,
            attempt: job.attempt,
            // A retried job keeps the previous attempt's reason internally;
            // on the wire it only shows once the job is terminally failed.
            result: (job.state == JobState::Completed)
                .then(|| job.result.clone())
                .flatten(),
            failure_reason: (job.state == JobState::Failed)
                .then(|| job.failure_reason.clone())
                .flatten(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub id: String,
    pub state: JobState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub queue: crate::queue::QueueStats,
}
