//! Job admission and lifecycle endpoints
//!
//! `POST /api/jobs` admits a job into the queue, `GET /api/jobs/{id}` polls
//! it, `DELETE /api/jobs/{id}` requests cancellation and `GET /api/jobs/stats`
//! reports per-state queue counts.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Json, Router,
};
use tracing::info;
use validator::Validate;

use crate::models::{
    AppState, CancelResponse, JobStatusResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::pipelines::OperationSpec;
use crate::queue::{Job, NewJob, QueueStats, DEFAULT_PRIORITY};
use crate::types::{AppError, AppResult, JobState, Modality};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/stats", get(queue_stats))
        .route("/api/jobs/{id}", get(job_status).delete(cancel_job))
        .with_state(state)
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, ResponseJson<SubmitJobResponse>), AppError> {
    info!(
        modality = %request.modality,
        operation = %request.operation,
        "job submission received"
    );

    request
        .validate()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    let modality: Modality = request.modality.parse()?;
    // Shape-level checks only. Input counts are the pipeline's call, so a
    // fusion report with no source imagery is still admitted here.
    OperationSpec::parse(modality, &request.operation, &request.parameters)?;

    let job = Job::new(NewJob {
        id: request.id,
        owner_id: request.owner_id.unwrap_or_else(|| "anonymous".to_string()),
        modality,
        operation: request.operation,
        source_ref: request.source_ref,
        parameters: request.parameters,
        priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
    });
    let job_id = state.store.enqueue(job).await?;

    let stats = state.store.stats().await;
    let estimated_time_ms = estimate_time_ms(modality, &stats, state.config.worker.concurrency);
    info!(job_id = %job_id, estimated_time_ms, "job admitted");

    Ok((
        StatusCode::ACCEPTED,
        ResponseJson(SubmitJobResponse {
            status_url: format!("/api/jobs/{}", job_id),
            job_id,
            status: JobState::Queued,
            estimated_time_ms,
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ResponseJson<JobStatusResponse>> {
    let job = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {}", id)))?;
    Ok(ResponseJson(JobStatusResponse::from(&job)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ResponseJson<CancelResponse>> {
    let job = state.store.cancel(&id).await?;
    info!(job_id = %job.id, "job cancelled");
    Ok(ResponseJson(CancelResponse {
        id: job.id,
        state: job.state,
    }))
}

async fn queue_stats(State(state): State<AppState>) -> ResponseJson<QueueStats> {
    ResponseJson(state.store.stats().await)
}

/// Typical duration for the modality multiplied by how many backlog rounds
/// precede the job through the worker pool. Called after enqueue, so the
/// job itself counts toward the backlog and the estimate is never zero.
fn estimate_time_ms(modality: Modality, stats: &QueueStats, concurrency: usize) -> u64 {
    let backlog = (stats.waiting + stats.delayed + stats.active) as u64;
    let lanes = concurrency.max(1) as u64;
    modality.typical_duration_ms() * backlog.div_ceil(lanes).max(1)
}
