// Shared type definitions: modalities, job lifecycle states, API errors

use std::str::FromStr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::pipelines::params::ValidationError;
use crate::queue::store::StoreError;

/// Sensor data domain. Decides which pipeline handles a job and which
/// compute-service endpoints apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Lidar,
    Spectral,
    Radar,
    Thermal,
    Fusion,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Lidar => "lidar",
            Modality::Spectral => "spectral",
            Modality::Radar => "radar",
            Modality::Thermal => "thermal",
            Modality::Fusion => "fusion",
        }
    }

    pub const ALL: [Modality; 5] = [
        Modality::Lidar,
        Modality::Spectral,
        Modality::Radar,
        Modality::Thermal,
        Modality::Fusion,
    ];

    /// Default timeout for one compute-service call. Radar scene pairs are the
    /// slowest to process, thermal rasters the fastest.
    pub fn compute_timeout(&self) -> Duration {
        match self {
            Modality::Lidar => Duration::from_secs(90),
            Modality::Spectral => Duration::from_secs(60),
            Modality::Radar => Duration::from_secs(180),
            Modality::Thermal => Duration::from_secs(30),
            Modality::Fusion => Duration::from_secs(120),
        }
    }

    /// Typical wall-clock time for one job, used for admission-time estimates.
    pub fn typical_duration_ms(&self) -> u64 {
        match self {
            Modality::Lidar => 25_000,
            Modality::Spectral => 18_000,
            Modality::Radar => 45_000,
            Modality::Thermal => 8_000,
            Modality::Fusion => 30_000,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Modality {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lidar" => Ok(Modality::Lidar),
            "spectral" | "hyperspectral" => Ok(Modality::Spectral),
            "radar" | "sar" => Ok(Modality::Radar),
            "thermal" => Ok(Modality::Thermal),
            "fusion" => Ok(Modality::Fusion),
            other => Err(AppError::UnknownModality(other.to_string())),
        }
    }
}

/// Job lifecycle state.
///
/// `pending -> queued -> active -> {completed | failed | cancelled}`, with
/// `active -> queued` allowed only through retry backoff or stall recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job {0} cannot be cancelled: already {1}")]
    CannotCancel(String, JobState),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown modality: {0}")]
    UnknownModality(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error code exposed on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::DuplicateJob(_) => "DUPLICATE_JOB",
            AppError::CannotCancel(..) => "CANNOT_CANCEL",
            AppError::NotFound(_) => "JOB_NOT_FOUND",
            AppError::UnknownModality(_) => "UNKNOWN_MODALITY",
            AppError::Validation(e) => e.code(),
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::DuplicateJob(_) | AppError::CannotCancel(..) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnknownModality(_)
            | AppError::Validation(_)
            | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => AppError::DuplicateJob(id),
            StoreError::NotFound(id) => AppError::NotFound(format!("job {}", id)),
            StoreError::CannotCancel(id, state) => AppError::CannotCancel(id, state),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_aliases() {
        assert_eq!("lidar".parse::<Modality>().unwrap(), Modality::Lidar);
        assert_eq!("SAR".parse::<Modality>().unwrap(), Modality::Radar);
        assert_eq!(
            "hyperspectral".parse::<Modality>().unwrap(),
            Modality::Spectral
        );
        assert!("sonar".parse::<Modality>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let s = serde_json::to_string(&JobState::Completed).unwrap();
        assert_eq!(s, "\"completed\"");
    }
}
