//! Compute service client
//!
//! The numerical heavy lifting (point cloud processing, spectral unmixing,
//! SAR interferometry, and the rest) runs in a separate compute service.
//! Jobs talk to it through `ComputeService`: one multipart POST per job
//! carrying the fetched input files plus the caller's parameters as an
//! opaque JSON `options` field, answered by a `{success, result, error}`
//! envelope.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::ComputeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("compute request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("compute io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compute returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The service answered cleanly but reported the analysis itself failed.
    #[error("compute processing failed: {0}")]
    Processing(String),

    #[error("unreadable compute response: {0}")]
    Decode(String),
}

impl ComputeError {
    /// Network trouble and server-side errors are worth another attempt;
    /// rejections and malformed answers are not.
    pub fn retryable(&self) -> bool {
        match self {
            ComputeError::Transport(_) | ComputeError::Io(_) => true,
            ComputeError::Status { status, .. } => *status >= 500 || *status == 429,
            ComputeError::Processing(_) | ComputeError::Decode(_) => false,
        }
    }
}

/// One input file for a compute call, read from the job workspace.
#[derive(Debug, Clone)]
pub struct ComputeInput {
    /// Multipart field name (`file`, `file_0`, ...).
    pub name: String,
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ComputeRequest {
    /// Endpoint path below the service base, e.g. `/lidar/process`.
    pub path: String,
    pub inputs: Vec<ComputeInput>,
    /// Caller parameters, forwarded verbatim.
    pub options: Value,
    pub timeout: Duration,
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn submit(&self, request: ComputeRequest) -> Result<Value, ComputeError>;
}

#[derive(Debug, Deserialize)]
struct ComputeEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ComputeClient {
    client: reqwest::Client,
    base_url: String,
}

impl ComputeClient {
    pub fn from_config(config: &ComputeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ComputeService for ComputeClient {
    async fn submit(&self, request: ComputeRequest) -> Result<Value, ComputeError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut form = Form::new();
        for input in &request.inputs {
            let bytes = tokio::fs::read(&input.path).await?;
            let mime = mime_guess::from_path(&input.path)
                .first_or_octet_stream()
                .to_string();
            let part = Part::bytes(bytes)
                .file_name(input.file_name.clone())
                .mime_str(&mime)?;
            form = form.part(input.name.clone(), part);
        }
        form = form.text("options", request.options.to_string());

        debug!(%url, inputs = request.inputs.len(), "submitting compute request");
        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ComputeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let envelope: ComputeEnvelope = serde_json::from_str(&body)
            .map_err(|err| ComputeError::Decode(format!("{err}: {body}")))?;
        if !envelope.success {
            let detail = envelope
                .error
                .unwrap_or_else(|| "no error detail".to_string());
            return Err(ComputeError::Processing(detail));
        }
        envelope
            .result
            .ok_or_else(|| ComputeError::Decode("success envelope without result".to_string()))
    }
}
