//! Modality pipelines
//!
//! Every job runs the same five stages, with modality-specific behavior in
//! the middle:
//!
//! ```text
//!   validate -> fetch -> compute -> persist -> index
//!      10%      30%       70%        90%       100%
//! ```
//!
//! Stages report progress through the job store at each boundary and check
//! for cooperative cancellation before doing more work. The index stage is
//! best effort; everything before it is mandatory for a completed job.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod fusion;
pub mod lidar;
pub mod params;
pub mod radar;
pub mod spectral;
pub mod thermal;

pub use params::{OperationSpec, ValidationError};

use crate::compute::{ComputeError, ComputeInput, ComputeService};
use crate::knowledge::{KnowledgeDocument, KnowledgeSink};
use crate::queue::{Job, JobId, JobStore};
use crate::storage::{BlobError, BlobStore};
use crate::types::Modality;

pub const PROGRESS_VALIDATED: u8 = 10;
pub const PROGRESS_FETCHED: u8 = 30;
pub const PROGRESS_COMPUTED: u8 = 70;
pub const PROGRESS_PERSISTED: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to fetch {reference}: {source}")]
    Fetch {
        reference: String,
        source: BlobError,
    },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("failed to persist {name}: {source}")]
    Persist { name: String, source: BlobError },

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the failure may succeed on a later attempt. Validation
    /// failures never will; collaborator trouble usually might.
    pub fn retryable(&self) -> bool {
        match self {
            PipelineError::Validation(_) | PipelineError::Cancelled => false,
            PipelineError::Fetch { source, .. } | PipelineError::Persist { source, .. } => {
                source.retryable()
            }
            PipelineError::Compute(err) => err.retryable(),
            PipelineError::Workspace(_) => true,
            PipelineError::Serialize(_) => false,
        }
    }
}

/// Everything one pipeline run needs besides the job itself.
pub struct StageContext {
    pub job_id: JobId,
    pub blobs: Arc<dyn BlobStore>,
    pub compute: Arc<dyn ComputeService>,
    pub knowledge: Arc<dyn KnowledgeSink>,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    /// Scratch directory for this attempt, removed after the run.
    pub workspace: PathBuf,
    pub compute_timeout: Duration,
}

impl StageContext {
    /// Record a stage boundary.
    pub async fn checkpoint(&self, percent: u8) {
        self.progress.report(percent).await;
    }

    /// Cooperative cancellation check; call before starting expensive work.
    pub fn ensure_live(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Writes progress percentages back to the store for one claimed attempt.
/// Failures are logged and swallowed: losing a progress tick must not fail
/// the job.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<JobStore>,
    job_id: JobId,
    attempt: u32,
}

impl ProgressReporter {
    pub fn new(store: Arc<JobStore>, job_id: JobId, attempt: u32) -> Self {
        Self {
            store,
            job_id,
            attempt,
        }
    }

    pub async fn report(&self, percent: u8) {
        if let Err(err) = self
            .store
            .update_progress(&self.job_id, self.attempt, percent)
            .await
        {
            debug!(job_id = %self.job_id, percent, error = %err, "progress update dropped");
        }
    }
}

#[async_trait]
pub trait ModalityPipeline: Send + Sync {
    fn modality(&self) -> Modality;

    /// Run the full stage sequence for one claimed job. The returned value
    /// is stored as the job result.
    async fn execute(&self, job: &Job, ctx: &StageContext) -> Result<Value, PipelineError>;
}

/// Registry mapping each modality to its pipeline.
pub struct PipelineSet {
    pipelines: HashMap<Modality, Arc<dyn ModalityPipeline>>,
}

impl PipelineSet {
    /// All five production pipelines.
    pub fn standard() -> Self {
        Self::empty()
            .register(Arc::new(lidar::LidarPipeline))
            .register(Arc::new(spectral::SpectralPipeline))
            .register(Arc::new(radar::RadarPipeline))
            .register(Arc::new(thermal::ThermalPipeline))
            .register(Arc::new(fusion::FusionPipeline))
    }

    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    pub fn register(mut self, pipeline: Arc<dyn ModalityPipeline>) -> Self {
        self.pipelines.insert(pipeline.modality(), pipeline);
        self
    }

    pub fn get(&self, modality: Modality) -> Option<Arc<dyn ModalityPipeline>> {
        self.pipelines.get(&modality).cloned()
    }
}

/// Scratch directory for one job attempt, removed when the run ends.
/// Attempts get separate directories so a stall-recovered retry never sees
/// a half-written tree from its predecessor.
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub async fn create(
        scratch_root: impl AsRef<Path>,
        job_id: &str,
        attempt: u32,
    ) -> std::io::Result<Self> {
        let dir = scratch_root
            .as_ref()
            .join(job_id)
            .join(format!("attempt-{attempt}"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Best effort removal; a leftover scratch directory is only disk noise.
    pub async fn cleanup(self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "workspace cleanup failed");
        }
    }
}

/// A source object staged into the workspace.
#[derive(Debug, Clone)]
pub struct FetchedInput {
    pub reference: String,
    pub path: PathBuf,
    pub size: usize,
}

/// Download each reference into the workspace as `input-{i}{ext}`.
pub async fn fetch_inputs(
    ctx: &StageContext,
    references: &[&str],
) -> Result<Vec<FetchedInput>, PipelineError> {
    let mut fetched = Vec::with_capacity(references.len());
    for (index, reference) in references.iter().enumerate() {
        ctx.ensure_live()?;
        let bytes = ctx
            .blobs
            .download(reference)
            .await
            .map_err(|source| PipelineError::Fetch {
                reference: reference.to_string(),
                source,
            })?;
        let name = format!("input-{index}{}", extension_of(reference));
        let path = ctx.workspace.join(&name);
        tokio::fs::write(&path, &bytes).await?;
        debug!(job_id = %ctx.job_id, reference, size = bytes.len(), "input staged");
        fetched.push(FetchedInput {
            reference: reference.to_string(),
            path,
            size: bytes.len(),
        });
    }
    Ok(fetched)
}

fn extension_of(reference: &str) -> String {
    Path::new(reference)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Multipart naming: `file` for a single input, `file_{i}` for sets, which
/// is what the compute endpoints expect.
pub fn to_compute_inputs(fetched: &[FetchedInput]) -> Vec<ComputeInput> {
    let single = fetched.len() == 1;
    fetched
        .iter()
        .enumerate()
        .map(|(index, input)| ComputeInput {
            name: if single {
                "file".to_string()
            } else {
                format!("file_{index}")
            },
            file_name: input
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("input")
                .to_string(),
            path: input.path.clone(),
        })
        .collect()
}

/// One stored output with enough metadata to audit it later.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedArtifact {
    pub name: String,
    pub reference: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub sha256: String,
}

/// Upload result files under `jobs/{job_id}/` and record their digests.
pub async fn persist_artifacts(
    ctx: &StageContext,
    files: Vec<(String, Vec<u8>)>,
) -> Result<Vec<PersistedArtifact>, PipelineError> {
    let mut artifacts = Vec::with_capacity(files.len());
    for (name, bytes) in files {
        ctx.ensure_live()?;
        let content_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let size_bytes = bytes.len();
        let key = format!("jobs/{}/{}", ctx.job_id, name);
        let reference = ctx
            .blobs
            .upload(&key, bytes.into(), &content_type)
            .await
            .map_err(|source| PipelineError::Persist {
                name: name.clone(),
                source,
            })?;
        artifacts.push(PersistedArtifact {
            name,
            reference,
            content_type,
            size_bytes,
            sha256,
        });
    }
    Ok(artifacts)
}

/// Push the document to the knowledge sink, logging instead of failing when
/// it is unavailable.
pub async fn index_best_effort(ctx: &StageContext, document: &KnowledgeDocument) -> Option<String> {
    match ctx.knowledge.submit(document).await {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(job_id = %ctx.job_id, error = %err, "knowledge indexing failed, continuing");
            None
        }
    }
}

/// The common job result shape; pipelines may add modality fields on top.
pub fn result_document(
    artifacts: &[PersistedArtifact],
    knowledge_doc_id: Option<String>,
) -> Value {
    let output_paths: Vec<&str> = artifacts.iter().map(|a| a.reference.as_str()).collect();
    serde_json::json!({
        "outputPaths": output_paths,
        "artifacts": artifacts,
        "knowledgeDocId": knowledge_doc_id,
    })
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::compute::ComputeRequest;
    use crate::knowledge::KnowledgeError;
    use crate::queue::{JobLease, NewJob, RetryPolicy};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// In-memory blob store keyed by exact reference string.
    pub struct StubBlobs {
        objects: Mutex<HashMap<String, bytes::Bytes>>,
    }

    impl StubBlobs {
        pub fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
            }
        }

        pub async fn seed(&self, reference: &str, bytes: &[u8]) {
            self.objects
                .lock()
                .await
                .insert(reference.to_string(), bytes::Bytes::copy_from_slice(bytes));
        }

        pub async fn stored(&self, reference: &str) -> Option<bytes::Bytes> {
            self.objects.lock().await.get(reference).cloned()
        }
    }

    #[async_trait]
    impl BlobStore for StubBlobs {
        async fn upload(
            &self,
            key: &str,
            bytes: bytes::Bytes,
            _content_type: &str,
        ) -> Result<String, BlobError> {
            let reference = format!("stub://{key}");
            self.objects.lock().await.insert(reference.clone(), bytes);
            Ok(reference)
        }

        async fn download(&self, reference: &str) -> Result<bytes::Bytes, BlobError> {
            self.objects
                .lock()
                .await
                .get(reference)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(reference.to_string()))
        }

        async fn share_url(
            &self,
            reference: &str,
            _expiry_secs: u32,
        ) -> Result<String, BlobError> {
            Ok(format!("https://stub.example/{reference}"))
        }

        async fn delete(&self, reference: &str) -> Result<(), BlobError> {
            self.objects.lock().await.remove(reference);
            Ok(())
        }
    }

    /// Scripted compute service; answers `ok: true` once the script runs dry.
    pub struct StubCompute {
        script: Mutex<VecDeque<Result<Value, ComputeError>>>,
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    impl StubCompute {
        pub fn new() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub async fn push_response(&self, response: Result<Value, ComputeError>) {
            self.script.lock().await.push_back(response);
        }
    }

    #[async_trait]
    impl ComputeService for StubCompute {
        async fn submit(&self, request: ComputeRequest) -> Result<Value, ComputeError> {
            self.calls
                .lock()
                .await
                .push((request.path.clone(), request.options.clone()));
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
        }
    }

    pub struct StubSink {
        pub fail: bool,
        pub documents: Mutex<Vec<KnowledgeDocument>>,
    }

    impl StubSink {
        pub fn new() -> Self {
            Self {
                fail: false,
                documents: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                documents: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KnowledgeSink for StubSink {
        async fn submit(&self, document: &KnowledgeDocument) -> Result<String, KnowledgeError> {
            if self.fail {
                return Err(KnowledgeError::Status {
                    status: 503,
                    message: "index down".to_string(),
                });
            }
            self.documents.lock().await.push(document.clone());
            Ok(format!("doc-{}", document.job_id))
        }
    }

    /// A claimed job plus a fully wired context over the stub collaborators.
    pub struct Harness {
        pub store: Arc<JobStore>,
        pub blobs: Arc<StubBlobs>,
        pub compute: Arc<StubCompute>,
        pub knowledge: Arc<StubSink>,
        pub lease: JobLease,
        pub ctx: StageContext,
        _workspace: tempfile::TempDir,
    }

    pub async fn harness_for(spec: NewJob) -> Harness {
        harness_with_sink(spec, StubSink::new()).await
    }

    pub async fn harness_with_sink(spec: NewJob, sink: StubSink) -> Harness {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let blobs = Arc::new(StubBlobs::new());
        let compute = Arc::new(StubCompute::new());
        let knowledge = Arc::new(sink);
        let workspace = tempfile::tempdir().unwrap();

        store.enqueue(Job::new(spec)).await.unwrap();
        let lease = store.claim_next().await.unwrap();
        let ctx = StageContext {
            job_id: lease.job.id.clone(),
            blobs: blobs.clone(),
            compute: compute.clone(),
            knowledge: knowledge.clone(),
            progress: ProgressReporter::new(store.clone(), lease.job.id.clone(), lease.attempt),
            cancel: lease.cancel.clone(),
            workspace: workspace.path().to_path_buf(),
            compute_timeout: Duration::from_secs(5),
        };
        Harness {
            store,
            blobs,
            compute,
            knowledge,
            lease,
            ctx,
            _workspace: workspace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::queue::NewJob;

    fn thermal_spec() -> NewJob {
        NewJob {
            id: Some("ctx-job".to_string()),
            owner_id: "tester".to_string(),
            modality: Modality::Thermal,
            operation: "heatmap".to_string(),
            source_ref: "blob://frames/a.tif".to_string(),
            parameters: serde_json::Map::new(),
            priority: 5,
        }
    }

    #[tokio::test]
    async fn test_fetch_inputs_stages_files_with_extensions() {
        let h = harness_for(thermal_spec()).await;
        h.blobs.seed("blob://frames/a.tif", b"tif bytes").await;

        let fetched = fetch_inputs(&h.ctx, &["blob://frames/a.tif"]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].size, 9);
        assert!(fetched[0].path.ends_with("input-0.tif"));
        assert_eq!(std::fs::read(&fetched[0].path).unwrap(), b"tif bytes");
    }

    #[tokio::test]
    async fn test_fetch_missing_input_is_fatal() {
        let h = harness_for(thermal_spec()).await;
        let err = fetch_inputs(&h.ctx, &["blob://frames/missing.tif"])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_fetching() {
        let h = harness_for(thermal_spec()).await;
        h.blobs.seed("blob://frames/a.tif", b"tif bytes").await;
        h.ctx.cancel.cancel();

        let err = fetch_inputs(&h.ctx, &["blob://frames/a.tif"])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_persist_artifacts_records_digests() {
        let h = harness_for(thermal_spec()).await;
        let artifacts = persist_artifacts(
            &h.ctx,
            vec![
                ("analysis.json".to_string(), b"{}".to_vec()),
                ("report.md".to_string(), b"# r".to_vec()),
            ],
        )
        .await
        .unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].reference, "stub://jobs/ctx-job/analysis.json");
        assert_eq!(artifacts[0].content_type, "application/json");
        assert_eq!(artifacts[0].size_bytes, 2);
        // Digest of b"{}".
        assert_eq!(
            artifacts[0].sha256,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert!(h.blobs.stored("stub://jobs/ctx-job/report.md").await.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_updates_store_progress() {
        let h = harness_for(thermal_spec()).await;
        h.ctx.checkpoint(PROGRESS_FETCHED).await;
        assert_eq!(h.store.get("ctx-job").await.unwrap().progress, 30);
    }

    #[test]
    fn test_compute_input_naming() {
        let single = vec![FetchedInput {
            reference: "r0".to_string(),
            path: PathBuf::from("/w/input-0.laz"),
            size: 1,
        }];
        assert_eq!(to_compute_inputs(&single)[0].name, "file");

        let pair = vec![
            FetchedInput {
                reference: "r0".to_string(),
                path: PathBuf::from("/w/input-0.tif"),
                size: 1,
            },
            FetchedInput {
                reference: "r1".to_string(),
                path: PathBuf::from("/w/input-1.tif"),
                size: 1,
            },
        ];
        let inputs = to_compute_inputs(&pair);
        assert_eq!(inputs[0].name, "file_0");
        assert_eq!(inputs[1].name, "file_1");
        assert_eq!(inputs[1].file_name, "input-1.tif");
    }

    #[tokio::test]
    async fn test_workspace_is_per_attempt_and_removable() {
        let root = tempfile::tempdir().unwrap();
        let first = Workspace::create(root.path(), "job-9", 0).await.unwrap();
        let second = Workspace::create(root.path(), "job-9", 1).await.unwrap();
        assert_ne!(first.path(), second.path());

        let marker = first.path().join("input-0.laz");
        std::fs::write(&marker, b"x").unwrap();
        first.cleanup().await;
        assert!(!marker.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn test_result_document_shape() {
        let artifacts = vec![PersistedArtifact {
            name: "analysis.json".to_string(),
            reference: "stub://jobs/j/analysis.json".to_string(),
            content_type: "application/json".to_string(),
            size_bytes: 2,
            sha256: "ab".to_string(),
        }];
        let doc = result_document(&artifacts, Some("doc-1".to_string()));
        assert_eq!(doc["outputPaths"][0], "stub://jobs/j/analysis.json");
        assert_eq!(doc["artifacts"][0]["sizeBytes"], 2);
        assert_eq!(doc["knowledgeDocId"], "doc-1");

        let doc = result_document(&artifacts, None);
        assert!(doc["knowledgeDocId"].is_null());
    }
}
