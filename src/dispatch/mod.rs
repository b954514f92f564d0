//! Job dispatcher
//!
//! A fixed pool of workers pulls claimed jobs from the store and runs the
//! matching modality pipeline. Two ceilings bound the pool: worker
//! concurrency (pool size) and dispatch throughput (a shared governor rate
//! limiter, consulted only when work is actually waiting so idle polling
//! never drains the quota). Workers stop between jobs on shutdown; the job
//! in flight finishes or is cancelled by its token.

use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compute::ComputeService;
use crate::config::{ComputeConfig, WorkerConfig};
use crate::knowledge::KnowledgeSink;
use crate::pipelines::{
    PipelineError, PipelineSet, ProgressReporter, StageContext, Workspace,
};
use crate::queue::{FailureKind, JobLease, JobStore, StoreError};
use crate::storage::BlobStore;
use crate::types::JobState;

/// The external services pipelines talk to, shared across workers.
#[derive(Clone)]
pub struct Collaborators {
    pub blobs: Arc<dyn BlobStore>,
    pub compute: Arc<dyn ComputeService>,
    pub knowledge: Arc<dyn KnowledgeSink>,
}

pub struct Dispatcher {
    store: Arc<JobStore>,
    pipelines: PipelineSet,
    collaborators: Collaborators,
    config: WorkerConfig,
    compute_timeout_override: Option<Duration>,
    limiter: DefaultDirectRateLimiter,
}

pub struct DispatcherHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        futures::future::join_all(self.workers).await;
        info!("dispatcher stopped");
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        pipelines: PipelineSet,
        collaborators: Collaborators,
        worker: WorkerConfig,
        compute: &ComputeConfig,
    ) -> Self {
        let limiter = RateLimiter::direct(Quota::per_minute(worker.dispatch_quota()));
        Self {
            store,
            pipelines,
            collaborators,
            compute_timeout_override: compute.timeout_override_secs.map(Duration::from_secs),
            config: worker,
            limiter,
        }
    }

    /// Start the worker pool.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(self);
        info!(
            concurrency = dispatcher.config.concurrency,
            dispatch_per_minute = dispatcher.config.dispatch_per_minute,
            "dispatcher starting"
        );
        let workers = (0..dispatcher.config.concurrency)
            .map(|index| {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(dispatcher, index, shutdown).await;
                })
            })
            .collect();
        DispatcherHandle { shutdown, workers }
    }

    async fn run_job(&self, lease: JobLease) {
        let job = &lease.job;
        info!(
            job_id = %job.id,
            modality = %job.modality,
            operation = %job.operation,
            attempt = lease.attempt,
            "job started"
        );

        let Some(pipeline) = self.pipelines.get(job.modality) else {
            // No pipeline registered; retrying cannot help.
            let reason = format!("unknown modality: {}", job.modality);
            warn!(job_id = %job.id, "{}", reason);
            self.report_failure(&lease, &reason, FailureKind::Fatal).await;
            return;
        };

        let workspace = match Workspace::create(&self.config.scratch_dir, &job.id, lease.attempt)
            .await
        {
            Ok(workspace) => workspace,
            Err(err) => {
                let reason = format!("workspace setup failed: {err}");
                self.report_failure(&lease, &reason, FailureKind::Transient)
                    .await;
                return;
            }
        };

        let ctx = StageContext {
            job_id: job.id.clone(),
            blobs: self.collaborators.blobs.clone(),
            compute: self.collaborators.compute.clone(),
            knowledge: self.collaborators.knowledge.clone(),
            progress: ProgressReporter::new(self.store.clone(), job.id.clone(), lease.attempt),
            cancel: lease.cancel.clone(),
            workspace: workspace.path().to_path_buf(),
            compute_timeout: self
                .compute_timeout_override
                .unwrap_or_else(|| job.modality.compute_timeout()),
        };

        let outcome = pipeline.execute(job, &ctx).await;
        workspace.cleanup().await;

        match outcome {
            Ok(result) => match self.store.complete(&lease, result).await {
                Ok(()) => info!(job_id = %job.id, attempt = lease.attempt, "job completed"),
                Err(StoreError::StaleLease(..)) => {
                    debug!(job_id = %job.id, "completion dropped, lease superseded");
                }
                Err(err) => error!(job_id = %job.id, error = %err, "completion write failed"),
            },
            Err(PipelineError::Cancelled) => {
                debug!(job_id = %job.id, "pipeline stopped at cancellation point");
            }
            Err(err) => {
                let kind = if err.retryable() {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                };
                self.report_failure(&lease, &err.to_string(), kind).await;
            }
        }
    }

    async fn report_failure(&self, lease: &JobLease, reason: &str, kind: FailureKind) {
        match self.store.fail(lease, reason, kind).await {
            Ok(JobState::Queued) => {
                warn!(
                    job_id = %lease.job.id,
                    attempt = lease.attempt,
                    error = %reason,
                    "job requeued for retry"
                );
            }
            Ok(_) => {
                error!(job_id = %lease.job.id, error = %reason, "job failed");
            }
            Err(StoreError::StaleLease(..)) => {
                debug!(job_id = %lease.job.id, "failure report dropped, lease superseded");
            }
            Err(err) => {
                error!(job_id = %lease.job.id, error = %err, "failure write failed");
            }
        }
    }
}

async fn worker_loop(dispatcher: Arc<Dispatcher>, index: usize, shutdown: CancellationToken) {
    debug!(worker = index, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if !dispatcher.store.has_ready().await {
            // Delayed retries become due without a notify, hence the poll arm.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = dispatcher.store.wait_ready() => {}
                _ = tokio::time::sleep(dispatcher.config.poll_interval()) => {}
            }
            continue;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = dispatcher.limiter.until_ready() => {}
        }
        match dispatcher.store.claim_next().await {
            Some(lease) => dispatcher.run_job(lease).await,
            // Another worker won the claim.
            None => continue,
        }
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeError;
    use crate::pipelines::testkit::{StubBlobs, StubCompute, StubSink};
    use crate::pipelines::ModalityPipeline;
    use crate::queue::{Job, NewJob, RetryPolicy};
    use crate::types::Modality;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Mutex;

    fn worker_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            dispatch_per_minute: 6000,
            poll_interval_ms: 10,
            scratch_dir: std::env::temp_dir()
                .join(format!("dispatch-test-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn compute_config() -> ComputeConfig {
        ComputeConfig {
            base_url: "http://localhost:5001".to_string(),
            timeout_override_secs: Some(5),
        }
    }

    fn collaborators() -> (Collaborators, Arc<StubBlobs>, Arc<StubCompute>) {
        let blobs = Arc::new(StubBlobs::new());
        let compute = Arc::new(StubCompute::new());
        let knowledge = Arc::new(StubSink::new());
        (
            Collaborators {
                blobs: blobs.clone(),
                compute: compute.clone(),
                knowledge,
            },
            blobs,
            compute,
        )
    }

    fn thermal_job(id: &str, priority: u8) -> Job {
        Job::new(NewJob {
            id: Some(id.to_string()),
            owner_id: "tester".to_string(),
            modality: Modality::Thermal,
            operation: "heatmap".to_string(),
            source_ref: "blob://frames/a.tif".to_string(),
            parameters: serde_json::Map::new(),
            priority,
        })
    }

    async fn wait_for_state(store: &JobStore, id: &str, state: JobState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if store.get(id).await.map(|j| j.state) == Some(state) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {id} to reach {state}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Records begin order and holds each job briefly so ordering is
    /// observable.
    struct RecordingPipeline {
        begun: Arc<Mutex<Vec<String>>>,
        hold: Duration,
    }

    #[async_trait]
    impl ModalityPipeline for RecordingPipeline {
        fn modality(&self) -> Modality {
            Modality::Thermal
        }

        async fn execute(
            &self,
            job: &Job,
            _ctx: &StageContext,
        ) -> Result<Value, PipelineError> {
            self.begun.lock().await.push(job.id.clone());
            tokio::time::sleep(self.hold).await;
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_completes_job_end_to_end() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let (collaborators, blobs, _) = collaborators();
        blobs.seed("blob://frames/a.tif", b"raster").await;
        store.enqueue(thermal_job("d-1", 5)).await.unwrap();

        let handle = Dispatcher::new(
            store.clone(),
            PipelineSet::standard(),
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        wait_for_state(&store, "d-1", JobState::Completed).await;
        let job = store.get("d-1").await.unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_retries_to_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            max_stalled: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        };
        let store = Arc::new(JobStore::new(policy));
        let (collaborators, blobs, compute) = collaborators();
        blobs.seed("blob://frames/a.tif", b"raster").await;
        compute
            .push_response(Err(ComputeError::Status {
                status: 503,
                message: "overloaded".to_string(),
            }))
            .await;
        store.enqueue(thermal_job("d-2", 5)).await.unwrap();

        let handle = Dispatcher::new(
            store.clone(),
            PipelineSet::standard(),
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        wait_for_state(&store, "d-2", JobState::Completed).await;
        let job = store.get("d-2").await.unwrap();
        assert_eq!(job.attempt, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal_without_retry() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let (collaborators, _, _) = collaborators();
        // Single scene for an operation that needs a pair.
        let mut job = thermal_job("d-3", 5);
        job.modality = Modality::Radar;
        job.operation = "interferometry".to_string();
        job.source_ref = "blob://scenes/only-one.slc".to_string();
        store.enqueue(job).await.unwrap();

        let handle = Dispatcher::new(
            store.clone(),
            PipelineSet::standard(),
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        wait_for_state(&store, "d-3", JobState::Failed).await;
        let job = store.get("d-3").await.unwrap();
        assert_eq!(job.attempt, 0);
        assert_eq!(
            job.failure_reason.as_deref(),
            Some("at least 2 images required")
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_modality_fails_fatally() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let (collaborators, _, _) = collaborators();
        store.enqueue(thermal_job("d-4", 5)).await.unwrap();

        // A registry with no thermal pipeline.
        let pipelines = PipelineSet::empty()
            .register(Arc::new(crate::pipelines::lidar::LidarPipeline));
        let handle = Dispatcher::new(
            store.clone(),
            pipelines,
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        wait_for_state(&store, "d-4", JobState::Failed).await;
        let job = store.get("d-4").await.unwrap();
        assert_eq!(job.failure_reason.as_deref(), Some("unknown modality: thermal"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_under_single_worker() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let (collaborators, _, _) = collaborators();

        // All submitted before any worker exists.
        for (id, priority) in [
            ("p-low-1", 2),
            ("p-high-1", 9),
            ("p-mid", 5),
            ("p-high-2", 9),
            ("p-low-2", 2),
        ] {
            store.enqueue(thermal_job(id, priority)).await.unwrap();
        }

        let begun = Arc::new(Mutex::new(Vec::new()));
        let pipelines = PipelineSet::empty().register(Arc::new(RecordingPipeline {
            begun: begun.clone(),
            hold: Duration::from_millis(1),
        }));
        let handle = Dispatcher::new(
            store.clone(),
            pipelines,
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        for id in ["p-low-1", "p-high-1", "p-mid", "p-high-2", "p-low-2"] {
            wait_for_state(&store, id, JobState::Completed).await;
        }
        handle.shutdown().await;

        let begun = begun.lock().await;
        assert_eq!(
            *begun,
            vec!["p-high-1", "p-high-2", "p-mid", "p-low-1", "p-low-2"]
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_run_discards_late_result() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let (collaborators, _, _) = collaborators();
        store.enqueue(thermal_job("d-6", 5)).await.unwrap();

        let begun = Arc::new(Mutex::new(Vec::new()));
        let pipelines = PipelineSet::empty().register(Arc::new(RecordingPipeline {
            begun: begun.clone(),
            hold: Duration::from_millis(200),
        }));
        let handle = Dispatcher::new(
            store.clone(),
            pipelines,
            collaborators,
            worker_config(1),
            &compute_config(),
        )
        .spawn();

        // Wait until the pipeline holds the job, then cancel.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while begun.lock().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.cancel("d-6").await.unwrap();

        // The pipeline returns Ok after the hold, but the lease is stale.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let job = store.get("d-6").await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.result.is_none());
        handle.shutdown().await;
    }
}
