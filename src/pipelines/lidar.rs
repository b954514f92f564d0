//! Lidar point cloud pipeline
//!
//! `process` derives raster products (DEM, DSM, CHM, ...) from a point
//! cloud at a requested resolution; `classify` labels returns by land
//! cover class.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{
    fetch_inputs, index_best_effort, persist_artifacts, result_document, to_compute_inputs,
    ModalityPipeline, OperationSpec, PipelineError, StageContext, PROGRESS_COMPUTED,
    PROGRESS_DONE, PROGRESS_FETCHED, PROGRESS_PERSISTED, PROGRESS_VALIDATED,
};
use crate::compute::ComputeRequest;
use crate::knowledge::build_document;
use crate::queue::Job;
use crate::types::Modality;

pub struct LidarPipeline;

#[async_trait]
impl ModalityPipeline for LidarPipeline {
    fn modality(&self) -> Modality {
        Modality::Lidar
    }

    async fn execute(&self, job: &Job, ctx: &StageContext) -> Result<Value, PipelineError> {
        let spec = OperationSpec::parse(job.modality, &job.operation, &job.parameters)?;
        let refs = job.source_refs();
        spec.check_inputs(refs.len())?;
        ctx.checkpoint(PROGRESS_VALIDATED).await;

        let fetched = fetch_inputs(ctx, &refs).await?;
        ctx.checkpoint(PROGRESS_FETCHED).await;

        ctx.ensure_live()?;
        let payload = ctx
            .compute
            .submit(ComputeRequest {
                path: spec.compute_path().to_string(),
                inputs: to_compute_inputs(&fetched),
                options: Value::Object(job.parameters.clone()),
                timeout: ctx.compute_timeout,
            })
            .await?;
        ctx.checkpoint(PROGRESS_COMPUTED).await;

        let document = build_document(job, &payload);
        let artifacts = persist_artifacts(
            ctx,
            vec![
                ("analysis.json".to_string(), serde_json::to_vec_pretty(&payload)?),
                ("report.md".to_string(), document.report.clone().into_bytes()),
            ],
        )
        .await?;
        ctx.checkpoint(PROGRESS_PERSISTED).await;

        let doc_id = index_best_effort(ctx, &document).await;
        ctx.checkpoint(PROGRESS_DONE).await;

        let mut result = result_document(&artifacts, doc_id);
        if let OperationSpec::LidarProcess(params) = &spec {
            result["products"] = Value::from(params.products.clone());
            result["resolution"] = Value::from(params.resolution);
        }
        info!(job_id = %ctx.job_id, operation = %job.operation, "lidar pipeline finished");
        Ok(result)
    }
}
