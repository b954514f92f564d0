//! SAR pipeline
//!
//! Interferometry and change detection take a co-registered scene pair;
//! despeckle filters a single image. The compute service exposes these
//! under `/sar/`.

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

pub struct RadarPipeline;

#[async_trait]
impl ModalityPipeline for RadarPipeline {
    fn modality(&self) -> Modality {
        Modality::Radar
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
        if let OperationSpec::RadarDespeckle(params) = &spec {
            result["filter"] = Value::from(params.filter.clone());
        }
        info!(job_id = %ctx.job_id, operation = %job.operation, "radar pipeline finished");
        Ok(result)
    }
}
