//! Multi-modal fusion pipeline
//!
//! `fuse` combines co-located products from at least two distinct
//! modalities, with the `modalities` parameter naming the modality of each
//! source ref in order. `report` reads previously completed analysis
//! artifacts (the `analyses` parameter) rather than source imagery, so a
//! report job may carry no source refs at all.

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

pub struct FusionPipeline;

#[async_trait]
impl ModalityPipeline for FusionPipeline {
    fn modality(&self) -> Modality {
        Modality::Fusion
    }

    async fn execute(&self, job: &Job, ctx: &StageContext) -> Result<Value, PipelineError> {
        let spec = OperationSpec::parse(job.modality, &job.operation, &job.parameters)?;
        let source_refs = job.source_refs();
        spec.check_inputs(source_refs.len())?;
        ctx.checkpoint(PROGRESS_VALIDATED).await;

        let refs: Vec<&str> = match &spec {
            OperationSpec::FusionReport(params) => {
                params.analyses.iter().map(String::as_str).collect()
            }
            _ => source_refs,
        };
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
        match &spec {
            OperationSpec::FusionFuse(params) => {
                result["strategy"] = Value::from(params.strategy.as_str());
                result["modalities"] = Value::from(
                    params
                        .modalities
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>(),
                );
            }
            OperationSpec::FusionReport(params) => {
                result["format"] = Value::from(params.format.clone());
            }
            _ => {}
        }
        info!(job_id = %ctx.job_id, operation = %job.operation, "fusion pipeline finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::testkit::harness_for;
    use crate::queue::NewJob;

    fn fuse_spec() -> NewJob {
        let mut parameters = serde_json::Map::new();
        parameters.insert(
            "modalities".to_string(),
            serde_json::json!(["lidar", "thermal"]),
        );
        parameters.insert("strategy".to_string(), serde_json::json!("pixel"));
        NewJob {
            id: Some("fusion-1".to_string()),
            owner_id: "tester".to_string(),
            modality: Modality::Fusion,
            operation: "fuse".to_string(),
            source_ref: "blob://products/dsm.tif,blob://products/heat.tif".to_string(),
            parameters,
            priority: 5,
        }
    }

    #[tokio::test]
    async fn test_fuse_combines_two_modalities() {
        let h = harness_for(fuse_spec()).await;
        h.blobs.seed("blob://products/dsm.tif", b"dsm").await;
        h.blobs.seed("blob://products/heat.tif", b"heat").await;
        h.compute
            .push_response(Ok(serde_json::json!({
                "strategy": "pixel",
                "numSources": 2,
                "sources": [{"name": "dsm"}, {"name": "heat"}]
            })))
            .await;

        let result = FusionPipeline
            .execute(&h.lease.job, &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["strategy"], "pixel");
        assert_eq!(result["modalities"], serde_json::json!(["lidar", "thermal"]));

        let calls = h.compute.calls.lock().await;
        assert_eq!(calls[0].0, "/fusion/fuse");
    }

    #[tokio::test]
    async fn test_fuse_rejects_single_modality_set() {
        let mut spec = fuse_spec();
        spec.parameters.insert(
            "modalities".to_string(),
            serde_json::json!(["thermal", "thermal"]),
        );
        let h = harness_for(spec).await;

        let err = FusionPipeline
            .execute(&h.lease.job, &h.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(err.to_string().contains("distinct"));
    }

    #[tokio::test]
    async fn test_report_reads_analysis_artifacts_not_sources() {
        let mut parameters = serde_json::Map::new();
        parameters.insert(
            "analyses".to_string(),
            serde_json::json!(["stub://jobs/a/analysis.json", "stub://jobs/b/analysis.json"]),
        );
        let spec = NewJob {
            id: Some("fusion-2".to_string()),
            owner_id: "tester".to_string(),
            modality: Modality::Fusion,
            operation: "report".to_string(),
            // No source imagery for report jobs.
            source_ref: String::new(),
            parameters,
            priority: 5,
        };
        let h = harness_for(spec).await;
        h.blobs
            .seed("stub://jobs/a/analysis.json", b"{\"numPoints\": 1}")
            .await;
        h.blobs
            .seed("stub://jobs/b/analysis.json", b"{\"numAnomalies\": 2}")
            .await;

        let result = FusionPipeline
            .execute(&h.lease.job, &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["format"], "markdown");
        assert_eq!(result["outputPaths"].as_array().unwrap().len(), 2);
    }
}
