//! Knowledge index sink
//!
//! Completed analyses are summarized into a document (title, markdown
//! report, extracted entities) and pushed to the knowledge service so
//! results are searchable later. Indexing is best effort: callers log and
//! carry on when the sink is down, and the job still completes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::KnowledgeConfig;
use crate::queue::Job;
use crate::types::Modality;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("knowledge request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("knowledge service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unreadable knowledge response: {0}")]
    Decode(String),
}

/// Something concrete found in an analysis result worth indexing on its own.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Entity {
    pub kind: String,
    pub name: String,
    pub properties: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    pub job_id: String,
    pub modality: Modality,
    pub title: String,
    /// Markdown body, also persisted alongside the raw result as `report.md`.
    pub report: String,
    pub entities: Vec<Entity>,
}

/// Distill a compute payload into an indexable document. Pure and total:
/// unknown payload shapes still yield a document, just with fewer entities.
pub fn build_document(job: &Job, payload: &Value) -> KnowledgeDocument {
    let title = format!("{} {} of {}", job.modality, job.operation, short_ref(job));
    let entities = extract_entities(job.modality, payload);

    let mut lines = vec![
        format!("# {title}"),
        String::new(),
        format!("Job `{}` ({} source input(s)).", job.id, job.source_refs().len()),
        String::new(),
    ];
    for line in summary_lines(job.modality, payload) {
        lines.push(format!("- {line}"));
    }
    if !entities.is_empty() {
        lines.push(String::new());
        lines.push("## Findings".to_string());
        for entity in &entities {
            lines.push(format!("- {} `{}`", entity.kind, entity.name));
        }
    }

    KnowledgeDocument {
        job_id: job.id.clone(),
        modality: job.modality,
        title,
        report: lines.join("\n"),
        entities,
    }
}

fn short_ref(job: &Job) -> String {
    job.source_refs()
        .first()
        .map(|r| {
            r.rsplit('/')
                .next()
                .filter(|tail| !tail.is_empty())
                .unwrap_or(r)
                .to_string()
        })
        .unwrap_or_else(|| "submitted inputs".to_string())
}

fn extract_entities(modality: Modality, payload: &Value) -> Vec<Entity> {
    let mut entities = Vec::new();
    match modality {
        Modality::Lidar => {
            collect_objects(payload, "buildings", "building", &mut entities);
        }
        Modality::Spectral => {
            collect_objects(payload, "materials", "material", &mut entities);
            collect_objects(payload, "endmembers", "endmember", &mut entities);
        }
        Modality::Radar => {
            collect_objects(payload, "changes", "change_region", &mut entities);
        }
        Modality::Thermal => {
            collect_objects(payload, "anomalies", "thermal_anomaly", &mut entities);
        }
        Modality::Fusion => {
            collect_objects(payload, "sources", "source_layer", &mut entities);
        }
    }
    entities
}

/// Pull `payload[key]` as an array and turn each element into an entity of
/// `kind`, named after its `name`/`id`/`class` field or its position.
fn collect_objects(payload: &Value, key: &str, kind: &str, out: &mut Vec<Entity>) {
    let Some(items) = payload.get(key).and_then(Value::as_array) else {
        return;
    };
    for (index, item) in items.iter().enumerate() {
        let name = ["name", "id", "class", "label"]
            .iter()
            .find_map(|k| item.get(k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind}-{index}"));
        out.push(Entity {
            kind: kind.to_string(),
            name,
            properties: item.clone(),
        });
    }
}

fn summary_lines(modality: Modality, payload: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    let push_count = |lines: &mut Vec<String>, key: &str, label: &str| {
        if let Some(n) = payload.get(key).and_then(Value::as_u64) {
            lines.push(format!("{label}: {n}"));
        }
    };
    match modality {
        Modality::Lidar => {
            push_count(&mut lines, "numPoints", "points processed");
            if let Some(classes) = payload.get("classifications").and_then(Value::as_object) {
                lines.push(format!("land cover classes: {}", classes.len()));
            }
        }
        Modality::Spectral => {
            push_count(&mut lines, "numEndmembers", "endmembers resolved");
            push_count(&mut lines, "numBands", "spectral bands");
        }
        Modality::Radar => {
            if let Some(coherence) = payload.get("meanCoherence").and_then(Value::as_f64) {
                lines.push(format!("mean coherence: {coherence:.3}"));
            }
            push_count(&mut lines, "numChanges", "change regions");
        }
        Modality::Thermal => {
            push_count(&mut lines, "numAnomalies", "thermal anomalies");
            if let Some(max) = payload.get("maxTemperature").and_then(Value::as_f64) {
                lines.push(format!("hottest reading: {max:.1}"));
            }
        }
        Modality::Fusion => {
            if let Some(strategy) = payload.get("strategy").and_then(Value::as_str) {
                lines.push(format!("fusion strategy: {strategy}"));
            }
            push_count(&mut lines, "numSources", "fused sources");
        }
    }
    lines
}

#[async_trait]
pub trait KnowledgeSink: Send + Sync {
    /// Index the document; returns the sink's id for it.
    async fn submit(&self, document: &KnowledgeDocument) -> Result<String, KnowledgeError>;
}

#[derive(Debug, Deserialize)]
struct IndexedDocument {
    id: String,
}

pub struct KnowledgeClient {
    client: reqwest::Client,
    base_url: String,
}

impl KnowledgeClient {
    pub fn from_config(config: &KnowledgeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KnowledgeSink for KnowledgeClient {
    async fn submit(&self, document: &KnowledgeDocument) -> Result<String, KnowledgeError> {
        let url = format!("{}/api/documents", self.base_url);
        let response = self.client.post(&url).json(document).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(KnowledgeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let indexed: IndexedDocument = serde_json::from_str(&body)
            .map_err(|err| KnowledgeError::Decode(format!("{err}: {body}")))?;
        debug!(document_id = %indexed.id, "document indexed");
        Ok(indexed.id)
    }
}
