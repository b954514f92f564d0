//! Liveness probe and Prometheus-style queue gauges

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json as ResponseJson},
    routing::get,
    Json, Router,
};

use crate::models::{AppState, HealthResponse};
use crate::queue::QueueStats;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/metrics", get(metrics))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> ResponseJson<HealthResponse> {
    let response = HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        queue: state.store.stats().await,
    };

    Json(response)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.store.stats().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&stats),
    )
}

fn render_metrics(stats: &QueueStats) -> String {
    let gauges = [
        ("waiting", stats.waiting),
        ("delayed", stats.delayed),
        ("active", stats.active),
        ("completed", stats.completed),
        ("failed", stats.failed),
        ("cancelled", stats.cancelled),
    ];

    let mut out = String::new();
    for (name, value) in gauges {
        out.push_str(&format!("# HELP geo_jobs_{} Jobs currently {}\n", name, name));
        out.push_str(&format!("# TYPE geo_jobs_{} gauge\n", name));
        out.push_str(&format!("geo_jobs_{} {}\n", name, value));
    }

    let total: usize = gauges.iter().map(|(_, v)| v).sum();
    out.push_str("# HELP geo_jobs_total Jobs retained in the store\n");
    out.push_str("# TYPE geo_jobs_total gauge\n");
    out.push_str(&format!("geo_jobs_total {}\n", total));
    out
}
