//! API Routes
//!
//! This module organizes all HTTP endpoints for the application:
//! - `POST /api/jobs` - Admit a new analysis job
//! - `GET /api/jobs/{id}` - Poll job state, progress and result
//! - `DELETE /api/jobs/{id}` - Request cancellation
//! - `GET /api/jobs/stats` - Per-state queue counts
//! - `GET /api/health` - Liveness probe
//! - `GET /api/metrics` - Prometheus-style queue gauges

pub mod health;
pub mod jobs;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

/// Create the main application router
///
/// All endpoints live under `/api/`; the trace and CORS layers wrap the
/// whole surface.
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let allowed_origins = state.config.server.cors_allowed_origins.clone();

    Router::new()
        .merge(jobs::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&allowed_origins))
}
