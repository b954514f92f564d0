// Oxidized Geo - Asynchronous orchestration for geospatial sensor analytics

pub mod compute;
pub mod config;
pub mod dispatch;
pub mod knowledge;
pub mod middleware;
pub mod models;
pub mod pipelines; // One handler per sensor modality (lidar, spectral, ...)
pub mod queue;
pub mod routes;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;
// Note: Import specific items from types module instead of glob to avoid name conflicts
// e.g., use oxidized_geo::types::{AppError, AppResult, Modality};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
