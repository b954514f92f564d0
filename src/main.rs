use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oxidized_geo::compute::ComputeClient;
use oxidized_geo::dispatch::{Collaborators, Dispatcher};
use oxidized_geo::knowledge::KnowledgeClient;
use oxidized_geo::pipelines::PipelineSet;
use oxidized_geo::queue::{reaper, JobStore, RetryPolicy};
use oxidized_geo::{config::Config, routes::create_router, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oxidized_geo=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);

    // Wire the external collaborators
    let blobs = storage::create_store(&config.storage)?;
    let compute = Arc::new(ComputeClient::from_config(&config.compute));
    let knowledge = Arc::new(KnowledgeClient::from_config(&config.knowledge)?);

    // Job store and worker pool
    let store = Arc::new(JobStore::new(RetryPolicy::from_config(&config.queue)));
    let dispatcher = Dispatcher::new(
        store.clone(),
        PipelineSet::standard(),
        Collaborators {
            blobs,
            compute,
            knowledge,
        },
        config.worker.clone(),
        &config.compute,
    )
    .spawn();

    // Background reaper: stall recovery plus terminal-job retention
    let reaper_shutdown = CancellationToken::new();
    let reaper = reaper::spawn(store.clone(), config.queue.clone(), reaper_shutdown.clone());

    // Create shared state
    let state = oxidized_geo::AppState {
        store,
        config: config.clone(),
    };

    // Create router
    let app = create_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    // Drain in-flight jobs before exit
    info!("Shutting down background tasks");
    dispatcher.shutdown().await;
    reaper_shutdown.cancel();
    let _ = reaper.await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
    }
}
