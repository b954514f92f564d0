//! Background queue maintenance
//!
//! One task owns both housekeeping duties:
//! - Stall sweeps: active jobs whose worker went quiet are returned to the
//!   queue or failed, on a cadence of half the stall timeout.
//! - Retention reaps: terminal jobs past their retention window are removed
//!   in bounded batches so a burst of finished work cannot hold memory
//!   forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::queue::store::JobStore;
use crate::types::JobState;

const REAPABLE_STATES: [JobState; 3] =
    [JobState::Completed, JobState::Failed, JobState::Cancelled];

pub fn spawn(
    store: Arc<JobStore>,
    config: QueueConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(store, config, shutdown).await;
    })
}

async fn run(store: Arc<JobStore>, config: QueueConfig, shutdown: CancellationToken) {
    let stall_timeout = config.stall_timeout();
    // Check twice per stall window so detection lags by at most half of it.
    let stall_cadence = Duration::from_secs((config.stall_timeout_secs / 2).max(1));
    let mut stall_tick = tokio::time::interval(stall_cadence);
    let mut reap_tick = tokio::time::interval(config.reap_interval());
    // The first tick of a tokio interval fires immediately; skip straight to
    // the steady cadence.
    stall_tick.tick().await;
    reap_tick.tick().await;

    info!(
        stall_timeout_secs = config.stall_timeout_secs,
        reap_interval_secs = config.reap_interval_secs,
        retention_secs = config.retention_secs,
        "queue maintenance started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("queue maintenance stopping");
                break;
            }
            _ = stall_tick.tick() => {
                let sweep = store.recover_stalled(stall_timeout).await;
                if !sweep.requeued.is_empty() || !sweep.failed.is_empty() {
                    warn!(
                        requeued = sweep.requeued.len(),
                        failed = sweep.failed.len(),
                        "stalled jobs recovered"
                    );
                }
            }
            _ = reap_tick.tick() => {
                reap_expired(&store, &config).await;
            }
        }
    }
}

async fn reap_expired(store: &JobStore, config: &QueueConfig) {
    let retention = config.retention();
    for state in REAPABLE_STATES {
        match store.reap(retention, config.reap_batch, state).await {
            Ok(0) => {}
            Ok(removed) => {
                debug!(state = %state, removed, "expired jobs reaped");
            }
            Err(err) => {
                warn!(state = %state, error = %err, "reap pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::backoff::RetryPolicy;
    use crate::queue::job::{Job, NewJob};
    use crate::types::Modality;

    fn quick_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            stall_timeout_secs: 1,
            max_stalled_retries: 1,
            retention_secs: 0,
            reap_interval_secs: 1,
            reap_batch: 100,
        }
    }

    fn sample_job(id: &str) -> Job {
        Job::new(NewJob {
            id: Some(id.to_string()),
            owner_id: "tester".to_string(),
            modality: Modality::Thermal,
            operation: "heatmap".to_string(),
            source_ref: "blob://frame.tif".to_string(),
            parameters: serde_json::Map::new(),
            priority: 5,
        })
    }

    #[tokio::test]
    async fn test_reap_expired_clears_all_terminal_states() {
        let store = JobStore::new(RetryPolicy::default());
        let config = quick_config();

        store.enqueue(sample_job("done")).await.unwrap();
        let lease = store.claim_next().await.unwrap();
        store.complete(&lease, serde_json::json!({})).await.unwrap();

        store.enqueue(sample_job("gone")).await.unwrap();
        store.cancel("gone").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        reap_expired(&store, &config).await;

        assert!(store.get("done").await.is_none());
        assert!(store.get("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let store = Arc::new(JobStore::new(RetryPolicy::default()));
        let shutdown = CancellationToken::new();
        let handle = spawn(store, quick_config(), shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("maintenance task should exit on shutdown")
            .unwrap();
    }
}
