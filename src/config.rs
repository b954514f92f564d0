use std::env;
use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub compute: ComputeConfig,
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent pipeline executions (worker pool size).
    pub concurrency: usize,
    /// Throughput ceiling: jobs admitted to execution per minute.
    pub dispatch_per_minute: u32,
    /// Idle workers re-check the queue at this cadence; also the upper bound
    /// on how long a delayed retry waits past its due time.
    pub poll_interval_ms: u64,
    /// Root for per-job working storage; cleaned after each attempt.
    pub scratch_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Active jobs without a progress update for this long are presumed
    /// orphaned by a dead worker.
    pub stall_timeout_secs: u64,
    pub max_stalled_retries: u32,
    /// How long terminal jobs stay queryable before the reaper removes them.
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
    pub reap_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_endpoint: Option<String>,
    pub local_root: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeConfig {
    pub base_url: String,
    /// Flat override for every modality; unset means per-modality defaults.
    pub timeout_override_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatch_quota(&self) -> NonZeroU32 {
        NonZeroU32::new(self.dispatch_per_minute.max(1)).unwrap_or(NonZeroU32::MIN)
    }
}

impl QueueConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[cfg(test)]
impl Config {
    /// Fixed in-memory defaults for router tests; reads no environment.
    pub(crate) fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                cors_allowed_origins: vec!["*".to_string()],
            },
            worker: WorkerConfig {
                concurrency: 2,
                dispatch_per_minute: 600,
                poll_interval_ms: 25,
                scratch_dir: std::env::temp_dir()
                    .join("oxidized-geo-tests")
                    .to_string_lossy()
                    .into_owned(),
            },
            queue: QueueConfig {
                max_attempts: 3,
                backoff_base_ms: 10,
                backoff_cap_ms: 100,
                stall_timeout_secs: 60,
                max_stalled_retries: 1,
                retention_secs: 3600,
                reap_interval_secs: 60,
                reap_batch: 100,
            },
            storage: StorageConfig {
                provider: "local".to_string(),
                s3_bucket: String::new(),
                s3_region: "us-east-1".to_string(),
                s3_access_key_id: None,
                s3_secret_access_key: None,
                s3_endpoint: None,
                local_root: std::env::temp_dir()
                    .join("oxidized-geo-tests/blobs")
                    .to_string_lossy()
                    .into_owned(),
                timeout_secs: 5,
            },
            compute: ComputeConfig {
                base_url: "http://localhost:5001".to_string(),
                timeout_override_secs: None,
            },
            knowledge: KnowledgeConfig {
                base_url: "http://localhost:7700".to_string(),
                timeout_secs: 2,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "*".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            worker: WorkerConfig {
                concurrency: env::var("WORKER_CONCURRENCY")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
                dispatch_per_minute: env::var("DISPATCH_PER_MINUTE")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()?,
                poll_interval_ms: env::var("POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "250".to_string())
                    .parse()?,
                scratch_dir: env::var("SCRATCH_DIR")
                    .unwrap_or_else(|_| "/tmp/oxidized-geo".to_string()),
            },
            queue: QueueConfig {
                max_attempts: env::var("QUEUE_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                backoff_base_ms: env::var("BACKOFF_BASE_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()?,
                backoff_cap_ms: env::var("BACKOFF_CAP_MS")
                    .unwrap_or_else(|_| "60000".to_string())
                    .parse()?,
                stall_timeout_secs: env::var("STALL_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()?,
                max_stalled_retries: env::var("MAX_STALLED_RETRIES")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
                retention_secs: env::var("JOB_RETENTION_SECS")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()?,
                reap_interval_secs: env::var("REAP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
                reap_batch: env::var("REAP_BATCH")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()?,
            },
            storage: StorageConfig {
                provider: env::var("STORAGE_PROVIDER").unwrap_or_else(|_| "local".to_string()),
                s3_bucket: env::var("S3_BUCKET").unwrap_or_default(),
                s3_region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                s3_access_key_id: env::var("AWS_ACCESS_KEY_ID").ok(),
                s3_secret_access_key: env::var("AWS_SECRET_ACCESS_KEY").ok(),
                s3_endpoint: env::var("S3_ENDPOINT").ok(),
                local_root: env::var("STORAGE_LOCAL_ROOT")
                    .unwrap_or_else(|_| "/tmp/oxidized-geo/blobs".to_string()),
                timeout_secs: env::var("STORAGE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
            },
            compute: ComputeConfig {
                base_url: env::var("COMPUTE_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:5001".to_string()),
                timeout_override_secs: env::var("COMPUTE_TIMEOUT_SECS")
                    .ok()
                    .map(|v| v.parse())
                    .transpose()?,
            },
            knowledge: KnowledgeConfig {
                base_url: env::var("KNOWLEDGE_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:7700".to_string()),
                timeout_secs: env::var("KNOWLEDGE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
        })
    }
}
