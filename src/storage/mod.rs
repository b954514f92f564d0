//! Blob storage gateway
//!
//! Pipelines read source imagery and write result artifacts through the
//! `BlobStore` trait. References are opaque scheme-prefixed strings
//! (`s3://bucket/key`, `file:///path`) minted by the backend that stored the
//! object; callers pass them back verbatim.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod local;
pub mod s3;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob reference: {0}")]
    InvalidRef(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(#[from] ::s3::error::S3Error),
}

impl BlobError {
    /// Missing objects and malformed references will not heal on retry;
    /// transport and backend trouble might.
    pub fn retryable(&self) -> bool {
        match self {
            BlobError::NotFound(_) | BlobError::InvalidRef(_) => false,
            BlobError::Io(_) => true,
            BlobError::Backend(::s3::error::S3Error::HttpFailWithBody(status, _)) => {
                *status >= 500
            }
            BlobError::Backend(_) => true,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the reference for later reads.
    async fn upload(&self, key: &str, bytes: Bytes, content_type: &str)
        -> Result<String, BlobError>;

    async fn download(&self, reference: &str) -> Result<Bytes, BlobError>;

    /// A URL a client can fetch the object from for `expiry_secs`.
    async fn share_url(&self, reference: &str, expiry_secs: u32) -> Result<String, BlobError>;

    async fn delete(&self, reference: &str) -> Result<(), BlobError>;
}

/// Build the configured backend. `STORAGE_PROVIDER=s3` selects the bucket
/// client; anything else falls back to the local filesystem store.
pub fn create_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.provider.as_str() {
        "s3" => Ok(Arc::new(S3BlobStore::from_config(config)?)),
        _ => Ok(Arc::new(LocalBlobStore::new(&config.local_root))),
    }
}
