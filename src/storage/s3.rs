//! S3-compatible blob backend
//!
//! One bucket per deployment. Works against AWS or any S3-compatible
//! endpoint (MinIO, Ceph) via `S3_ENDPOINT`, which also switches the
//! client to path-style addressing.

use async_trait::async_trait;
use bytes::Bytes;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tracing::debug;

use super::{BlobError, BlobStore};
use crate::config::StorageConfig;

pub struct S3BlobStore {
    bucket: Box<Bucket>,
    bucket_name: String,
}

impl S3BlobStore {
    pub fn from_config(config: &StorageConfig) -> anyhow::Result<Self> {
        let region = match &config.s3_endpoint {
            Some(endpoint) => Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.trim_end_matches('/').to_string(),
            },
            None => config
                .s3_region
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid s3 region: {}", config.s3_region))?,
        };

        let credentials = match (&config.s3_access_key_id, &config.s3_secret_access_key) {
            (Some(key), Some(secret)) => {
                Credentials::new(Some(key), Some(secret), None, None, None)?
            }
            // Fall through to the ambient chain (env vars, profile, role).
            _ => Credentials::default()?,
        };

        let mut bucket = Bucket::new(&config.s3_bucket, region, credentials)?;
        if config.s3_endpoint.is_some() {
            bucket = bucket.with_path_style();
        }
        bucket = bucket.with_request_timeout(std::time::Duration::from_secs(config.timeout_secs))?;

        Ok(Self {
            bucket: Box::new(bucket),
            bucket_name: config.s3_bucket.clone(),
        })
    }

    fn reference_for(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, key)
    }

    /// Accepts refs this store minted (`s3://{bucket}/{key}`) as well as bare
    /// keys within the configured bucket.
    fn key_of(&self, reference: &str) -> Result<String, BlobError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BlobError::InvalidRef("empty reference".to_string()));
        }
        if let Some(rest) = reference.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| BlobError::InvalidRef(reference.to_string()))?;
            if bucket != self.bucket_name {
                return Err(BlobError::InvalidRef(format!(
                    "{} is outside bucket {}",
                    reference, self.bucket_name
                )));
            }
            if key.is_empty() {
                return Err(BlobError::InvalidRef(reference.to_string()));
            }
            return Ok(key.to_string());
        }
        if reference.contains("://") {
            return Err(BlobError::InvalidRef(reference.to_string()));
        }
        Ok(reference.trim_start_matches('/').to_string())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, BlobError> {
        self.bucket
            .put_object_with_content_type(key, &bytes, content_type)
            .await?;
        debug!(key, size = bytes.len(), "object uploaded");
        Ok(self.reference_for(key))
    }

    async fn download(&self, reference: &str) -> Result<Bytes, BlobError> {
        let key = self.key_of(reference)?;
        match self.bucket.get_object(&key).await {
            Ok(response) => Ok(response.bytes().clone()),
            Err(S3Error::HttpFailWithBody(404, _)) => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn share_url(&self, reference: &str, expiry_secs: u32) -> Result<String, BlobError> {
        let key = self.key_of(reference)?;
        Ok(self.bucket.presign_get(&key, expiry_secs, None).await?)
    }

    async fn delete(&self, reference: &str) -> Result<(), BlobError> {
        let key = self.key_of(reference)?;
        self.bucket.delete_object(&key).await?;
        Ok(())
    }
}
