//! Local filesystem blob backend
//!
//! Development and single-node fallback. Objects live under one root
//! directory; minted references carry the absolute path (`file:///...`) and
//! bare keys are resolved inside the root, with path traversal rejected.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{BlobError, BlobStore};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn reference_for(&self, path: &Path) -> String {
        format!("file://{}", path.display())
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, BlobError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BlobError::InvalidRef("empty reference".to_string()));
        }
        if let Some(path) = reference.strip_prefix("file://") {
            let path = PathBuf::from(path);
            if !path.starts_with(&self.root) {
                return Err(BlobError::InvalidRef(format!(
                    "{} is outside the storage root",
                    reference
                )));
            }
            return Ok(path);
        }
        if reference.contains("://") {
            return Err(BlobError::InvalidRef(reference.to_string()));
        }
        self.join_key(reference)
    }

    /// Keys may contain nested directories but never traversal or absolute
    /// components.
    fn join_key(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::InvalidRef(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, BlobError> {
        let path = self.join_key(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "blob written");
        Ok(self.reference_for(&path))
    }

    async fn download(&self, reference: &str) -> Result<Bytes, BlobError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes.into()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn share_url(&self, reference: &str, _expiry_secs: u32) -> Result<String, BlobError> {
        // No signing locally; hand back the file reference itself.
        let path = self.resolve(reference)?;
        Ok(self.reference_for(&path))
    }

    async fn delete(&self, reference: &str) -> Result<(), BlobError> {
        let path = self.resolve(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let reference = store
            .upload(
                "jobs/j1/analysis.json",
                Bytes::from_static(b"{\"k\":1}"),
                "application/json",
            )
            .await
            .unwrap();
        assert!(reference.starts_with("file://"));
        assert!(reference.ends_with("jobs/j1/analysis.json"));

        let bytes = store.download(&reference).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"{\"k\":1}"));

        // A bare key resolves to the same object.
        let bytes = store.download("jobs/j1/analysis.json").await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"{\"k\":1}"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let err = store.download("jobs/absent.bin").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_traversal_and_foreign_refs_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        for bad in ["../etc/passwd", "a/../../b", "s3://bucket/key", "file:///elsewhere/x"] {
            let err = store.download(bad).await.unwrap_err();
            assert!(matches!(err, BlobError::InvalidRef(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_delete_removes_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let reference = store
            .upload("report.md", Bytes::from_static(b"# report"), "text/markdown")
            .await
            .unwrap();
        store.delete(&reference).await.unwrap();
        assert!(matches!(
            store.download(&reference).await.unwrap_err(),
            BlobError::NotFound(_)
        ));
    }
}
