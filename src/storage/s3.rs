//! S3 storage backend.

use async_trait::async_trait;
use axum::http::Method;
use futures::StreamExt;
use object_store::{
    ObjectStore, RetryConfig,
    aws::{AmazonS3, AmazonS3Builder},
    buffered::BufWriter,
    path::Path,
    signer::Signer,
};
use std::{io, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ByteStream, Storage, StorageError, StorageResult, object_key};

/// Bytes buffered before the upload switches to multipart.
const UPLOAD_BUFFER: usize = 10 * 1024 * 1024;

/// A multipart upload in progress. Dropping it before [`finish`] aborts the
/// upload in the background.
///
/// [`finish`]: PendingUpload::finish
struct PendingUpload {
    writer: Option<BufWriter>,
    path: Path,
}

impl PendingUpload {
    fn new(store: Arc<dyn ObjectStore>, path: Path, capacity: usize) -> Self {
        Self {
            writer: Some(BufWriter::with_capacity(store, path.clone(), capacity)),
            path,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(buf).await,
            None => Err(io::Error::other("upload already finished")),
        }
    }

    /// Complete the upload and make the object visible.
    async fn finish(mut self) -> StorageResult<()> {
        // a writer that has started shutting down can no longer be aborted
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn abort(mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.abort().await {
                warn!("failed to abort upload of {}: {}", self.path, err);
            }
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match writer.abort().await {
                        Ok(()) => debug!("aborted interrupted upload of {}", path),
                        Err(err) => warn!("failed to abort upload of {}: {}", path, err),
                    }
                });
            }
            Err(_) => warn!("upload of {} dropped outside a runtime, not aborted", path),
        }
    }
}

/// S3-backed implementation of [`Storage`].
///
/// Uploads go through a buffered multipart writer, so memory stays bounded by
/// the part size no matter how large the dump is.
#[derive(Clone)]
pub struct S3Storage {
    store: Arc<AmazonS3>,
    url_ttl: Duration,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3Storage<{}>", self.store)
    }
}

impl S3Storage {
    pub fn new(store: AmazonS3, url_ttl: Duration) -> Self {
        Self {
            store: Arc::new(store),
            url_ttl,
        }
    }

    /// Build a client for `bucket` using the standard `AWS_*` environment
    /// variables for credentials, region and endpoint.
    pub fn from_env(bucket: &str, url_ttl: Duration) -> StorageResult<Self> {
        if bucket.is_empty() {
            return Err(StorageError::NotConfigured("empty bucket name".into()));
        }
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_retry(RetryConfig::default())
            .build()?;
        Ok(Self::new(store, url_ttl))
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(
        &self,
        app_id: &str,
        backup_id: Uuid,
        mut stream: ByteStream,
    ) -> StorageResult<u64> {
        let path = Path::from(object_key(app_id, backup_id)?);
        let store: Arc<dyn ObjectStore> = self.store.clone();
        let mut upload = PendingUpload::new(store, path.clone(), UPLOAD_BUFFER);

        let mut size_bytes: u64 = 0;
        while let Some(chunk_res) = stream.next().await {
            let written = match chunk_res {
                Ok(chunk) => {
                    size_bytes += chunk.len() as u64;
                    upload.write_all(&chunk).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                upload.abort().await;
                return Err(StorageError::Io(err));
            }
        }
        upload.finish().await?;

        debug!("uploaded {} ({} bytes)", path, size_bytes);
        Ok(size_bytes)
    }

    async fn delete(&self, app_id: &str, backup_id: Uuid) -> StorageResult<()> {
        let path = Path::from(object_key(app_id, backup_id)?);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!("object {} already missing", path);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn signed_url(&self, app_id: &str, backup_id: Uuid) -> StorageResult<String> {
        let path = Path::from(object_key(app_id, backup_id)?);
        let url = self
            .store
            .signed_url(Method::GET, &path, self.url_ttl)
            .await?;
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn storage() -> S3Storage {
        let store = AmazonS3Builder::new()
            .with_bucket_name("flynn-pgbackups")
            .with_region("us-east-1")
            .with_access_key_id("AKIDEXAMPLE")
            .with_secret_access_key("secret")
            .build()
            .unwrap();
        S3Storage::new(store, Duration::from_secs(900))
    }

    #[tokio::test]
    async fn presigns_object_key() {
        let id = Uuid::nil();
        let url = storage().signed_url("app1", id).await.unwrap();
        assert!(url.contains("flynn-pgbackups"));
        assert!(url.contains(&format!("pgbackups/app1/{id}.backup")));
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn finished_upload_is_visible() {
        let store = Arc::new(InMemory::new());
        let path = Path::from("pgbackups/app1/done.backup");
        let mut upload = PendingUpload::new(store.clone(), path.clone(), 16);
        upload.write_all(&[7; 40]).await.unwrap();
        upload.finish().await.unwrap();

        let meta = store.head(&path).await.unwrap();
        assert_eq!(meta.size, 40);
    }

    #[tokio::test]
    async fn dropped_upload_is_never_visible() {
        let store = Arc::new(InMemory::new());
        let path = Path::from("pgbackups/app1/partial.backup");
        let mut upload = PendingUpload::new(store.clone(), path.clone(), 16);
        // past the buffer, so a multipart upload is in flight
        upload.write_all(&[7; 40]).await.unwrap();
        drop(upload);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            store.head(&path).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }

    #[test]
    fn empty_bucket_is_a_config_error() {
        let err = S3Storage::from_env("", Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, StorageError::NotConfigured(_)));
    }
}
