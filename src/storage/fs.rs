//! Local disk storage for backup payloads.
//!
//! Payloads are sharded beneath `base_path/{shard}/{shard}/{key}` so no single
//! directory grows with the number of apps. Downloads are served by the
//! worker's HTTP endpoint behind HMAC-signed, expiring URLs.

use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use async_trait::async_trait;

use super::{ByteStream, Storage, StorageError, StorageResult, object_key};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies download URLs for [`FsStorage`].
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    public_url: String,
    ttl: Duration,
}

impl UrlSigner {
    /// `public_url` is the externally reachable base of the worker's HTTP
    /// listener; `ttl` is how long a generated URL stays valid.
    pub fn new(key: &[u8], public_url: impl Into<String>, ttl: Duration) -> StorageResult<Self> {
        if key.is_empty() {
            return Err(StorageError::NotConfigured("empty signing key".into()));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|err| StorageError::NotConfigured(err.to_string()))?;
        Ok(Self {
            mac,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            ttl,
        })
    }

    fn signature(&self, key: &str, expires: i64) -> String {
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a download URL valid until `ttl` from now.
    pub fn sign(&self, app_id: &str, backup_id: Uuid) -> StorageResult<String> {
        let key = object_key(app_id, backup_id)?;
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        Ok(format!(
            "{}/downloads/{}/{}?expires={}&signature={}",
            self.public_url,
            app_id,
            backup_id,
            expires,
            self.signature(&key, expires)
        ))
    }

    /// Check a signature produced by [`UrlSigner::sign`] against `now` (unix seconds).
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> StorageResult<()> {
        let provided = hex::decode(signature).map_err(|_| StorageError::InvalidSignature)?;
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::InvalidSignature)?;
        if now > expires {
            return Err(StorageError::UrlExpired);
        }
        Ok(())
    }
}

/// Disk-backed implementation of [`Storage`].
#[derive(Clone)]
pub struct FsStorage {
    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,

    signer: Option<UrlSigner>,
}

impl FsStorage {
    pub fn new(base_path: impl Into<PathBuf>, signer: Option<UrlSigner>) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex (00–ff).
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Combines base_path/{shard}/{shard}/{key}. Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Open a payload for a signed download.
    ///
    /// Returns the open file and its length.
    pub async fn open_signed(
        &self,
        app_id: &str,
        backup_id: Uuid,
        expires: i64,
        signature: &str,
    ) -> StorageResult<(File, u64)> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| StorageError::NotConfigured("no signing key".into()))?;
        let key = object_key(app_id, backup_id)?;
        signer.verify(&key, expires, signature, Utc::now().timestamp())?;

        let file = File::open(self.object_path(&key))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ObjectNotFound(key.clone())
                } else {
                    StorageError::Io(err)
                }
            })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Recursively remove empty directories up to the base path.
    ///
    /// Stops at the first non-empty or missing directory, or on any other
    /// I/O error.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Storage for FsStorage {
    /// Writes to a temporary file, fsyncs, then renames into place. The
    /// temporary file is removed on drop, so an error or a cancelled upload
    /// never leaves it behind.
    async fn put(
        &self,
        app_id: &str,
        backup_id: Uuid,
        mut stream: ByteStream,
    ) -> StorageResult<u64> {
        let key = object_key(app_id, backup_id)?;
        let file_path = self.object_path(&key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let (std_file, tmp_path) = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&parent)?
            .into_parts();
        let mut file = File::from_std(std_file);

        let mut size_bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tmp_path
            .persist(&file_path)
            .map_err(|err| StorageError::Io(err.error))?;

        debug!("stored {} ({} bytes)", file_path.display(), size_bytes);
        Ok(size_bytes)
    }

    async fn delete(&self, app_id: &str, backup_id: Uuid) -> StorageResult<()> {
        let key = object_key(app_id, backup_id)?;
        let file_path = self.object_path(&key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn signed_url(&self, app_id: &str, backup_id: Uuid) -> StorageResult<String> {
        match &self.signer {
            Some(signer) => signer.sign(app_id, backup_id),
            None => Err(StorageError::NotConfigured(
                "filesystem downloads need a signing key and public url".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    fn chunks(parts: Vec<io::Result<&'static [u8]>>) -> ByteStream {
        Box::pin(stream::iter(
            parts.into_iter().map(|p| p.map(Bytes::from_static)),
        ))
    }

    fn signer() -> UrlSigner {
        UrlSigner::new(b"test-key", "http://backups.local/", Duration::from_secs(60)).unwrap()
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn put_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), Some(signer()));
        let id = Uuid::new_v4();

        let written = storage
            .put("app1", id, chunks(vec![Ok(b"hello "), Ok(b"world")]))
            .await
            .unwrap();
        assert_eq!(written, 11);

        let url = storage.signed_url("app1", id).await.unwrap();
        assert!(url.starts_with(&format!("http://backups.local/downloads/app1/{id}?")));
        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");

        let (mut file, len) = storage
            .open_signed("app1", id, expires, signature)
            .await
            .unwrap();
        assert_eq!(len, 11);
        let mut body = String::new();
        file.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), None);
        let id = Uuid::new_v4();

        let err = storage
            .put(
                "app1",
                id,
                chunks(vec![Ok(b"partial"), Err(io::Error::other("pg_dump died"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));

        let key = object_key("app1", id).unwrap();
        let parent = storage.object_path(&key).parent().unwrap().to_path_buf();
        let mut entries = fs::read_dir(&parent).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_put_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), None);
        let id = Uuid::new_v4();
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"PGDMP-partial"))])
                .chain(stream::pending()),
        );

        let put = storage.put("app1", id, body);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), put)
                .await
                .is_err()
        );

        let key = object_key("app1", id).unwrap();
        let parent = storage.object_path(&key).parent().unwrap().to_path_buf();
        let mut entries = fs::read_dir(&parent).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_replaces_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), None);
        let id = Uuid::new_v4();
        storage.put("app1", id, chunks(vec![Ok(b"old")])).await.unwrap();
        storage.put("app1", id, chunks(vec![Ok(b"newer")])).await.unwrap();

        let key = object_key("app1", id).unwrap();
        let body = fs::read(storage.object_path(&key)).await.unwrap();
        assert_eq!(body, b"newer");
    }

    #[tokio::test]
    async fn delete_removes_object_and_prunes_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), None);
        let id = Uuid::new_v4();
        storage
            .put("app1", id, chunks(vec![Ok(b"data")]))
            .await
            .unwrap();

        storage.delete("app1", id).await.unwrap();

        let key = object_key("app1", id).unwrap();
        assert!(!storage.object_path(&key).exists());
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        // a second delete (e.g. a retried sweep) is not an error
        storage.delete("app1", id).await.unwrap();
    }

    #[tokio::test]
    async fn signed_url_requires_signer() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), None);
        let err = storage.signed_url("app1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotConfigured(_)));
    }

    #[test]
    fn verify_rejects_tampering_and_expiry() {
        let signer = signer();
        let key = object_key("app1", Uuid::nil()).unwrap();
        let sig = signer.signature(&key, 1_000);

        assert!(signer.verify(&key, 1_000, &sig, 999).is_ok());
        assert!(matches!(
            signer.verify(&key, 1_001, &sig, 999),
            Err(StorageError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify(&key, 1_000, "zz", 999),
            Err(StorageError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify(&key, 1_000, &sig, 1_001),
            Err(StorageError::UrlExpired)
        ));
    }
}
