//! Storage gateway for backup payloads.
//!
//! The orchestrator only sees the [`Storage`] trait. Payloads are addressed by
//! `pgbackups/{app_id}/{backup_id}.backup`, one object per backup.

mod fs;
#[cfg(test)]
mod memory;
mod s3;

pub use fs::{FsStorage, UrlSigner};
#[cfg(test)]
pub use memory::MemoryStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin};
use thiserror::Error;
use uuid::Uuid;

/// Stream of payload chunks handed to [`Storage::put`].
///
/// An `Err` item means the producer failed and the upload must be abandoned.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const KEY_PREFIX: &str = "pgbackups";
const MAX_APP_ID_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid app id `{0}`")]
    InvalidAppId(String),
    #[error("download signature is invalid")]
    InvalidSignature,
    #[error("download url has expired")]
    UrlExpired,
    #[error("storage is not configured: {0}")]
    NotConfigured(String),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable object storage for backup payloads.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream a payload into storage, returning the number of bytes written.
    ///
    /// The object must not become visible unless the whole stream was
    /// consumed without an error item.
    async fn put(&self, app_id: &str, backup_id: Uuid, stream: ByteStream) -> StorageResult<u64>;

    /// Remove a payload. Deleting a missing object succeeds.
    async fn delete(&self, app_id: &str, backup_id: Uuid) -> StorageResult<()>;

    /// A time-limited URL from which the payload can be downloaded.
    async fn signed_url(&self, app_id: &str, backup_id: Uuid) -> StorageResult<String>;
}

/// Object key for a backup payload.
///
/// App ids come from the platform and are treated as opaque, but they end up
/// in paths and download URLs, so anything that would need escaping is rejected.
pub fn object_key(app_id: &str, backup_id: Uuid) -> StorageResult<String> {
    if app_id.is_empty()
        || app_id.len() > MAX_APP_ID_LEN
        || app_id.contains('/')
        || app_id.contains("..")
        || app_id
            .bytes()
            .any(|b| b.is_ascii_control() || matches!(b, b'\\' | b'?' | b'#' | b'%' | b' '))
    {
        return Err(StorageError::InvalidAppId(app_id.to_string()));
    }
    Ok(format!("{KEY_PREFIX}/{app_id}/{backup_id}.backup"))
}
