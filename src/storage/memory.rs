use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use uuid::Uuid;

use super::{ByteStream, Storage, StorageError, StorageResult, object_key};

/// In-memory [`Storage`] used by tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Bytes>>,
    fail_deletes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_id: &str, backup_id: Uuid) -> Option<Bytes> {
        let key = object_key(app_id, backup_id).ok()?;
        self.objects.lock().unwrap().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Make every subsequent delete fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(
        &self,
        app_id: &str,
        backup_id: Uuid,
        mut stream: ByteStream,
    ) -> StorageResult<u64> {
        let key = object_key(app_id, backup_id)?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let len = buf.len() as u64;
        self.objects.lock().unwrap().insert(key, buf.freeze());
        Ok(len)
    }

    async fn delete(&self, app_id: &str, backup_id: Uuid) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("delete refused")));
        }
        let key = object_key(app_id, backup_id)?;
        self.objects.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn signed_url(&self, app_id: &str, backup_id: Uuid) -> StorageResult<String> {
        Ok(format!("memory://{}", object_key(app_id, backup_id)?))
    }
}
