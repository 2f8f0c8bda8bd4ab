//! HTTP handlers served by the worker when payloads live on local disk.

pub mod download_handlers;
pub mod health_handlers;

use crate::{services::backup_repository::BackupRepository, storage::FsStorage};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: FsStorage,
    pub repo: BackupRepository,
}
