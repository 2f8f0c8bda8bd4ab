//! Represents a single backup attempt and its metadata record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One dump attempt for a workload.
///
/// The row is inserted before any bytes move and is only marked complete once
/// the transfer into storage succeeded. The stored payload lives in the
/// storage gateway under a key derived from `app_id` and `backup_id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Backup {
    /// Identifier of the owning workload. Many backups share one app.
    pub app_id: String,

    /// Globally unique identifier, generated at creation.
    pub backup_id: Uuid,

    /// When the attempt started. Never changes after insert.
    pub started_at: DateTime<Utc>,

    /// When the transfer finished successfully, if it did.
    pub completed_at: Option<DateTime<Utc>>,

    /// Raw byte count column. Use [`Backup::bytes`] instead of reading this directly.
    pub byte_count: i64,
}

impl Backup {
    /// Whether the transfer for this backup finished.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Size of the stored dump.
    ///
    /// `None` while the backup is in flight or after a failed transfer; the
    /// column default of zero must not be read as a successful empty dump.
    pub fn bytes(&self) -> Option<u64> {
        self.completed_at
            .and_then(|_| u64::try_from(self.byte_count).ok())
    }
}
