//! Metadata records for backup attempts, persisted in SQLite.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::{BackupError, BackupResult},
    models::backup::Backup,
};

const COLUMNS: &str = "app_id, backup_id, started_at, completed_at, byte_count";

/// CRUD over [`Backup`] rows.
///
/// Every operation is a single statement, so concurrent callers only rely on
/// SQLite's own locking.
#[derive(Clone)]
pub struct BackupRepository {
    pub db: Arc<SqlitePool>,
}

impl BackupRepository {
    /// Wrap `db` and bring its schema up to date.
    pub async fn new(db: Arc<SqlitePool>) -> BackupResult<Self> {
        sqlx::migrate!("./migrations").run(&*db).await?;
        Ok(Self { db })
    }

    /// Insert a new, uncompleted backup for `app_id`.
    pub async fn create(&self, app_id: &str) -> BackupResult<Backup> {
        let backup = Backup {
            app_id: app_id.to_string(),
            backup_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            byte_count: 0,
        };

        sqlx::query(
            "INSERT INTO backups (app_id, backup_id, started_at, completed_at, byte_count) \
             VALUES (?, ?, ?, NULL, 0)",
        )
        .bind(&backup.app_id)
        .bind(backup.backup_id)
        .bind(backup.started_at)
        .execute(&*self.db)
        .await?;

        debug!("created backup {} for app {}", backup.backup_id, app_id);
        Ok(backup)
    }

    pub async fn get(&self, backup_id: Uuid) -> BackupResult<Option<Backup>> {
        let backup = sqlx::query_as::<_, Backup>(&format!(
            "SELECT {COLUMNS} FROM backups WHERE backup_id = ?"
        ))
        .bind(backup_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(backup)
    }

    /// All backups of an app, oldest first.
    pub async fn list_by_app(&self, app_id: &str) -> BackupResult<Vec<Backup>> {
        let backups = sqlx::query_as::<_, Backup>(&format!(
            "SELECT {COLUMNS} FROM backups WHERE app_id = ? ORDER BY started_at, backup_id"
        ))
        .bind(app_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(backups)
    }

    /// Mark `backup` as successfully transferred with `bytes` stored.
    ///
    /// Only an uncompleted row is updated; completing a backup twice is an
    /// [`BackupError::Inconsistent`] error and leaves the first completion in place.
    pub async fn complete(&self, backup: &mut Backup, bytes: u64) -> BackupResult<()> {
        let byte_count = i64::try_from(bytes).map_err(|_| {
            BackupError::Inconsistent(backup.backup_id, format!("byte count {bytes} overflows"))
        })?;
        let completed_at = Utc::now();

        let result = sqlx::query(
            "UPDATE backups SET completed_at = ?, byte_count = ? \
             WHERE backup_id = ? AND completed_at IS NULL",
        )
        .bind(completed_at)
        .bind(byte_count)
        .bind(backup.backup_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::Inconsistent(
                backup.backup_id,
                "already completed or no longer recorded".into(),
            ));
        }

        backup.completed_at = Some(completed_at);
        backup.byte_count = byte_count;
        Ok(())
    }

    pub async fn delete(&self, backup: &Backup) -> BackupResult<()> {
        let result = sqlx::query("DELETE FROM backups WHERE backup_id = ?")
            .bind(backup.backup_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(backup.backup_id));
        }
        Ok(())
    }

    /// Cheap connectivity check used by readiness probes.
    pub async fn ping(&self) -> BackupResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
