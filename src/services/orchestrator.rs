//! Per-run coordination of backups and retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    errors::{BackupError, BackupResult},
    models::{backup::Backup, workload::Workload},
    platform::{directory::WorkloadDirectory, jobs::JobRunner},
    services::{
        backup_repository::BackupRepository, retention::RetentionPolicy,
        scheduler::ScheduledRun, transfer::TransferPipe,
    },
    storage::{Storage, StorageError, object_key},
};

/// Outcome of one [`Orchestrator::run_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Workloads without the database marker.
    pub skipped: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Backups removed by the retention sweeps.
    pub discarded: usize,
    /// Sweeps that failed outright plus backups a sweep could not remove.
    pub sweep_failures: usize,
}

/// Outcome of sweeping one app.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub kept: usize,
    pub discarded: usize,
    pub failures: usize,
}

pub struct Orchestrator {
    directory: Arc<dyn WorkloadDirectory>,
    runner: Arc<dyn JobRunner>,
    storage: Arc<dyn Storage>,
    repo: BackupRepository,
    pipe: TransferPipe,
    retention: RetentionPolicy,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<dyn WorkloadDirectory>,
        runner: Arc<dyn JobRunner>,
        storage: Arc<dyn Storage>,
        repo: BackupRepository,
    ) -> Self {
        Self {
            directory,
            runner,
            storage,
            repo,
            pipe: TransferPipe::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_pipe(mut self, pipe: TransferPipe) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn repository(&self) -> &BackupRepository {
        &self.repo
    }

    /// Back up every workload that carries a database, then sweep them.
    ///
    /// Only a directory failure fails the run; per-workload failures are
    /// logged and counted.
    pub async fn run_all(&self) -> BackupResult<RunSummary> {
        let workloads = self.directory.list().await?;
        let mut summary = RunSummary::default();

        let (targets, skipped): (Vec<Workload>, Vec<Workload>) =
            workloads.into_iter().partition(Workload::has_database);
        summary.skipped = skipped.len();
        info!(
            "starting backup run: {} workloads with a database, {} skipped",
            targets.len(),
            summary.skipped
        );

        for workload in &targets {
            summary.attempted += 1;
            match self.run_one(workload).await {
                Ok(backup) => {
                    summary.succeeded += 1;
                    info!(
                        "backed up {} ({}): backup {} with {} bytes",
                        workload.name,
                        workload.app_id,
                        backup.backup_id,
                        backup.bytes().unwrap_or_default()
                    );
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(
                        "backup of {} ({}) failed: {}",
                        workload.name, workload.app_id, err
                    );
                }
            }
        }

        let now = Utc::now();
        for workload in &targets {
            match self.sweep(&workload.app_id, now).await {
                Ok(report) => {
                    summary.discarded += report.discarded;
                    summary.sweep_failures += report.failures;
                }
                Err(err) => {
                    summary.sweep_failures += 1;
                    error!(
                        "retention sweep of {} ({}) failed: {}",
                        workload.name, workload.app_id, err
                    );
                }
            }
        }

        info!("backup run finished: {:?}", summary);
        Ok(summary)
    }

    /// Dump one workload's database into storage.
    ///
    /// On failure the record is left uncompleted; the sweep reclaims it once
    /// it is old enough to count as abandoned.
    pub async fn run_one(&self, workload: &Workload) -> BackupResult<Backup> {
        let connection = workload.connection()?;
        object_key(&workload.app_id, Uuid::nil())
            .map_err(|err| BackupError::Configuration(err.to_string()))?;

        let mut backup = self.repo.create(&workload.app_id).await?;
        info!(
            "starting backup {} of {} ({})",
            backup.backup_id, workload.name, workload.app_id
        );

        let job = self
            .runner
            .start(workload, &connection)
            .await
            .map_err(|err| BackupError::unavailable("job runner", err))?;

        let storage = self.storage.clone();
        let app_id = backup.app_id.clone();
        let backup_id = backup.backup_id;
        let bytes = self
            .pipe
            .transfer(job, move |stream| async move {
                storage.put(&app_id, backup_id, stream).await
            })
            .await?;

        self.repo.complete(&mut backup, bytes).await?;
        Ok(backup)
    }

    /// Apply the retention policy to every backup of `app_id` as of `now`.
    pub async fn sweep(&self, app_id: &str, now: DateTime<Utc>) -> BackupResult<SweepReport> {
        let mut report = SweepReport::default();
        for backup in self.repo.list_by_app(app_id).await? {
            if !self.retention.discards(&backup, now) {
                report.kept += 1;
                continue;
            }
            match self.discard(&backup).await {
                Ok(()) => {
                    report.discarded += 1;
                    info!("discarded backup {} of {}", backup.backup_id, app_id);
                }
                Err(err) => {
                    report.failures += 1;
                    error!(
                        "discarding backup {} of {} failed: {}",
                        backup.backup_id, app_id, err
                    );
                }
            }
        }
        Ok(report)
    }

    /// Remove a backup's payload, then its record.
    ///
    /// The record survives a failed storage delete so the next sweep retries.
    pub async fn discard(&self, backup: &Backup) -> BackupResult<()> {
        match self.storage.delete(&backup.app_id, backup.backup_id).await {
            Ok(()) => {}
            // no payload can exist under a key that was never writable
            Err(StorageError::InvalidAppId(app_id)) => {
                warn!("app id `{}` has no valid object key", app_id);
            }
            Err(err) => return Err(BackupError::unavailable("storage", err)),
        }
        self.repo.delete(backup).await
    }

    /// Backups of the app named `app_name`, oldest first.
    pub async fn backups_for(&self, app_name: &str) -> BackupResult<Vec<Backup>> {
        let workload = self
            .directory
            .find(app_name)
            .await?
            .ok_or_else(|| BackupError::UnknownApp(app_name.to_string()))?;
        self.repo.list_by_app(&workload.app_id).await
    }

    /// A download URL for a completed backup.
    pub async fn download_url(&self, backup_id: Uuid) -> BackupResult<String> {
        let backup = self.find(backup_id).await?;
        if !backup.is_completed() {
            return Err(BackupError::Inconsistent(
                backup_id,
                "backup has not completed".into(),
            ));
        }
        self.storage
            .signed_url(&backup.app_id, backup.backup_id)
            .await
            .map_err(|err| BackupError::unavailable("storage", err))
    }

    /// Operator deletion of a single backup, whatever the retention policy says.
    pub async fn delete(&self, backup_id: Uuid) -> BackupResult<Backup> {
        let backup = self.find(backup_id).await?;
        self.discard(&backup).await?;
        Ok(backup)
    }

    async fn find(&self, backup_id: Uuid) -> BackupResult<Backup> {
        self.repo
            .get(backup_id)
            .await?
            .ok_or(BackupError::NotFound(backup_id))
    }
}

#[async_trait]
impl ScheduledRun for Orchestrator {
    async fn run(&self) {
        if let Err(err) = self.run_all().await {
            error!("backup run failed: {}", err);
        }
    }
}
