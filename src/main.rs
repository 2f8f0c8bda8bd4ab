use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, future::IntoFuture, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod platform;
mod routes;
mod services;
mod storage;

use config::{AppConfig, Command, StorageBackend};
use handlers::AppState;
use platform::{directory::ControllerDirectory, jobs::PgDumpRunner};
use services::{
    backup_repository::BackupRepository,
    orchestrator::Orchestrator,
    retention::RetentionPolicy,
    scheduler::Scheduler,
    transfer::TransferPipe,
};
use storage::{FsStorage, S3Storage, Storage, UrlSigner};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + subcommand ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting pg-backups with config: {:?}", cfg);

    let repo = BackupRepository::new(connect(&cfg.database_url).await?)
        .await
        .context("preparing metadata store")?;
    let (storage, fs_storage) = build_storage(&cfg)?;
    let orchestrator = Arc::new(build_orchestrator(&cfg, repo.clone(), storage)?);

    match command {
        Command::Worker => worker(&cfg, orchestrator, fs_storage, repo).await,
        Command::Run => {
            let summary = orchestrator.run_all().await?;
            if summary.failed > 0 || summary.sweep_failures > 0 {
                anyhow::bail!(
                    "{} of {} backups failed, {} sweep failures",
                    summary.failed,
                    summary.attempted,
                    summary.sweep_failures
                );
            }
            Ok(())
        }
        Command::List { app_name } => {
            for backup in orchestrator.backups_for(&app_name).await? {
                let completed = backup
                    .completed_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                let bytes = backup
                    .bytes()
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}\t{}\t{}\t{}",
                    backup.backup_id,
                    backup.started_at.to_rfc3339(),
                    completed,
                    bytes
                );
            }
            Ok(())
        }
        Command::Url { backup_id } => {
            println!("{}", orchestrator.download_url(backup_id).await?);
            Ok(())
        }
        Command::Delete { backup_id } => {
            let backup = orchestrator.delete(backup_id).await?;
            tracing::info!("deleted backup {} of app {}", backup.backup_id, backup.app_id);
            Ok(())
        }
    }
}

/// Open the SQLite pool, creating the database file and its directory.
async fn connect(db_url: &str) -> Result<Arc<sqlx::SqlitePool>> {
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;
    Ok(Arc::new(pool))
}

/// The configured storage backend, plus the disk backend again when the
/// worker has to serve downloads from it.
fn build_storage(cfg: &AppConfig) -> Result<(Arc<dyn Storage>, Option<FsStorage>)> {
    match &cfg.storage {
        StorageBackend::Fs { dir } => {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                tracing::info!("Created storage directory at {}", dir.display());
            }
            let signer = match &cfg.signing {
                Some(signing) => Some(UrlSigner::new(
                    signing.key.as_bytes(),
                    signing.public_url.clone(),
                    cfg.url_expiry,
                )?),
                None => None,
            };
            let fs_storage = FsStorage::new(dir.clone(), signer);
            Ok((Arc::new(fs_storage.clone()), Some(fs_storage)))
        }
        StorageBackend::S3 { bucket } => {
            let s3 = S3Storage::from_env(bucket, cfg.url_expiry)?;
            tracing::info!("Storing backups in {:?}", s3);
            Ok((Arc::new(s3), None))
        }
    }
}

fn build_orchestrator(
    cfg: &AppConfig,
    repo: BackupRepository,
    storage: Arc<dyn Storage>,
) -> Result<Orchestrator> {
    let controller = cfg.require_controller()?;
    let directory = ControllerDirectory::new(
        &controller.url,
        &controller.key,
        controller.tls_pin.as_deref(),
    )?;
    let runner = PgDumpRunner::new(cfg.pg_dump_bin.clone());

    Ok(
        Orchestrator::new(Arc::new(directory), Arc::new(runner), storage, repo)
            .with_pipe(TransferPipe::default().with_deadline(cfg.transfer_timeout))
            .with_retention(RetentionPolicy::new(cfg.abandoned_after)),
    )
}

/// Run backups on the schedule until the process is stopped. With disk
/// storage the download and health endpoints are served alongside.
async fn worker(
    cfg: &AppConfig,
    orchestrator: Arc<Orchestrator>,
    fs_storage: Option<FsStorage>,
    repo: BackupRepository,
) -> Result<()> {
    let scheduler = Scheduler::new(&cfg.schedule, cfg.single_flight, orchestrator)?;
    tracing::info!("Scheduling backups with `{}`", cfg.schedule);
    let trigger = scheduler.start();

    let Some(storage) = fs_storage else {
        trigger.await?;
        return Ok(());
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState { storage, repo });
    let listener = bind(&cfg.listen_addr).await?;
    tracing::info!("Server listening on http://{}", listener.local_addr()?);

    tokio::select! {
        res = trigger => res?,
        res = axum::serve(listener, app).into_future() => res?,
    }
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == ErrorKind::PermissionDenied && addr.starts_with("0.0.0.0:") => {
            let fallback_addr = addr.replacen("0.0.0.0", "127.0.0.1", 1);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            Ok(TcpListener::bind(&fallback_addr).await?)
        }
        Err(err) => Err(err).with_context(|| format!("binding {}", addr)),
    }
}
