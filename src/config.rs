use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

use crate::services::scheduler::DEFAULT_SCHEDULE;

const DEFAULT_DATABASE_URL: &str = "sqlite://./data/pgbackups.db";
const DEFAULT_STORAGE_DIR: &str = "./data/backups";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PG_DUMP: &str = "pg_dump";
const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const DEFAULT_ABANDONED_AFTER_HOURS: u64 = 48;
const DEFAULT_URL_EXPIRY_SECS: u64 = 60 * 60;

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled PostgreSQL backups for platform apps")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Metadata database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Store payloads on local disk under this directory (overrides STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Store payloads in this S3 bucket instead of on disk (overrides S3_BUCKET)
    #[arg(long, global = true)]
    pub s3_bucket: Option<String>,

    /// Cron expression with seconds (overrides SCHEDULE)
    #[arg(long, global = true)]
    pub schedule: Option<String>,

    /// Skip a firing while the previous run is still going (overrides SINGLE_FLIGHT)
    #[arg(long, global = true)]
    pub single_flight: bool,

    /// Platform controller URL (overrides CONTROLLER_URL)
    #[arg(long, global = true)]
    pub controller_url: Option<String>,

    /// Address of the download/health listener (overrides LISTEN_ADDR)
    #[arg(long, global = true)]
    pub listen_addr: Option<String>,

    /// Externally reachable base URL of the listener (overrides PUBLIC_URL)
    #[arg(long, global = true)]
    pub public_url: Option<String>,

    /// pg_dump binary (overrides PG_DUMP_BIN)
    #[arg(long, global = true)]
    pub pg_dump_bin: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run backups on the schedule and serve downloads
    Worker,
    /// Run one backup pass now and exit
    Run,
    /// List the backups of an app
    List { app_name: String },
    /// Print a download URL for a backup
    Url { backup_id: Uuid },
    /// Delete a backup and its stored payload
    Delete { backup_id: Uuid },
}

/// Where backup payloads are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Fs { dir: PathBuf },
    S3 { bucket: String },
}

#[derive(Clone)]
pub struct ControllerConfig {
    pub url: String,
    pub key: String,
    pub tls_pin: Option<String>,
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("url", &self.url)
            .field("tls_pin", &self.tls_pin.is_some())
            .finish_non_exhaustive()
    }
}

/// Settings for signing filesystem download URLs.
#[derive(Clone)]
pub struct SigningConfig {
    pub public_url: String,
    pub key: String,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; CLI wins.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub storage: StorageBackend,
    pub schedule: String,
    pub single_flight: bool,
    /// `None` disables the deadline.
    pub transfer_timeout: Option<Duration>,
    /// `None` disables discarding of abandoned backups. When set it is
    /// always longer than the transfer deadline.
    pub abandoned_after: Option<chrono::Duration>,
    pub controller: Option<ControllerConfig>,
    pub pg_dump_bin: String,
    pub listen_addr: String,
    pub signing: Option<SigningConfig>,
    pub url_expiry: Duration,
}

impl AppConfig {
    /// Parse CLI args and the process environment.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let command = args.command.clone();
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, command))
    }

    /// Merge `args` with values from `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let storage = match args.s3_bucket.or_else(|| var("S3_BUCKET")) {
            Some(bucket) => StorageBackend::S3 { bucket },
            None => StorageBackend::Fs {
                dir: args
                    .storage_dir
                    .or_else(|| var("STORAGE_DIR"))
                    .unwrap_or_else(|| DEFAULT_STORAGE_DIR.into())
                    .into(),
            },
        };

        let single_flight = args.single_flight
            || parse_var::<bool>(&var, "SINGLE_FLIGHT")?.unwrap_or(false);

        let timeout_secs = parse_var::<u64>(&var, "TRANSFER_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SECS);
        let transfer_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

        let abandoned_hours = parse_var::<u64>(&var, "ABANDONED_AFTER_HOURS")?
            .unwrap_or(DEFAULT_ABANDONED_AFTER_HOURS);
        let abandoned_after = abandoned_after(abandoned_hours, timeout_secs)?;

        let controller = match args.controller_url.or_else(|| var("CONTROLLER_URL")) {
            Some(url) => Some(ControllerConfig {
                url,
                key: var("CONTROLLER_KEY").context("CONTROLLER_KEY is required with CONTROLLER_URL")?,
                tls_pin: var("CONTROLLER_TLS_PIN"),
            }),
            None => None,
        };

        let signing = match (args.public_url.or_else(|| var("PUBLIC_URL")), var("SIGNING_KEY")) {
            (Some(public_url), Some(key)) => Some(SigningConfig { public_url, key }),
            (None, None) => None,
            _ => bail!("PUBLIC_URL and SIGNING_KEY must be set together"),
        };

        let url_expiry = Duration::from_secs(
            parse_var::<u64>(&var, "URL_EXPIRY_SECS")?.unwrap_or(DEFAULT_URL_EXPIRY_SECS),
        );

        Ok(Self {
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.into()),
            storage,
            schedule: args
                .schedule
                .or_else(|| var("SCHEDULE"))
                .unwrap_or_else(|| DEFAULT_SCHEDULE.into()),
            single_flight,
            transfer_timeout,
            abandoned_after,
            controller,
            pg_dump_bin: args
                .pg_dump_bin
                .or_else(|| var("PG_DUMP_BIN"))
                .unwrap_or_else(|| DEFAULT_PG_DUMP.into()),
            listen_addr: args
                .listen_addr
                .or_else(|| var("LISTEN_ADDR"))
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into()),
            signing,
            url_expiry,
        })
    }

    /// Controller settings, required by every command that looks up apps.
    pub fn require_controller(&self) -> Result<&ControllerConfig> {
        self.controller
            .as_ref()
            .context("CONTROLLER_URL and CONTROLLER_KEY must be set")
    }
}

/// An unfinished backup may only be treated as abandoned once no transfer
/// could still be writing it.
fn abandoned_after(hours: u64, timeout_secs: u64) -> Result<Option<chrono::Duration>> {
    if hours == 0 {
        return Ok(None);
    }
    if timeout_secs == 0 {
        bail!(
            "TRANSFER_TIMEOUT_SECS=0 disables the transfer deadline and needs \
             ABANDONED_AFTER_HOURS=0, otherwise running backups may be discarded"
        );
    }
    if hours.saturating_mul(3600) <= timeout_secs {
        bail!(
            "ABANDONED_AFTER_HOURS ({}h) must be longer than TRANSFER_TIMEOUT_SECS ({}s)",
            hours,
            timeout_secs
        );
    }
    let after = i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .with_context(|| format!("ABANDONED_AFTER_HOURS value {} is too large", hours))?;
    Ok(Some(after))
}

fn parse_var<T>(var: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}
