//! Dump job execution.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::{future::Future, io, process::Stdio};
use thiserror::Error;
use tokio::{io::AsyncRead, process::Command};
use tracing::debug;

use crate::models::workload::{DatabaseConnection, Workload};

/// Arguments passed to `pg_dump`: custom archive format, restorable into a
/// database owned by another role.
pub const DUMP_ARGS: [&str; 3] = ["--format=custom", "--no-owner", "--no-acl"];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("job has no output stream")]
    NoOutput,

    #[error("job exited unsuccessfully: {0}")]
    Exit(String),

    #[error("waiting for job failed: {0}")]
    Wait(#[source] io::Error),
}

/// Output of a running dump job.
///
/// `stdout` carries the dump; `exit` resolves once the job has finished and
/// reports whether it succeeded. Dropping either releases the job.
pub struct JobOutput {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: BoxFuture<'static, Result<(), JobError>>,
}

impl JobOutput {
    pub fn new<R, F>(stdout: R, exit: F) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            stdout: Box::new(stdout),
            exit: Box::pin(exit),
        }
    }
}

/// Starts dump jobs for workloads.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn start(
        &self,
        workload: &Workload,
        connection: &DatabaseConnection,
    ) -> Result<JobOutput, JobError>;
}

/// Runs `pg_dump` as a child process with the workload's connection
/// parameters in its environment.
#[derive(Debug, Clone)]
pub struct PgDumpRunner {
    program: String,
}

impl PgDumpRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl JobRunner for PgDumpRunner {
    async fn start(
        &self,
        workload: &Workload,
        connection: &DatabaseConnection,
    ) -> Result<JobOutput, JobError> {
        debug!(
            "starting {} for {} against {}/{}",
            self.program, workload.name, connection.host, connection.database
        );
        let mut child = Command::new(&self.program)
            .args(DUMP_ARGS)
            .envs(connection.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(JobError::NoOutput)?;
        let exit = async move {
            let status = child.wait().await.map_err(JobError::Wait)?;
            if status.success() {
                Ok(())
            } else {
                Err(JobError::Exit(status.to_string()))
            }
        };
        Ok(JobOutput::new(stdout, exit))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    fn fixture() -> (Workload, DatabaseConnection) {
        let env: HashMap<String, String> = [
            ("PGHOST", "localhost"),
            ("PGUSER", "flynn"),
            ("PGPASSWORD", "pw"),
            ("PGDATABASE", "blog"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let workload = Workload {
            app_id: "app1".into(),
            name: "blog".into(),
            env,
        };
        let conn = workload.connection().unwrap();
        (workload, conn)
    }

    #[tokio::test]
    async fn streams_stdout_and_reports_success() {
        let (workload, conn) = fixture();
        let mut job = PgDumpRunner::new("echo")
            .start(&workload, &conn)
            .await
            .unwrap();

        let mut out = String::new();
        job.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim_end(), DUMP_ARGS.join(" "));
        job.exit.await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let (workload, conn) = fixture();
        let job = PgDumpRunner::new("false")
            .start(&workload, &conn)
            .await
            .unwrap();
        assert!(matches!(job.exit.await, Err(JobError::Exit(_))));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (workload, conn) = fixture();
        let result = PgDumpRunner::new("/nonexistent/pg_dump")
            .start(&workload, &conn)
            .await;
        assert!(matches!(result, Err(JobError::Spawn { .. })));
    }
}
