use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{services::transfer::TransferError, storage::StorageError};

/// Failures of the backup lifecycle.
///
/// The variants follow how the orchestrator reacts to them: configuration and
/// unavailability errors abandon a single workload, metadata errors are always
/// surfaced because the record state is unknown, and transfer errors leave the
/// backup uncompleted.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("metadata store error: {0}")]
    DataIntegrity(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("backup {0} is inconsistent: {1}")]
    Inconsistent(Uuid, String),

    #[error("backup {0} not found")]
    NotFound(Uuid),

    #[error("app `{0}` not found")]
    UnknownApp(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type BackupResult<T> = Result<T, BackupError>;

impl BackupError {
    pub fn unavailable(service: &'static str, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            service,
            reason: reason.to_string(),
        }
    }
}

/// A lightweight wrapper for errors returned by the download endpoint.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound(_) => AppError::not_found(err.to_string()),
            StorageError::InvalidSignature | StorageError::UrlExpired => {
                AppError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            other => {
                tracing::error!("download failed: {}", other);
                AppError::internal("internal storage error")
            }
        }
    }
}
