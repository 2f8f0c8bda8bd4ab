//! Signed downloads of stored backups.
//! Streams the payload from disk so large dumps are never buffered in memory.

use crate::{errors::AppError, handlers::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Query parameters produced by the URL signer.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub signature: String,
}

/// `GET /downloads/{app_id}/{backup_id}?expires=&signature=`
pub async fn download_backup(
    State(state): State<AppState>,
    Path((app_id, backup_id)): Path<(String, Uuid)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let (file, len) = state
        .storage
        .open_signed(&app_id, backup_id, query.expires, &query.signature)
        .await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), backup_id, len);
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, backup_id: Uuid, len: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{backup_id}.backup\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
