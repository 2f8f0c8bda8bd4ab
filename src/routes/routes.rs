//! Routes served by the worker.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: readiness (metadata store + storage directory)
//! - `GET /downloads/{app_id}/{backup_id}?expires=&signature=`: signed download

use crate::handlers::{
    AppState,
    download_handlers::download_backup,
    health_handlers::{healthz, readyz},
};
use axum::{Router, routing::get};

/// Build the worker router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/downloads/{app_id}/{backup_id}", get(download_backup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::backup_repository::tests::repository,
        storage::{ByteStream, FsStorage, Storage, UrlSigner},
    };
    use bytes::Bytes;
    use futures::stream;
    use reqwest::StatusCode;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    async fn serve(storage: FsStorage) -> String {
        let state = AppState {
            storage,
            repo: repository().await,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, routes().with_state(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn storage(dir: &std::path::Path, public_url: &str) -> FsStorage {
        let signer = UrlSigner::new(b"secret", public_url, Duration::from_secs(300)).unwrap();
        FsStorage::new(dir, Some(signer))
    }

    #[tokio::test]
    async fn signed_download_streams_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        // bind first so the signer knows the public url
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let storage = storage(dir.path(), &base);
        let state = AppState {
            storage: storage.clone(),
            repo: repository().await,
        };
        tokio::spawn(async move {
            axum::serve(listener, routes().with_state(state)).await.unwrap();
        });

        let id = Uuid::new_v4();
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"PGDMP-data"))]));
        storage.put("app1", id, body).await.unwrap();
        let url = storage.signed_url("app1", id).await.unwrap();

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/octet-stream"
        );
        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"PGDMP-data"));

        let tampered = url.replace("app1", "app2");
        let response = reqwest::get(&tampered).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let storage = storage(dir.path(), &base);
        let state = AppState {
            storage: storage.clone(),
            repo: repository().await,
        };
        tokio::spawn(async move {
            axum::serve(listener, routes().with_state(state)).await.unwrap();
        });

        let url = storage.signed_url("app1", Uuid::new_v4()).await.unwrap();
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(FsStorage::new(dir.path(), None)).await;

        let health = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = reqwest::get(format!("{base}/readyz")).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        let body: serde_json::Value = ready.json().await.unwrap();
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn readiness_fails_without_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(FsStorage::new(dir.path().join("missing"), None)).await;

        let ready = reqwest::get(format!("{base}/readyz")).await.unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
