//! Workload discovery against the platform controller API.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Certificate, Client, StatusCode, Url};
use serde::{Deserialize, de::DeserializeOwned};
use std::{collections::HashMap, time::Duration};
use tracing::error;

use crate::{
    errors::{BackupError, BackupResult},
    models::workload::Workload,
};

const SERVICE: &str = "controller";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the workloads to back up.
#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    /// Every workload on the platform with its current release environment.
    async fn list(&self) -> BackupResult<Vec<Workload>>;

    /// Look up a single workload by name.
    async fn find(&self, name: &str) -> BackupResult<Option<Workload>>;
}

#[derive(Debug, Deserialize)]
struct ControllerApp {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ControllerRelease {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// [`WorkloadDirectory`] backed by the controller's HTTP API.
#[derive(Clone)]
pub struct ControllerDirectory {
    client: Client,
    base_url: Url,
    key: String,
}

impl ControllerDirectory {
    /// `tls_pin` is the controller's certificate as base64-encoded DER. When
    /// given, it replaces the built-in roots as the only trusted certificate.
    pub fn new(base_url: &str, key: &str, tls_pin: Option<&str>) -> BackupResult<Self> {
        let base_url = Url::parse(base_url).map_err(|err| {
            BackupError::Configuration(format!("invalid controller url `{base_url}`: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(BackupError::Configuration(format!(
                "controller url `{base_url}` cannot take a path"
            )));
        }

        let mut builder = Client::builder()
            .user_agent(concat!("pg-backups/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT);
        if let Some(pin) = tls_pin.filter(|p| !p.is_empty()) {
            let der = general_purpose::STANDARD.decode(pin).map_err(|err| {
                BackupError::Configuration(format!("controller TLS pin is not base64: {err}"))
            })?;
            let cert = Certificate::from_der(&der).map_err(|err| {
                BackupError::Configuration(format!("controller TLS pin is not a certificate: {err}"))
            })?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|err| BackupError::Configuration(format!("building http client: {err}")))?;

        Ok(Self {
            client,
            base_url,
            key: key.to_string(),
        })
    }

    /// Controller URL for `segments`, each percent-encoded as a single path
    /// segment.
    fn url(&self, segments: &[&str]) -> BackupResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackupError::Configuration("controller url cannot take a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document; `None` on 404.
    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> BackupResult<Option<T>> {
        let url = self.url(segments)?;
        let response = self
            .client
            .get(url.clone())
            .basic_auth("", Some(&self.key))
            .send()
            .await
            .map_err(|err| BackupError::unavailable(SERVICE, err))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|err| BackupError::unavailable(SERVICE, err))?;
        let body = response
            .json::<T>()
            .await
            .map_err(|err| BackupError::unavailable(SERVICE, format!("decoding {url}: {err}")))?;
        Ok(Some(body))
    }

    async fn workload(&self, app: ControllerApp) -> BackupResult<Workload> {
        let release: Option<ControllerRelease> =
            self.get_json(&["apps", &app.id, "release"]).await?;
        Ok(Workload {
            app_id: app.id,
            name: app.name,
            env: release.map(|r| r.env).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl WorkloadDirectory for ControllerDirectory {
    /// Apps without a release are returned with an empty environment and so
    /// never carry the database marker.
    ///
    /// Only the app listing itself can fail the call. An app whose release
    /// cannot be fetched is logged and left out, so the others still run.
    async fn list(&self) -> BackupResult<Vec<Workload>> {
        let apps: Vec<ControllerApp> = self.get_json(&["apps"]).await?.unwrap_or_default();
        let mut workloads = Vec::with_capacity(apps.len());
        for app in apps {
            let (id, name) = (app.id.clone(), app.name.clone());
            match self.workload(app).await {
                Ok(workload) => workloads.push(workload),
                Err(err) => error!("skipping app {} ({}): {}", name, id, err),
            }
        }
        Ok(workloads)
    }

    async fn find(&self, name: &str) -> BackupResult<Option<Workload>> {
        match self.get_json::<ControllerApp>(&["apps", name]).await? {
            Some(app) => Ok(Some(self.workload(app).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode as HttpStatus, header},
        response::IntoResponse,
        routing::get,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    const KEY: &str = "controller-key";

    fn authorized(headers: &HeaderMap) -> bool {
        let expected = format!("Basic {}", general_purpose::STANDARD.encode(format!(":{KEY}")));
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(expected.as_str())
    }

    async fn apps(headers: HeaderMap) -> impl IntoResponse {
        if !authorized(&headers) {
            return HttpStatus::UNAUTHORIZED.into_response();
        }
        Json(json!([
            {"id": "a1", "name": "blog"},
            {"id": "a2", "name": "static-site"},
            {"id": "a3", "name": "reports"},
        ]))
        .into_response()
    }

    async fn app(Path(name): Path<String>) -> impl IntoResponse {
        match name.as_str() {
            "blog" => Json(json!({"id": "a1", "name": "blog"})).into_response(),
            "team/blog" => Json(json!({"id": "a1", "name": "team/blog"})).into_response(),
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn release(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "a1" => Json(json!({
                "id": "r1",
                "env": {"FLYNN_POSTGRES": "postgres", "PGHOST": "leader.pg"}
            }))
            .into_response(),
            "a3" => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn serve() -> String {
        let router = Router::new()
            .route("/apps", get(apps))
            .route("/apps/{id}", get(app))
            .route("/apps/{id}/release", get(release));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn lists_apps_with_release_env() {
        let url = serve().await;
        let directory = ControllerDirectory::new(&url, KEY, None).unwrap();

        let workloads = directory.list().await.unwrap();
        assert_eq!(workloads[0].app_id, "a1");
        assert!(workloads[0].has_database());
        assert_eq!(workloads[1].name, "static-site");
        assert!(workloads[1].env.is_empty());
    }

    #[tokio::test]
    async fn failing_release_skips_only_that_app() {
        let url = serve().await;
        let directory = ControllerDirectory::new(&url, KEY, None).unwrap();

        let workloads = directory.list().await.unwrap();
        let ids: Vec<&str> = workloads.iter().map(|w| w.app_id.as_str()).collect();
        assert_eq!(ids, ["a1", "a2"]);

        let broken = ControllerApp {
            id: "a3".into(),
            name: "reports".into(),
        };
        let err = directory.workload(broken).await.unwrap_err();
        assert!(matches!(err, BackupError::Unavailable { service: "controller", .. }));
    }

    #[tokio::test]
    async fn wrong_key_is_unavailable() {
        let url = serve().await;
        let directory = ControllerDirectory::new(&url, "nope", None).unwrap();
        let err = directory.list().await.unwrap_err();
        assert!(matches!(err, BackupError::Unavailable { service: "controller", .. }));
    }

    #[tokio::test]
    async fn find_by_name() {
        let url = serve().await;
        let directory = ControllerDirectory::new(&url, KEY, None).unwrap();

        let blog = directory.find("blog").await.unwrap().unwrap();
        assert_eq!(blog.app_id, "a1");
        assert_eq!(blog.env.get("PGHOST").map(String::as_str), Some("leader.pg"));
        assert!(directory.find("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn app_names_are_sent_as_one_path_segment() {
        let url = serve().await;
        let directory = ControllerDirectory::new(&format!("{url}/"), KEY, None).unwrap();

        assert_eq!(
            directory.url(&["apps", "team/blog"]).unwrap().path(),
            "/apps/team%2Fblog"
        );
        let team = directory.find("team/blog").await.unwrap().unwrap();
        assert_eq!(team.name, "team/blog");
        assert!(directory.find("blog?x=1").await.unwrap().is_none());
    }

    #[test]
    fn rejects_unusable_url() {
        for url in ["", "not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                ControllerDirectory::new(url, KEY, None),
                Err(BackupError::Configuration(_))
            ));
        }
    }

    #[test]
    fn rejects_malformed_pin() {
        let result = ControllerDirectory::new("https://controller.example", KEY, Some("%%%"));
        assert!(matches!(result, Err(BackupError::Configuration(_))));
    }
}
