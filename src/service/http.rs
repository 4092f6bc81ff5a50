//! HTTP/JSON facade for the Service, matching the wire shapes the Go-client-facing API
//! spoke: `memoryLimitMB`/`timeLimitMs`/`procLimit` with `0` meaning unset.

use super::Service;
use crate::{
    error::ServiceError,
    job::{InlineFile, Step},
    sandbox::report::Report,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/exec", post(exec))
        .route("/done", post(done))
        .with_state(service)
}

#[derive(Deserialize)]
struct InlineFileWire {
    name: String,
    content: String,
}

impl From<InlineFileWire> for InlineFile {
    fn from(w: InlineFileWire) -> Self {
        InlineFile {
            name: w.name,
            content: w.content,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessWire {
    image: String,
    #[serde(default)]
    cmd: Vec<String>,
    #[serde(default)]
    stdin: String,
    #[serde(default, rename = "memoryLimitMB")]
    memory_limit_mb: i64,
    #[serde(default)]
    time_limit_ms: u64,
    #[serde(default)]
    proc_limit: i64,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    persist: Vec<String>,
}

impl From<ProcessWire> for Step {
    fn from(w: ProcessWire) -> Self {
        Step {
            image: w.image,
            cmd: w.cmd,
            stdin: w.stdin,
            memory_mb: (w.memory_limit_mb != 0).then_some(w.memory_limit_mb),
            time_limit_ms: (w.time_limit_ms != 0).then_some(w.time_limit_ms),
            proc_limit: (w.proc_limit != 0).then_some(w.proc_limit),
            files: w.files,
            persist: w.persist,
        }
    }
}

#[derive(Deserialize)]
struct ExecRequestWire {
    id: Option<String>,
    #[serde(default)]
    files: Vec<InlineFileWire>,
    #[serde(default)]
    steps: Vec<ProcessWire>,
}

#[derive(Serialize)]
struct ExecResponseWire {
    id: String,
    reports: Vec<Report>,
}

#[derive(Deserialize)]
struct DoneRequestWire {
    id: String,
}

#[derive(Serialize)]
struct DoneResponseWire {
    status: &'static str,
}

async fn exec(
    State(service): State<Arc<Service>>,
    Json(req): Json<ExecRequestWire>,
) -> Result<Json<ExecResponseWire>, ApiError> {
    let id = req.id.unwrap_or_else(Service::new_job_id);
    let files = req.files.into_iter().map(Into::into).collect();
    let steps = req.steps.into_iter().map(Into::into).collect();

    let reports = service.execute_job(&id, files, steps).await?;
    Ok(Json(ExecResponseWire { id, reports }))
}

async fn done(
    State(service): State<Arc<Service>>,
    Json(req): Json<DoneRequestWire>,
) -> Json<DoneResponseWire> {
    service.done_job(&req.id);
    Json(DoneResponseWire { status: "ok" })
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigBuilder, oci_runtime::OCIRuntimeBuilder};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::default()
            .images_dir(dir.path().join("images"))
            .storage_dir(dir.path().join("storage"))
            .overlayfs_dir(dir.path().join("overlayfs"))
            .libcontainer_dir(dir.path().join("libcontainer"))
            .rootfs_dir(dir.path().join("bundles"))
            .max_parallel_sandboxes(1usize)
            .build()
            .unwrap();
        let runtime = OCIRuntimeBuilder::default()
            .binary(which::which("echo").unwrap())
            .build()
            .unwrap();
        router(Arc::new(Service::new(&config, runtime)))
    }

    #[tokio::test]
    async fn done_returns_ok_for_unknown_job() {
        let app = test_app();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/done")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"id":"missing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exec_with_missing_image_is_unprocessable() {
        let app = test_app();
        let body = r#"{"id":"job-1","steps":[{"image":"missing:latest","cmd":["/bin/true"]}]}"#;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/exec")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
