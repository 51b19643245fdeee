//! HTTP command surface for the API process.
//!
//! Thin translation layer: validate inputs, create entities, enqueue work,
//! return snapshots. No sandboxed work ever runs on a request path.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::db::DbHandle;
use crate::host::{RepositoryHost, normalize_url};
use crate::models::{ImprovementJob, TrackedRepository};
use crate::queue::{IMPROVE_QUEUE, ImprovePayload, SCAN_QUEUE, ScanPayload, scan_job_key};

/// Dependencies a repository must declare before registration is accepted.
const REQUIRED_DEPENDENCIES: &[&str] = &["jest", "ts-jest"];

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub host: Arc<dyn RepositoryHost>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRepoRequest {
    pub repository_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub repository_url: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub repository_url: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/repos", get(list_repos).post(add_repo))
        .route("/api/repos/:id/scan", post(trigger_scan))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_repos(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let repos = state.db.call(|db| db.list_repositories()).await?;
    Ok(Json(repos))
}

async fn add_repo(
    State(state): State<SharedState>,
    Json(req): Json<AddRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let raw_url = req
        .repository_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("repositoryUrl is required".to_string()))?;
    let url = normalize_url(raw_url).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Re-registration returns the existing entity; N calls equal one add
    // plus N-1 reads.
    let existing = {
        let url = url.clone();
        state
            .db
            .call(move |db| db.find_repository_by_url(&url))
            .await?
    };
    if let Some(repo) = existing {
        return Ok((StatusCode::CREATED, Json(repo)));
    }

    let has_deps = state
        .host
        .has_required_dependencies(&url, REQUIRED_DEPENDENCIES)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !has_deps {
        return Err(ApiError::BadRequest(format!(
            "Repository is missing required dependencies: {}",
            REQUIRED_DEPENDENCIES.join(", ")
        )));
    }

    let repo = TrackedRepository::new(&url);
    let stored = {
        let repo = repo.clone();
        state.db.call(move |db| db.upsert_repository(&repo)).await?
    };

    enqueue_scan(&state.db, &stored.id).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn trigger_scan(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = {
        let id = id.clone();
        state.db.call(move |db| db.get_repository(&id)).await?
    };
    if repo.is_none() {
        return Err(ApiError::BadRequest(format!("Repository {} not found", id)));
    }

    enqueue_scan(&state.db, &id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "queued": true, "repoId": id })),
    ))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .db
        .call(move |db| match query.repository_url {
            Some(url) => db.find_jobs_by_repo(&url),
            None => db.list_jobs(),
        })
        .await?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let raw_url = req
        .repository_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("repositoryUrl is required".to_string()))?;
    let file_path = req
        .file_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("filePath is required".to_string()))?;
    let url = normalize_url(raw_url).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let job = ImprovementJob::new(&url, file_path);
    let stored = {
        let job = job.clone();
        state.db.call(move |db| db.upsert_job(&job)).await?
    };

    let payload = serde_json::to_string(&ImprovePayload {
        job_id: stored.id.clone(),
    })
    .context("Failed to serialize improve payload")?;
    {
        let job_key = stored.id.clone();
        state
            .db
            .call(move |db| db.enqueue(IMPROVE_QUEUE, &job_key, &payload).map(|_| ()))
            .await?;
    }

    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = {
        let id = id.clone();
        state.db.call(move |db| db.get_job(&id)).await?
    };
    match job {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::BadRequest(format!("Job {} not found", id))),
    }
}

async fn enqueue_scan(db: &DbHandle, repo_id: &str) -> Result<(), ApiError> {
    let payload = serde_json::to_string(&ScanPayload {
        repo_id: repo_id.to_string(),
    })
    .context("Failed to serialize scan payload")?;
    let job_key = scan_job_key(repo_id);
    db.call(move |db| db.enqueue(SCAN_QUEUE, &job_key, &payload).map(|_| ()))
        .await?;
    Ok(())
}

// ── Server ────────────────────────────────────────────────────────────

/// Start the API process: bind, serve, shut down on ctrl-c.
pub async fn start_api(state: SharedState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    eprintln!("[api] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    eprintln!("[api] Shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    eprintln!("\n[api] Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BotDb;
    use crate::errors::HostError;
    use crate::models::JobStatus;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::path::{Path as FsPath, PathBuf};
    use tower::ServiceExt;

    struct StubHost {
        has_deps: bool,
    }

    #[async_trait]
    impl RepositoryHost for StubHost {
        async fn has_required_dependencies(
            &self,
            _url: &str,
            _deps: &[&str],
        ) -> Result<bool, HostError> {
            Ok(self.has_deps)
        }
        async fn check_permissions(&self, _url: &str) -> Result<bool, HostError> {
            Ok(true)
        }
        async fn clone_repository(
            &self,
            _url: &str,
            _branch: Option<&str>,
        ) -> Result<PathBuf, HostError> {
            unreachable!("API process never clones")
        }
        async fn default_branch(&self, _local: &FsPath) -> Result<String, HostError> {
            Ok("main".to_string())
        }
        async fn commit_and_push(
            &self,
            _local: &FsPath,
            _branch: &str,
            _files: &HashMap<String, String>,
            _message: &str,
            _stage: Option<&[String]>,
        ) -> Result<(), HostError> {
            unreachable!("API process never pushes")
        }
        async fn create_pull_request(
            &self,
            _url: &str,
            _head: &str,
            _title: &str,
            _body: &str,
            _base: &str,
        ) -> Result<String, HostError> {
            unreachable!("API process never opens PRs")
        }
        async fn cleanup(&self, _local: &FsPath) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn test_state(has_deps: bool) -> SharedState {
        Arc::new(AppState {
            db: DbHandle::new(BotDb::new_in_memory().unwrap()),
            host: Arc::new(StubHost { has_deps }),
        })
    }

    async fn request(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let app = build_router(Arc::clone(state));
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(true);
        let (status, _) = request(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_add_repo_missing_field_is_400() {
        let state = test_state(true);
        let (status, body) =
            request(&state, "POST", "/api/repos", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "repositoryUrl is required");
    }

    #[tokio::test]
    async fn test_add_repo_invalid_url_is_400() {
        let state = test_state(true);
        let (status, body) = request(
            &state,
            "POST",
            "/api/repos",
            Some(serde_json::json!({"repositoryUrl": "not a url"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("Invalid repository URL"));
    }

    #[tokio::test]
    async fn test_add_repo_creates_and_enqueues_scan() {
        let state = test_state(true);
        let (status, body) = request(
            &state,
            "POST",
            "/api/repos",
            Some(serde_json::json!({"repositoryUrl": "https://github.com/o/r"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["id"].is_string());
        assert!(body["createdAt"].is_string());
        assert_eq!(body["url"], "https://github.com/o/r");

        // Exactly one scan job, payload {"repoId": <id>}, key scan-<id>-...
        let id = body["id"].as_str().unwrap().to_string();
        let job = state
            .db
            .call(|db| db.claim_next(SCAN_QUEUE))
            .await
            .unwrap()
            .expect("scan job enqueued");
        assert!(job.job_key.starts_with(&format!("scan-{}-", id)));
        let payload: ScanPayload = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(payload.repo_id, id);
    }

    #[tokio::test]
    async fn test_add_repo_twice_returns_existing() {
        let state = test_state(true);
        let body = serde_json::json!({"repositoryUrl": "https://github.com/o/r"});
        let (_, first) = request(&state, "POST", "/api/repos", Some(body.clone())).await;
        let (status, second) = request(&state, "POST", "/api/repos", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["id"], second["id"]);

        // No second scan was enqueued for the re-registration.
        let depth = state.db.call(|db| db.queue_depth(SCAN_QUEUE)).await.unwrap();
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn test_add_repo_missing_dependencies_is_400() {
        let state = test_state(false);
        let (status, body) = request(
            &state,
            "POST",
            "/api/repos",
            Some(serde_json::json!({"repositoryUrl": "https://github.com/o/r"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let msg = body["message"].as_str().unwrap();
        assert!(msg.contains("jest"));
        assert!(msg.contains("ts-jest"));
    }

    #[tokio::test]
    async fn test_trigger_scan_unknown_repo_is_400() {
        let state = test_state(true);
        let (status, body) =
            request(&state, "POST", "/api/repos/nope/scan", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_trigger_scan_enqueues() {
        let state = test_state(true);
        let (_, repo) = request(
            &state,
            "POST",
            "/api/repos",
            Some(serde_json::json!({"repositoryUrl": "https://github.com/o/r"})),
        )
        .await;
        let id = repo["id"].as_str().unwrap();

        let (status, body) = request(
            &state,
            "POST",
            &format!("/api/repos/{}/scan", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["queued"], true);
        assert_eq!(body["repoId"], id);
    }

    #[tokio::test]
    async fn test_create_job_defaults_and_enqueue() {
        let state = test_state(true);
        let (status, body) = request(
            &state,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({
                "repositoryUrl": "https://github.com/o/r",
                "filePath": "src/svc.ts"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "QUEUED");
        assert_eq!(body["targetCoverage"], 80.0);
        assert_eq!(body["filePath"], "src/svc.ts");

        let id = body["id"].as_str().unwrap().to_string();
        let job = state
            .db
            .call(|db| db.claim_next(IMPROVE_QUEUE))
            .await
            .unwrap()
            .expect("improve job enqueued");
        assert_eq!(job.job_key, id);
        let payload: ImprovePayload = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(payload.job_id, id);
    }

    #[tokio::test]
    async fn test_create_job_missing_file_path_is_400() {
        let state = test_state(true);
        let (status, body) = request(
            &state,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({"repositoryUrl": "https://github.com/o/r"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "filePath is required");
    }

    #[tokio::test]
    async fn test_get_job_roundtrip_and_unknown() {
        let state = test_state(true);
        let (_, created) = request(
            &state,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({
                "repositoryUrl": "https://github.com/o/r",
                "filePath": "src/svc.ts"
            })),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, fetched) =
            request(&state, "GET", &format!("/api/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, created);

        let (status, body) = request(&state, "GET", "/api/jobs/unknown", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_repository() {
        let state = test_state(true);
        for (url, file) in [
            ("https://github.com/o/r", "src/a.ts"),
            ("https://github.com/o/other", "src/b.ts"),
        ] {
            request(
                &state,
                "POST",
                "/api/jobs",
                Some(serde_json::json!({"repositoryUrl": url, "filePath": file})),
            )
            .await;
        }

        let (_, all) = request(&state, "GET", "/api/jobs", None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, filtered) = request(
            &state,
            "GET",
            "/api/jobs?repositoryUrl=https://github.com/o/r",
            None,
        )
        .await;
        let filtered = filtered.as_array().unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["filePath"], "src/a.ts");
    }

    #[tokio::test]
    async fn test_job_status_serializes_for_clients() {
        // The literal wire form clients poll for.
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        let db = DbHandle::new(BotDb::new_in_memory().unwrap());
        db.lock_sync().unwrap().upsert_job(&job).unwrap();
        db.lock_sync()
            .unwrap()
            .complete_job(&job.id, "https://github.com/o/r/pull/1")
            .unwrap();
        let done = db.lock_sync().unwrap().get_job(&job.id).unwrap().unwrap();
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "PR_CREATED");
        assert!(json["prLink"].as_str().unwrap().contains("/pull/1"));
        assert_eq!(done.status, JobStatus::PrCreated);
    }
}
