//! HTTP façade over the collectors.
//!
//! Exposes the SCM and filesystem operations as a JSON API so a scheduler
//! or UI can trigger syncs remotely.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/scm/{scm}/issues` | List repository issues |
//! | `GET`  | `/api/v1/scm/{scm}/repo` | List repository files (metadata only) |
//! | `POST` | `/api/v1/scm/run-inventory` | Full inventory ingestion |
//! | `POST` | `/api/v1/scm/incremental-sync` | Commit-driven incremental sync |
//! | `POST` | `/api/v1/fs/check-status` | Hash-diff the local tree |
//! | `POST` | `/api/v1/fs/run-inventory` | Full filesystem ingestion |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Every `/api/v1` route passes through the auth layer; see [`crate::auth`].
//! Errors come back as `{ "error": { "code": ..., "message": ... } }`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::auth;
use crate::collector_fs;
use crate::config::Config;
use crate::error::ScmError;
use crate::ingester::IngesterClient;
use crate::models::{ContentFilter, SyncOutcome};
use crate::scm::{Scm, ScmProvider, SourceApi};
use crate::sync::{SyncEngine, SyncOptions};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
}

/// Start the agent API server. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/scm/{scm}/issues", get(handle_list_issues))
        .route("/scm/{scm}/repo", get(handle_get_repo))
        .route("/scm/run-inventory", post(handle_scm_inventory))
        .route("/scm/incremental-sync", post(handle_scm_sync))
        .route("/fs/check-status", post(handle_fs_check_status))
        .route("/fs/run-inventory", post(handle_fs_inventory))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("agent API listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn require_auth(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    auth::authenticate(&state.config.server, request.headers())
        .map_err(unauthorized)?;
    Ok(next.run(request).await)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Map collector failures to HTTP statuses.
fn classify_error(err: anyhow::Error) -> AppError {
    let (status, code) = match err.downcast_ref::<ScmError>() {
        Some(ScmError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
        Some(ScmError::Auth) | Some(ScmError::Config(_)) => (StatusCode::BAD_REQUEST, "bad_request"),
        Some(ScmError::RateLimited { .. }) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        Some(ScmError::Fetch { .. }) | Some(ScmError::Api(_)) => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
        Some(ScmError::Transport(_)) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    AppError {
        status,
        code: code.to_string(),
        message: err.to_string(),
    }
}

// ============ Shared request shapes ============

#[derive(Deserialize)]
struct RepoQuery {
    repo_name: String,
    owner: String,
}

#[derive(Deserialize)]
struct ScmRunRequest {
    scm: Scm,
    repo_name: String,
    owner: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    start_workflows: bool,
    #[serde(default)]
    workflow_definition_id: Option<String>,
    #[serde(default)]
    param_set_id: Option<String>,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    content_filter: ContentFilter,
}

fn default_branch() -> String {
    "main".to_string()
}

impl ScmRunRequest {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            repo: self.repo_name.clone(),
            owner: self.owner.clone(),
            branch: self.branch.clone(),
            content_filter: self.content_filter,
            priority: self.priority,
            start_workflows: self.start_workflows,
            workflow_definition_id: self.workflow_definition_id.clone(),
            param_set_id: self.param_set_id.clone(),
        }
    }
}

fn provider(state: &AppState, scm: Scm) -> Result<ScmProvider, AppError> {
    ScmProvider::from_config(scm, &state.config.scm)
        .map_err(|e| bad_request(e.to_string()))
}

fn ingester(state: &AppState) -> Result<IngesterClient, AppError> {
    IngesterClient::new(&state.config.ingester).map_err(classify_error)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/v1/scm/{scm}/issues ============

async fn handle_list_issues(
    State(state): State<AppState>,
    Path(scm): Path<Scm>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let provider = provider(&state, scm)?;
    let issues = provider
        .list_issues(&query.repo_name, Some(&query.owner), true, None)
        .await
        .map_err(|e| classify_error(e.into()))?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "scm": scm.as_str(),
        "repo": query.repo_name,
        "owner": query.owner,
        "issue_count": issues.len(),
        "issues": issues,
    })))
}

// ============ GET /api/v1/scm/{scm}/repo ============

async fn handle_get_repo(
    State(state): State<AppState>,
    Path(scm): Path<Scm>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let provider = provider(&state, scm)?;
    let files = provider
        .list_repo_files(&query.repo_name, Some(&query.owner), None, "main")
        .await
        .map_err(|e| classify_error(e.into()))?;

    // Metadata only; content stays out of the listing response.
    let file_list: Vec<serde_json::Value> = files
        .iter()
        .map(|f| {
            serde_json::json!({
                "uri": f.uri,
                "sha256": f.sha256,
                "content_type": f.content_type,
                "last_updated": f.last_updated,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "status": "ok",
        "scm": scm.as_str(),
        "repo": query.repo_name,
        "owner": query.owner,
        "file_count": file_list.len(),
        "files": file_list,
    })))
}

// ============ POST /api/v1/scm/run-inventory ============

async fn handle_scm_inventory(
    State(state): State<AppState>,
    Json(req): Json<ScmRunRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let provider = provider(&state, req.scm)?;
    let ingester = ingester(&state)?;
    let engine = SyncEngine::new(
        &provider,
        &ingester,
        req.scm,
        state.config.scm.extensions.clone(),
    );

    let report = engine
        .load_inventory(&req.options())
        .await
        .map_err(classify_error)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "scm": req.scm.as_str(),
        "repo": req.repo_name,
        "owner": req.owner,
        "inventory_count": report.inventory.len(),
        "to_process_count": report.to_process.len(),
        "ingested_count": report.ingested.len(),
        "error_count": report.errors.len(),
        "errors": report.errors,
        "workflow_result": report.workflow_result,
    })))
}

// ============ POST /api/v1/scm/incremental-sync ============

async fn handle_scm_sync(
    State(state): State<AppState>,
    Json(req): Json<ScmRunRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let provider = provider(&state, req.scm)?;
    let ingester = ingester(&state)?;
    let engine = SyncEngine::new(
        &provider,
        &ingester,
        req.scm,
        state.config.scm.extensions.clone(),
    );

    let outcome = engine
        .incremental_sync(&req.options())
        .await
        .map_err(classify_error)?;

    let mut body = serde_json::to_value(&outcome).map_err(|e| classify_error(e.into()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("scm".to_string(), req.scm.as_str().into());
        obj.insert("repo".to_string(), req.repo_name.clone().into());
        obj.insert("owner".to_string(), req.owner.clone().into());
        obj.insert("branch".to_string(), req.branch.clone().into());
        if let SyncOutcome::FullSync(_) = outcome {
            obj.insert("status".to_string(), "full-sync".into());
        }
    }
    Ok(Json(body))
}

// ============ POST /api/v1/fs/check-status ============

#[derive(Deserialize)]
struct FsRequest {
    #[serde(default)]
    source: Option<String>,
}

fn fs_source(state: &AppState, req: &FsRequest) -> Result<(crate::config::FsCollectorConfig, String), AppError> {
    let fs = state
        .config
        .fs
        .clone()
        .ok_or_else(|| bad_request("filesystem collector is not configured"))?;
    let source = req
        .source
        .clone()
        .unwrap_or_else(|| format!("fs:{}", fs.root.display()));
    Ok((fs, source))
}

async fn handle_fs_check_status(
    State(state): State<AppState>,
    Json(req): Json<FsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (fs, source) = fs_source(&state, &req)?;
    let ingester = ingester(&state)?;

    let to_process = collector_fs::check_status(&fs, &ingester, &source)
        .await
        .map_err(classify_error)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "source": source,
        "to_process_count": to_process.len(),
        "to_process": to_process,
    })))
}

// ============ POST /api/v1/fs/run-inventory ============

async fn handle_fs_inventory(
    State(state): State<AppState>,
    Json(req): Json<FsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (fs, source) = fs_source(&state, &req)?;
    let ingester = ingester(&state)?;

    let report = collector_fs::run_inventory(&fs, &ingester, &source)
        .await
        .map_err(classify_error)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "source": source,
        "inventory_count": report.inventory.len(),
        "to_process_count": report.to_process.len(),
        "ingested_count": report.ingested.len(),
        "error_count": report.errors.len(),
        "errors": report.errors,
    })))
}
