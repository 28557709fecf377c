use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::broker::StreamHub;
use crate::config::ReviveConfig;
use crate::pipeline::{PipelineRunner, default_stages};
use crate::registry::{Job, JobRegistry};
use crate::repos::RepoUrl;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub streams: Arc<StreamHub>,
    pub runner: Arc<PipelineRunner>,
    pub config: ReviveConfig,
    pub work_root: PathBuf,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub base_repo: String,
    pub legacy_repo: String,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/health", get(health_check))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", raw)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn submit_job(
    State(state): State<SharedState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let base = RepoUrl::parse(&request.base_repo).map_err(ApiError::BadRequest)?;
    let legacy = RepoUrl::parse(&request.legacy_repo).map_err(ApiError::BadRequest)?;

    tokio::fs::create_dir_all(&state.work_root)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create work root: {}", e)))?;

    let job = Job::new_in(&state.work_root, base.url, legacy.url);
    let job_id = state.registry.insert(job).await;
    state.streams.create(job_id);
    state
        .runner
        .start(job_id, default_stages(state.config.verification_fatal));

    info!(%job_id, base = %request.base_repo, legacy = %request.legacy_repo, "job submitted");
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&id)?;
    match state.registry.get(job_id).await {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("no such job: {}", job_id))),
    }
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    if state.registry.get(job_id).await.is_none() {
        return Err(ApiError::NotFound(format!("no such job: {}", job_id)));
    }
    if !state.runner.cancel(job_id) {
        return Err(ApiError::Conflict(format!("job is not running: {}", job_id)));
    }
    info!(%job_id, "cancellation requested");
    Ok(Json(serde_json::json!({"status": "cancelling"})))
}

async fn health_check() -> &'static str {
    "ok"
}
