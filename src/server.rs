//! HTTP control plane.
//!
//! JSON over TCP, default `127.0.0.1:7777`, path prefix `/api/v1`. The
//! handlers read shared daemon state; none of them performs heavy work on
//! the request path, so `GET /health` stays under its latency budget even
//! while a correlation batch is running on the blocking pool.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/health` | Liveness; fast, no database access |
//! | `GET`  | `/api/v1/readiness` | Startup progress |
//! | `GET`  | `/api/v1/status` | Daemon + catalog + queue rollup |
//! | `GET`  | `/api/v1/telemetry` | Operation, system, GPU, storage |
//! | `GET`  | `/api/v1/query` | Vector search (`q`, `k`) |
//! | `GET`  | `/api/v1/file/:id` | File record with chunks |
//! | `GET`  | `/api/v1/entities` | Consolidated entities |
//! | `GET`  | `/api/v1/patterns` | Detected patterns |
//! | `GET`  | `/api/v1/discoveries` | Surfaced discoveries |
//! | `POST` | `/api/v1/discoveries/:id/feedback` | confirm / dismiss |
//! | `POST` | `/api/v1/excavate` | Enqueue a batch extraction |
//! | `POST` | `/api/v1/correlate` | Enqueue a correlation job |
//! | `POST` | `/api/v1/correlate/run` | Run correlation synchronously |
//! | `GET`  | `/api/v1/jobs` | Queue statistics |
//! | `GET`  | `/api/v1/jobs/current` | In-flight job |
//! | `GET`  | `/api/v1/jobs/recent` | Recent terminal jobs (`limit`) |
//! | `POST` | `/api/v1/shutdown` | Graceful stop |
//!
//! During shutdown every endpoint except `/health` answers 503.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::daemon::Daemon;
use crate::discovery::apply_feedback;
use crate::models::EntityType;
use crate::queue::{JobPayload, JobPriority};
use crate::tracker;

type AppState = Arc<Daemon>;

/// Bind and serve until the daemon's shutdown notification fires.
pub async fn serve(daemon: AppState) -> anyhow::Result<()> {
    let bind_addr = daemon.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/readiness", get(handle_readiness))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/telemetry", get(handle_telemetry))
        .route("/api/v1/query", get(handle_query))
        .route("/api/v1/file/:id", get(handle_file))
        .route("/api/v1/entities", get(handle_entities))
        .route("/api/v1/patterns", get(handle_patterns))
        .route("/api/v1/discoveries", get(handle_discoveries))
        .route("/api/v1/discoveries/:id/feedback", post(handle_feedback))
        .route("/api/v1/excavate", post(handle_excavate))
        .route("/api/v1/correlate", post(handle_correlate))
        .route("/api/v1/correlate/run", post(handle_correlate_run))
        .route("/api/v1/jobs", get(handle_jobs))
        .route("/api/v1/jobs/current", get(handle_jobs_current))
        .route("/api/v1/jobs/recent", get(handle_jobs_recent))
        .route("/api/v1/shutdown", post(handle_shutdown))
        .layer(cors)
        .with_state(daemon.clone());

    info!(bind = %bind_addr, "control plane listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let shutdown_daemon = daemon.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_daemon.shutdown_notified().notified().await;
        })
        .await?;

    Ok(())
}

// ============ Errors ============

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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn shutting_down() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "shutting_down".to_string(),
        message: "daemon is shutting down".to_string(),
    }
}

/// Everything except `/health` refuses work during shutdown.
fn guard(state: &AppState) -> Result<(), AppError> {
    if state.is_shutting_down() {
        Err(shutting_down())
    } else {
        Ok(())
    }
}

// ============ Health & readiness ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: i64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn handle_readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    if state.is_shutting_down() {
        return Json(ReadinessResponse {
            ready: false,
            reason: Some("shutting_down".to_string()),
        });
    }
    if !state.is_ready() {
        return Json(ReadinessResponse {
            ready: false,
            reason: Some("startup_in_progress".to_string()),
        });
    }
    Json(ReadinessResponse {
        ready: true,
        reason: None,
    })
}

// ============ Status & telemetry ============

async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let catalog_stats = state
        .catalog
        .get_stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let queue_stats = state
        .queue
        .stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "ready": state.is_ready(),
        "uptime_seconds": state.uptime_seconds(),
        "catalog": catalog_stats,
        "jobs": queue_stats,
    })))
}

async fn handle_telemetry(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let catalog_stats = state
        .catalog
        .get_stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let storage = tracker::storage_stats(
        &state.config.storage.catalog_path(),
        &state.config.storage.jobs_path(),
        &state.config.storage.vectors_dir(),
    );

    Ok(Json(serde_json::json!({
        "current_operation": state.tracker.snapshot(),
        "system": tracker::system_stats(),
        "gpu": tracker::gpu_stats(),
        "storage": storage,
        "patterns_detected": catalog_stats.patterns_detected,
        "entities_by_type": catalog_stats.entities_by_type,
        "discoveries_by_type": catalog_stats.discoveries_by_type,
    })))
}

// ============ Query & reads ============

#[derive(Deserialize)]
struct QueryParams {
    q: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    10
}

#[derive(Serialize)]
struct QueryHit {
    chunk_id: String,
    file_id: String,
    score: f32,
    text: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    if !state.config.embedding.is_enabled() {
        return Err(bad_request("embeddings are disabled; vector search unavailable"));
    }

    let hits = state
        .vectors
        .query_by_text(&state.config.embedding, &params.q, params.k)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        let text = state
            .catalog
            .get_chunk(&hit.chunk_id)
            .await
            .map_err(|e| internal_error(e.to_string()))?
            .map(|c| c.text);
        results.push(QueryHit {
            chunk_id: hit.chunk_id,
            file_id: hit.file_id,
            score: hit.score,
            text,
        });
    }

    Ok(Json(serde_json::json!({ "results": results })))
}

async fn handle_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let file = state
        .catalog
        .get_file(&id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("file not found: {}", id)))?;
    let chunks = state
        .catalog
        .iter_chunks(&id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "file": file, "chunks": chunks })))
}

#[derive(Deserialize)]
struct EntitiesParams {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    #[serde(default = "default_entities_limit")]
    limit: i64,
}

fn default_entities_limit() -> i64 {
    100
}

async fn handle_entities(
    State(state): State<AppState>,
    Query(params): Query<EntitiesParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let entity_type = params.entity_type.as_deref().map(EntityType::parse);
    let entities = state
        .catalog
        .list_consolidated(entity_type, params.limit)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "entities": entities })))
}

#[derive(Deserialize)]
struct PatternsParams {
    #[serde(default)]
    min_confidence: f64,
}

async fn handle_patterns(
    State(state): State<AppState>,
    Query(params): Query<PatternsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let patterns = state
        .catalog
        .list_patterns(params.min_confidence)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "patterns": patterns })))
}

#[derive(Deserialize)]
struct DiscoveriesParams {
    #[serde(default)]
    include_dismissed: bool,
}

async fn handle_discoveries(
    State(state): State<AppState>,
    Query(params): Query<DiscoveriesParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let discoveries = state
        .catalog
        .list_discoveries(params.include_dismissed)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "discoveries": discoveries })))
}

#[derive(Deserialize)]
struct FeedbackRequest {
    action: String,
    #[serde(default)]
    notes: Option<String>,
}

async fn handle_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let applied = apply_feedback(&state.catalog, &id, &req.action, req.notes.as_deref())
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    if !applied {
        return Err(not_found(format!("discovery not found: {}", id)));
    }

    Ok(Json(serde_json::json!({
        "id": id,
        "action": req.action,
        "applied": true,
    })))
}

// ============ Job submission ============

#[derive(Deserialize, Default)]
struct ExcavateRequest {
    #[serde(default)]
    scope: Option<String>,
}

async fn handle_excavate(
    State(state): State<AppState>,
    body: Option<Json<ExcavateRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let scope = body.and_then(|Json(req)| req.scope);
    let job_id = state
        .queue
        .enqueue(JobPayload::BatchExtraction { scope }, JobPriority::User)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "status": "queued", "job_id": job_id })))
}

async fn handle_correlate(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let job_id = state
        .queue
        .enqueue(JobPayload::Correlation {}, JobPriority::User)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "status": "queued", "job_id": job_id })))
}

async fn handle_correlate_run(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let result = state
        .engine
        .run()
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({ "status": "completed", "result": result })))
}

// ============ Jobs ============

async fn handle_jobs(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let stats = state
        .queue
        .stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!(stats)))
}

async fn handle_jobs_current(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;

    let job = state
        .queue
        .current()
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "job": job,
        "operation": state.tracker.snapshot(),
    })))
}

#[derive(Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    10
}

async fn handle_jobs_recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    guard(&state)?;
    Ok(Json(serde_json::json!({ "jobs": state.queue.recent(params.limit) })))
}

async fn handle_shutdown(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.request_shutdown();
    Json(serde_json::json!({ "status": "shutting_down" }))
}
