//! REST API handlers for the operator surface
//!
//! Routes:
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET  | `/api/health` | liveness, uptime and trigger state |
//! | GET  | `/api/status` | engine status |
//! | GET  | `/api/jobs/stats` | job counts per provider |
//! | POST | `/api/jobs/requeue-stuck` | run a watchdog sweep now |
//! | POST | `/api/sync` | manual sync trigger |
//! | GET  | `/api/schedule` | schedule table snapshot |
//! | GET  | `/metrics` | prometheus text exposition |

use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics;
use crate::scheduler::SchedulerError;

use super::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub tick_loop_running: bool,
    pub tracked_events: usize,
}

/// Manual sync request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSyncRequest {
    pub tenant_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub event_id: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(engine_status))
        .route("/api/jobs/stats", get(job_stats))
        .route("/api/jobs/requeue-stuck", post(requeue_stuck))
        .route("/api/sync", post(manual_sync))
        .route("/api/schedule", get(schedule_snapshot))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Map an engine error onto an HTTP status
fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Scheduler(SchedulerError::EventNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Scheduler(SchedulerError::InvalidTarget { .. })
        | Error::Scheduler(SchedulerError::PolicyInput { .. }) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(endpoint: &str, started: Instant, err: Error) -> axum::response::Response {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!(endpoint, error = %err, "API request failed");
    } else {
        tracing::warn!(endpoint, error = %err, "API request rejected");
    }
    metrics::record_api_request(endpoint, status.as_u16(), started.elapsed().as_secs_f64());
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

fn ok_response<T: Serialize>(endpoint: &str, started: Instant, data: T) -> axum::response::Response {
    metrics::record_api_request(endpoint, 200, started.elapsed().as_secs_f64());
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.status().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tick_loop_running: status.trigger.is_running,
        tracked_events: status.tracked_events,
    })
}

async fn engine_status(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let status = state.engine.status().await;
    ok_response("status", started, status)
}

/// Pending/running/success/failed counts per provider
async fn job_stats(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    match state.engine.job_stats().await {
        Ok(counts) => ok_response("jobs_stats", started, counts),
        Err(e) => error_response("jobs_stats", started, e),
    }
}

async fn requeue_stuck(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    match state.engine.requeue_stuck().await {
        Ok(report) => {
            tracing::info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Stuck jobs swept via API"
            );
            ok_response("requeue_stuck", started, report)
        }
        Err(e) => error_response("requeue_stuck", started, e),
    }
}

/// Manual sync trigger
async fn manual_sync(
    State(state): State<AppState>,
    Json(request): Json<ManualSyncRequest>,
) -> impl IntoResponse {
    let started = Instant::now();
    tracing::info!(
        tenant_id = %request.tenant_id,
        provider_id = %request.provider_id,
        event_id = ?request.event_id,
        "Manual sync requested"
    );

    match state
        .engine
        .manual_sync(
            &request.tenant_id,
            &request.provider_id,
            request.event_id.as_deref(),
        )
        .await
    {
        Ok(report) => ok_response("sync", started, report),
        Err(e) => error_response("sync", started, e),
    }
}

async fn schedule_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    ok_response("schedule", started, state.engine.schedule())
}

/// Prometheus text exposition
async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response()
        }
    }
}
