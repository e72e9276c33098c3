//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{SessionDetail, SessionOverview};
use crate::http::middleware::require_admin;
use crate::resilience::BreakerStatus;
use crate::util::time::uptime_secs;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the admin router
pub fn build_router(state: AppState) -> Router {
    // Read-only visibility, no auth required
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/:id", get(session_detail_handler));

    // Administrative actions (token + rate limit)
    let admin_routes = Router::new()
        .route("/admin/reconcile", post(reconcile_handler))
        .route("/admin/sessions/:id/stop", post(stop_session_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    active_players: usize,
    creation_breaker: BreakerStatus,
    executed_handoffs: u64,
    failed_handoffs: u64,
    pending_background_tasks: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.registry;

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: registry.active_sessions(),
        active_players: registry.total_players(),
        creation_breaker: registry.breaker_status(),
        executed_handoffs: state.main_tick.executed_tasks(),
        failed_handoffs: state.main_tick.failed_handoffs(),
        pending_background_tasks: registry.context().workers.pending(),
    })
}

// ============================================================================
// Session endpoints
// ============================================================================

async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionOverview>> {
    let sessions = state
        .registry
        .sessions()
        .iter()
        .map(|session| session.overview())
        .collect();
    Json(sessions)
}

async fn session_detail_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetail>, AppError> {
    let session = state
        .registry
        .get_session(&id)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;

    Ok(Json(session.detail()))
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[derive(Serialize)]
struct ReconcileResponse {
    cleaned: usize,
    active_sessions: usize,
}

async fn reconcile_handler(State(state): State<AppState>) -> Json<ReconcileResponse> {
    let cleaned = state.registry.reconcile_orphans();
    info!(cleaned, "Reconciliation requested over admin API");

    Json(ReconcileResponse {
        cleaned,
        active_sessions: state.registry.active_sessions(),
    })
}

#[derive(Serialize)]
struct StopResponse {
    session_id: Uuid,
    stopped: bool,
}

async fn stop_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, AppError> {
    let session = state
        .registry
        .get_session(&id)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;

    let stopped = state.registry.remove_session(&session.id());
    info!(session_id = %id, stopped, "Session stop requested over admin API");

    Ok(Json(StopResponse {
        session_id: id,
        stopped,
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
