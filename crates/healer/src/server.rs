//! HTTP server for deployment remediation.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Receiving deployment webhooks from the platform
//! - Manual retries of a project's failure
//! - Querying failure records and loop status
//! - Cancelling a live cycle

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::HealerError;
use crate::intake::{Intake, IntakeOutcome};
use crate::store::RemediationStore;
use crate::types::{FailureRecord, FixAttempt};
use crate::worker::{CycleRegistry, CycleSummary};

/// Server state shared across handlers.
pub struct ServerState {
    /// Failure intake
    pub intake: Intake,
    /// Remediation state
    pub store: Arc<dyn RemediationStore>,
    /// Live cycles
    pub registry: CycleRegistry,
    /// Attempt budget per failure
    pub max_attempts: u32,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/webhooks/deployment", post(webhook_handler))
        .route("/api/projects/{project_id}/retry", post(retry_handler))
        .route("/api/failures/{failure_id}", get(failure_handler))
        .route("/api/failures/{failure_id}/cancel", post(cancel_handler))
        .route("/api/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: &str,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Deploy healer server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Optional body of a manual retry.
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    /// Failure to retry (default: latest of the project)
    #[serde(default)]
    pub failure_id: Option<Uuid>,
}

/// Error body for rejected requests.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: &'static str,
    reason: String,
}

/// Failure record with its attempts.
#[derive(Debug, Serialize)]
struct FailureDetail {
    #[serde(flatten)]
    record: FailureRecord,
    attempts: Vec<FixAttempt>,
}

/// Overall loop status.
#[derive(Debug, Serialize)]
struct ServerStatus {
    status: &'static str,
    enabled: bool,
    storage: &'static str,
    max_attempts: u32,
    active_cycles: Vec<CycleSummary>,
    projects: Vec<ProjectStatus>,
}

/// Guard state of one registered project.
#[derive(Debug, Serialize)]
struct ProjectStatus {
    id: String,
    repository: String,
    is_fixing: bool,
    fixing_since: Option<DateTime<Utc>>,
}

/// Acknowledgement of a cancellation request.
#[derive(Debug, Serialize)]
struct CancelResponse {
    status: &'static str,
    failure_id: Uuid,
}

/// Map a rejection to its status code.
fn error_response(err: &HealerError) -> Response {
    let status = match err {
        HealerError::Disabled | HealerError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HealerError::AlreadyFixing { .. } => StatusCode::CONFLICT,
        HealerError::ProjectNotFound(_)
        | HealerError::FailureNotFound(_)
        | HealerError::NoFailureRecorded { .. } => StatusCode::NOT_FOUND,
        HealerError::InvalidEvent(_) | HealerError::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        error!("Request failed: {err}");
    }
    (
        status,
        Json(ErrorResponse {
            status: "rejected",
            error: err.category(),
            reason: err.to_string(),
        }),
    )
        .into_response()
}

fn outcome_response(outcome: &IntakeOutcome) -> Response {
    let status = match outcome {
        IntakeOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        IntakeOutcome::Skipped { .. } => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Platform webhook handler.
async fn webhook_handler(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let event: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Could not parse deployment webhook: {e}");
            return error_response(&HealerError::InvalidEvent(e.to_string()));
        }
    };

    match state.intake.handle_webhook(&event).await {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(&e),
    }
}

/// Manual retry handler. The body is optional.
async fn retry_handler(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RetryRequest::default()
    } else {
        match serde_json::from_slice::<RetryRequest>(&body) {
            Ok(request) => request,
            Err(e) => return error_response(&HealerError::InvalidEvent(e.to_string())),
        }
    };

    info!(project_id = %project_id, "Manual retry requested");
    match state
        .intake
        .handle_manual_retry(&project_id, request.failure_id)
        .await
    {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(&e),
    }
}

fn parse_failure_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(&HealerError::InvalidEvent(format!(
            "'{raw}' is not a valid failure id"
        )))
    })
}

/// Failure record handler.
async fn failure_handler(
    State(state): State<Arc<ServerState>>,
    Path(failure_id): Path<String>,
) -> Response {
    let failure_id = match parse_failure_id(&failure_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let record = match state.store.get_failure(failure_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(&HealerError::FailureNotFound(failure_id)),
        Err(e) => return error_response(&e),
    };
    match state.store.attempts_for(failure_id).await {
        Ok(attempts) => Json(FailureDetail { record, attempts }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Cancel a live cycle; the orchestrator interrupts the record and frees the guard.
async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(failure_id): Path<String>,
) -> Response {
    let failure_id = match parse_failure_id(&failure_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if state.registry.cancel(failure_id).await {
        info!(failure_id = %failure_id, "Cycle cancellation requested");
        return (
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                status: "cancelling",
                failure_id,
            }),
        )
            .into_response();
    }

    match state.store.get_failure(failure_id).await {
        Ok(Some(record)) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                status: "rejected",
                error: "not_running",
                reason: format!(
                    "failure {failure_id} has no live cycle (status {})",
                    record.status.as_str()
                ),
            }),
        )
            .into_response(),
        Ok(None) => error_response(&HealerError::FailureNotFound(failure_id)),
        Err(e) => error_response(&e),
    }
}

/// Server status handler.
async fn status_handler(State(state): State<Arc<ServerState>>) -> Response {
    let mut projects = match state.store.list_projects().await {
        Ok(projects) => projects,
        Err(e) => return error_response(&e),
    };
    projects.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ServerStatus {
        status: "running",
        enabled: state.intake.is_enabled(),
        storage: state.store.storage_type(),
        max_attempts: state.max_attempts,
        active_cycles: state.registry.summaries().await,
        projects: projects
            .into_iter()
            .map(|p| ProjectStatus {
                id: p.id,
                repository: p.repository,
                is_fixing: p.is_fixing,
                fixing_since: p.fixing_since,
            })
            .collect(),
    })
    .into_response()
}
