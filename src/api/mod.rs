//! HTTP API: submission, worker-facing and observability endpoints.

pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::engine::{Orchestrator, Progress};
use crate::worker::runtime::WorkerRegistration;

pub use types::{
    CompleteRequest, ErrorBody, ExecutionStatusResponse, ExecutionView, FailRequest,
    HeartbeatRequest, HeartbeatResponse, NodeView, SubmitExecutionRequest,
    SubmitExecutionResponse,
};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Error wrapper mapping the taxonomy onto HTTP statuses.
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::CyclicGraph(_)
        | OrchestratorError::InvalidDag(_)
        | OrchestratorError::InvalidPriority(_)
        | OrchestratorError::Serialization(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::ExecutionNotFound(_) | OrchestratorError::WorkerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::InvalidDispatchToken(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::InvalidTransition(_) => StatusCode::CONFLICT,
        OrchestratorError::QueueFull(_)
        | OrchestratorError::NoCapableWorker(_)
        | OrchestratorError::LockHeld { .. }
        | OrchestratorError::VersionConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/executions", post(submit_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/pause", post(pause_execution))
        .route("/executions/{id}/resume", post(resume_execution))
        .route("/workers", get(list_workers))
        .route("/workers/register", post(register_worker))
        .route("/workers/{id}", delete(deregister_worker))
        .route("/workers/{id}/heartbeat", post(heartbeat))
        .route("/workers/{id}/poll", post(poll))
        .route("/dispatches/{token}/start", post(dispatch_started))
        .route("/dispatches/{token}/progress", post(dispatch_progress))
        .route("/dispatches/{token}/complete", post(dispatch_completed))
        .route("/dispatches/{token}/fail", post(dispatch_failed))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/dead-letters", get(dead_letters))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// =============================================================================
// Submission API
// =============================================================================

async fn submit_execution(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitExecutionRequest>,
) -> ApiResult<impl IntoResponse> {
    let execution_id = state
        .orchestrator
        .submit(&payload.workflow_id, payload.nodes)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitExecutionResponse { execution_id }),
    ))
}

async fn list_executions(State(state): State<ApiState>) -> ApiResult<Json<Vec<ExecutionView>>> {
    let executions = state.orchestrator.list_executions().await?;
    Ok(Json(executions.iter().map(ExecutionView::from).collect()))
}

async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionView>> {
    let execution = state.orchestrator.get_execution(id).await?;
    Ok(Json(ExecutionView::from(&execution)))
}

async fn cancel_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.cancel(id).await?;
    let execution = state.orchestrator.get_execution(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecutionStatusResponse {
            execution_id: id,
            status: execution.status,
        }),
    ))
}

async fn pause_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    state.orchestrator.pause(id).await?;
    let execution = state.orchestrator.get_execution(id).await?;
    Ok(Json(ExecutionStatusResponse {
        execution_id: id,
        status: execution.status,
    }))
}

async fn resume_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    state.orchestrator.resume(id).await?;
    // Re-enqueue ready nodes right away instead of waiting for reconciliation
    state.orchestrator.tick(id).await?;
    let execution = state.orchestrator.get_execution(id).await?;
    Ok(Json(ExecutionStatusResponse {
        execution_id: id,
        status: execution.status,
    }))
}

// =============================================================================
// Worker-facing API
// =============================================================================

async fn list_workers(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.active_workers().await?))
}

async fn register_worker(
    State(state): State<ApiState>,
    Json(payload): Json<WorkerRegistration>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .orchestrator
        .register_worker(
            &payload.worker_id,
            &payload.hostname,
            payload.capabilities,
            payload.max_concurrency,
        )
        .await?;
    Ok(Json(record))
}

async fn deregister_worker(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.orchestrator.deregister_worker(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::WorkerNotFound(id).into())
    }
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(payload): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let cancelled = state
        .orchestrator
        .heartbeat(&id, payload.current_load)
        .await?;
    Ok(Json(HeartbeatResponse { cancelled }))
}

async fn poll(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Response> {
    match state.orchestrator.poll(&id).await? {
        Some(dispatch) => Ok(Json(dispatch).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn dispatch_started(
    State(state): State<ApiState>,
    Path(token): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.report_started(token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dispatch_progress(
    State(state): State<ApiState>,
    Path(token): Path<Uuid>,
    Json(payload): Json<Progress>,
) -> ApiResult<StatusCode> {
    state.orchestrator.report_progress(token, payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dispatch_completed(
    State(state): State<ApiState>,
    Path(token): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .report_completed(token, payload.output)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dispatch_failed(
    State(state): State<ApiState>,
    Path(token): Path<Uuid>,
    Json(payload): Json<FailRequest>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .report_failed(token, &payload.error, payload.retryable)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Observability
// =============================================================================

async fn queue_stats(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.queue_stats().await?))
}

async fn dead_letters(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.dead_letters().await)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let report = state.orchestrator.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
