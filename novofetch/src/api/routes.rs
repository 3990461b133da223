//! Task and health routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use super::AppState;
use super::error::{ApiError, ApiResult};
use super::models::{HealthResponse, TaskDetailResponse, TaskResponse};
use crate::transfer::DeliveryRequest;

/// Create the task router.
pub fn tasks_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/{id}", get(get_task).delete(remove_task))
        .route("/{id}/start", post(start_task))
        .route("/{id}/cancel", post(cancel_task))
}

/// Create the health router.
pub fn health_router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Register a new transfer task from a validated delivery request.
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<DeliveryRequest>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let task = state.manager.create_task(request)?;
    Ok((StatusCode::CREATED, Json(TaskResponse::from(task))))
}

/// List all tasks.
async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskResponse>> {
    let tasks = state
        .manager
        .list()
        .into_iter()
        .map(TaskResponse::from)
        .collect();
    Json(tasks)
}

/// Fetch one task with its log.
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskDetailResponse>> {
    let task = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("task with id '{}' not found", id)))?;
    Ok(Json(TaskDetailResponse::from(task)))
}

/// Start a pending task. Returns as soon as the execution unit is spawned.
async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.start_task(&id)?;
    Ok(StatusCode::ACCEPTED)
}

/// Cancel a running or pending task.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.cancel_task(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove a finished task.
async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.remove_task(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let tool_available = state.tool.is_available();
    Json(HealthResponse {
        status: if tool_available {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        tool_available,
        tool_version: state.tool.version(),
    })
}
