//! JSON HTTP surface for the transfer orchestrator.
//!
//! Thin presentation layer: handlers translate transport requests into
//! the manager's public operations and render snapshots. Not-found and
//! invalid-state outcomes map to distinct status codes.

pub mod error;
pub mod models;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::transfer::{TransferManager, TransferTool};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TransferManager>,
    pub tool: Arc<dyn TransferTool>,
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/tasks", routes::tasks_router())
        .nest("/api/health", routes::health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
