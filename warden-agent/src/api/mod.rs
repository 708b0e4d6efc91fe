//! HTTP control surface for the warden daemon.

pub mod agents;
pub mod error;
pub mod health;

pub use error::ApiError;

use crate::status::StatusReporter;
use crate::supervisor::Supervisor;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub reporter: Arc<StatusReporter>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/status", get(health::status))
        .route("/agents", get(agents::list))
        .route("/agents/start", post(agents::start_all))
        .route("/agents/stop", post(agents::stop_all))
        .route("/agents/{id}", get(agents::status))
        .route("/agents/{id}/start", post(agents::start))
        .route("/agents/{id}/stop", post(agents::stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
