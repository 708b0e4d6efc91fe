//! Health and status endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// GET /health - daemon liveness
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);
    let running = state
        .supervisor
        .list()
        .iter()
        .filter(|a| !a.state.is_stopped())
        .count();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "active_agents": running,
    }))
}

/// GET /status - full status snapshot
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.reporter.snapshot_async().await)
}
