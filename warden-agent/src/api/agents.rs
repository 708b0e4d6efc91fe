//! Agent control endpoints.

use super::error::ApiError;
use super::AppState;
use crate::supervisor::{AgentStatus, ControlResult};
use axum::extract::{Path, State};
use axum::Json;
use tracing::info;

/// GET /agents
pub async fn list(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    Json(state.supervisor.list())
}

/// GET /agents/{id}
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentStatus>, ApiError> {
    let mut statuses = state.supervisor.status(Some(&id))?;
    statuses
        .pop()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown agent: {id}")))
}

/// POST /agents/start
pub async fn start_all(State(state): State<AppState>) -> Result<Json<Vec<ControlResult>>, ApiError> {
    info!("Start requested for all agents");
    Ok(Json(state.supervisor.start(None)?))
}

/// POST /agents/stop
pub async fn stop_all(State(state): State<AppState>) -> Result<Json<Vec<ControlResult>>, ApiError> {
    info!("Stop requested for all agents");
    Ok(Json(state.supervisor.stop(None).await?))
}

/// POST /agents/{id}/start
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResult>, ApiError> {
    info!(agent_id = %id, "Start requested");
    single(state.supervisor.start(Some(&id))?, &id)
}

/// POST /agents/{id}/stop
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResult>, ApiError> {
    info!(agent_id = %id, "Stop requested");
    single(state.supervisor.stop(Some(&id)).await?, &id)
}

fn single(mut results: Vec<ControlResult>, id: &str) -> Result<Json<ControlResult>, ApiError> {
    results
        .pop()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown agent: {id}")))
}
