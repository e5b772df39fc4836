//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::ManagerError;
use crate::lifecycle::manager::OperationOutcome;
use crate::models::instance::AgentInstance;
use crate::scheduler::state::ScheduleRunState;
use crate::server::state::ServerState;
use crate::utils::{format_uptime, version_info};

/// Error body returned by every failing handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps manager errors onto HTTP statuses
pub struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::StateConflict { .. } | ManagerError::CapacityConflict(_) => {
                StatusCode::CONFLICT
            }
            ManagerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            err if err.is_transient() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime: String,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "runner-manager".to_string(),
        version: version.version,
        uptime: format_uptime(Utc::now() - state.started_at),
    })
}

/// Version response
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

pub async fn runners_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<AgentInstance>> {
    Json(state.lifecycle.list().await)
}

pub async fn runner_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentInstance>, ApiError> {
    Ok(Json(state.lifecycle.get(&id).await?))
}

pub async fn start_runner_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationOutcome>, ApiError> {
    Ok(Json(state.lifecycle.start(&id).await?))
}

pub async fn stop_runner_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationOutcome>, ApiError> {
    Ok(Json(state.lifecycle.stop(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveParams {
    #[serde(default)]
    pub keep_container: bool,
}

pub async fn remove_runner_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(params): Query<RemoveParams>,
) -> Result<Json<OperationOutcome>, ApiError> {
    Ok(Json(state.lifecycle.remove(&id, params.keep_container).await?))
}

/// Scheduler status response
#[derive(Debug, Serialize)]
pub struct SchedulerResponse {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ScheduleRunState>,
}

pub async fn scheduler_handler(State(state): State<Arc<ServerState>>) -> Json<SchedulerResponse> {
    let snapshot = match &state.run_state {
        Some(handle) => Some(handle.snapshot().await),
        None => None,
    };
    Json(SchedulerResponse {
        enabled: snapshot.is_some(),
        state: snapshot,
    })
}

/// Most recent deliveries first
pub async fn notifications_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut records = state.deliveries.snapshot();
    records.reverse();
    Json(records)
}
