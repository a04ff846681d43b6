use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;
use crate::models::BusStatus;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Buses with a live location entry
    pub tracked_buses: usize,
    /// Open passenger WebSocket connections
    pub passenger_sessions: usize,
    /// Registered driver connections
    pub driver_sessions: usize,
    /// Passengers with in-flight detection state
    pub tracked_passengers: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health and live store sizes", body = HealthResponse)
    ),
    tag = "status"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        tracked_buses: state.manager.cache().len(),
        passenger_sessions: state.manager.sessions().passenger_count(),
        driver_sessions: state.manager.sessions().driver_count(),
        tracked_passengers: state.manager.detection().len(),
    })
}

/// Live status of every tracked bus in an organization
#[utoipa::path(
    get,
    path = "/api/status/{organization_id}",
    params(
        ("organization_id" = String, Path, description = "Organization the caller belongs to")
    ),
    responses(
        (status = 200, description = "Live bus statuses", body = [BusStatus])
    ),
    tag = "status"
)]
pub async fn organization_status(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
) -> Json<Vec<BusStatus>> {
    Json(state.manager.organization_statuses(&organization_id))
}
