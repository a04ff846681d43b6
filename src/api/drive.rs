use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use super::AppState;
use crate::error::{ErrorResponse, TrackingError};
use crate::lifecycle::{EndRequest, StartRequest};
use crate::models::OperationSnapshot;

// Authentication happens upstream (external collaborator); these handlers
// trust the driver id the gateway forwards.

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartDriveRequest {
    pub operation_id: String,
    pub driver_id: String,
    pub organization_id: String,
    /// Driver position, checked against the route origin geofence.
    pub latitude: f64,
    pub longitude: f64,
    /// Request a start before the scheduled time, within the allowance.
    #[serde(default)]
    pub early_start: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndDriveRequest {
    pub operation_id: String,
    pub driver_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub end_reason: Option<String>,
}

/// Start a scheduled drive
#[utoipa::path(
    post,
    path = "/api/drive/start",
    request_body = StartDriveRequest,
    responses(
        (status = 200, description = "Drive started", body = OperationSnapshot),
        (status = 403, description = "Caller is not the assigned driver", body = ErrorResponse),
        (status = 404, description = "Unknown operation", body = ErrorResponse),
        (status = 409, description = "Time window, geofence or state precondition failed", body = ErrorResponse)
    ),
    tag = "drive"
)]
pub async fn start_drive(
    State(state): State<AppState>,
    Json(req): Json<StartDriveRequest>,
) -> Result<Json<OperationSnapshot>, TrackingError> {
    let snapshot = state
        .manager
        .start_operation(&StartRequest {
            operation_id: req.operation_id,
            driver_id: req.driver_id,
            organization_id: req.organization_id,
            latitude: req.latitude,
            longitude: req.longitude,
            early_start: req.early_start,
        })
        .await?;
    Ok(Json(snapshot))
}

/// End an in-progress drive
#[utoipa::path(
    post,
    path = "/api/drive/end",
    request_body = EndDriveRequest,
    responses(
        (status = 200, description = "Drive ended", body = OperationSnapshot),
        (status = 403, description = "Caller is not the assigned driver", body = ErrorResponse),
        (status = 404, description = "Unknown operation", body = ErrorResponse),
        (status = 409, description = "Operation is not in progress", body = ErrorResponse)
    ),
    tag = "drive"
)]
pub async fn end_drive(
    State(state): State<AppState>,
    Json(req): Json<EndDriveRequest>,
) -> Result<Json<OperationSnapshot>, TrackingError> {
    let snapshot = state
        .manager
        .end_operation(&EndRequest {
            operation_id: req.operation_id,
            driver_id: req.driver_id,
            organization_id: req.organization_id,
            end_reason: req.end_reason,
        })
        .await?;
    Ok(Json(snapshot))
}
