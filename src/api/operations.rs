use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::AppState;
use crate::error::{ErrorResponse, TrackingError};
use crate::models::{OperationStatus, OperationSummary};

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct OperationListQuery {
    /// Optional status filter (SCHEDULED, IN_PROGRESS, COMPLETED, CANCELLED)
    pub status: Option<String>,
}

/// List an organization's operations, optionally filtered by status
#[utoipa::path(
    get,
    path = "/api/operations/{organization_id}",
    params(
        ("organization_id" = String, Path, description = "Organization id"),
        OperationListQuery
    ),
    responses(
        (status = 200, description = "Operations ordered by scheduled start", body = [OperationSummary]),
        (status = 404, description = "Unknown status filter", body = ErrorResponse)
    ),
    tag = "operations"
)]
pub async fn list_operations(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    Query(query): Query<OperationListQuery>,
) -> Result<Json<Vec<OperationSummary>>, TrackingError> {
    let status = match &query.status {
        Some(raw) => Some(
            OperationStatus::parse(raw)
                .ok_or_else(|| TrackingError::NotFound(format!("status {raw}")))?,
        ),
        None => None,
    };
    let operations = state
        .manager
        .store()
        .operations_by_organization(&organization_id, status)
        .await?;
    Ok(Json(operations.iter().map(|op| op.summary()).collect()))
}

/// List the operations assigned to a driver within an organization
#[utoipa::path(
    get,
    path = "/api/operations/{organization_id}/driver/{driver_id}",
    params(
        ("organization_id" = String, Path, description = "Organization id"),
        ("driver_id" = String, Path, description = "Driver id")
    ),
    responses(
        (status = 200, description = "Operations ordered by scheduled start", body = [OperationSummary])
    ),
    tag = "operations"
)]
pub async fn driver_operations(
    State(state): State<AppState>,
    Path((organization_id, driver_id)): Path<(String, String)>,
) -> Result<Json<Vec<OperationSummary>>, TrackingError> {
    let operations = state
        .manager
        .store()
        .operations_for_driver(&driver_id, &organization_id)
        .await?;
    Ok(Json(operations.iter().map(|op| op.summary()).collect()))
}
