use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Error taxonomy for the tracking core. Precondition failures are surfaced
/// to the initiating client with a human-readable reason; none are retried.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("not authorized: {0}")]
    Authz(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    WrongState(String),
    #[error("outside allowed time window: {0}")]
    OutOfWindow(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("capacity: {0}")]
    Capacity(String),
    #[error("transient I/O: {0}")]
    TransientIo(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TrackingError {
    /// Stable machine-readable code, carried on wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            TrackingError::Authz(_) => "AUTHZ",
            TrackingError::NotFound(_) => "NOT_FOUND",
            TrackingError::WrongState(_) => "WRONG_STATE",
            TrackingError::OutOfWindow(_) => "OUT_OF_WINDOW",
            TrackingError::OutOfRange(_) => "OUT_OF_RANGE",
            TrackingError::Capacity(_) => "CAPACITY",
            TrackingError::TransientIo(_) => "TRANSIENT_IO",
            TrackingError::Database(_) => "DATABASE",
            TrackingError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            TrackingError::Authz(_) => StatusCode::FORBIDDEN,
            TrackingError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackingError::WrongState(_)
            | TrackingError::OutOfWindow(_)
            | TrackingError::OutOfRange(_)
            | TrackingError::Capacity(_) => StatusCode::CONFLICT,
            TrackingError::TransientIo(_)
            | TrackingError::Database(_)
            | TrackingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body returned by REST endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "WRONG_STATE")
    pub error: String,
    /// Human-readable reason
    pub message: String,
}

impl IntoResponse for TrackingError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
