//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use tether_core::reconcile::ReconcileError;
use tether_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Reconcile(ReconcileError),
    NotFound(String),
    /// Request body could not be decoded.
    Validation(String),
}

impl From<ReconcileError> for AppError {
    fn from(e: ReconcileError) -> Self {
        AppError::Reconcile(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Reconcile(e) => {
                let status = StatusCode::from_u16(e.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let code = match e {
                    ReconcileError::Unauthorized(_) => "UNAUTHORIZED",
                    ReconcileError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
                    ReconcileError::InvalidParameters(_) => "VALIDATION_ERROR",
                    ReconcileError::UnknownProvider(_) => "PROVIDER_NOT_FOUND",
                    ReconcileError::Persistence(RepositoryError::Conflict(_)) => "CONFLICT",
                    ReconcileError::Persistence(_) => "PERSISTENCE_ERROR",
                    ReconcileError::Scheduling(_) => "SCHEDULING_ERROR",
                    ReconcileError::Emission(_) => "EMISSION_ERROR",
                };
                (status, code, e.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }
        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}
