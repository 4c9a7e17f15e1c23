//! Deferred action entry point.
//!
//! The scheduler's dispatcher calls the reconciler directly; this route
//! lets an external scheduler deliver the same callbacks over HTTP.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};

use tether_types::signal::SignalOutcome;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

/// POST /api/v1/actions/{name} - Run a `poll` or `check_timeout` callback
/// with the parameters it was scheduled with.
pub async fn run_action(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<SignalOutcome>>, AppError> {
    let clock = RequestClock::start();
    let params: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("action parameters must be a JSON object: {e}")))?;

    let outcome = state.reconciler.handle_action(&name, &params).await?;
    Ok(Json(ApiResponse::success(outcome, &clock)))
}
