//! Webhook entry point.
//!
//! The raw body is passed through untouched: signature schemes hash the
//! exact bytes the provider sent.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;

use tether_types::signal::{SignalOutcome, WebhookHeaders};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

/// POST /api/v1/webhooks/{provider} - Receive a provider callback.
///
/// Unknown tasks, replays and filtered events all answer 200 so the
/// provider stops retrying; only authentication (401), malformed bodies
/// (400) and unknown provider routes (404) are errors.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<SignalOutcome>>, AppError> {
    let clock = RequestClock::start();
    let headers = webhook_headers(&headers);

    let outcome = state
        .reconciler
        .handle_webhook(&provider, &headers, &body)
        .await?;

    tracing::debug!(provider = %provider, outcome = ?outcome, "webhook handled");
    Ok(Json(ApiResponse::success(outcome, &clock)))
}

/// Copy the textual headers; values that are not visible ASCII are dropped.
fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}
