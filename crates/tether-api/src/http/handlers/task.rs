//! Task issue, lookup and cancel handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use tether_core::reconcile::IssueRequest;
use tether_types::task::TaskState;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

/// Request body for issuing a task.
#[derive(Debug, Deserialize)]
pub struct IssueTaskRequest {
    pub provider: String,
    pub correlation_value: String,
    /// Per-task webhook secret, for providers that verify with one.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn task_path(task: &TaskState) -> String {
    format!("/api/v1/tasks/{}/{}", task.provider, task.correlation_value)
}

/// POST /api/v1/tasks - Issue a waiting task and arm its first callback.
pub async fn issue_task(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<TaskState>>), AppError> {
    let clock = RequestClock::start();
    let req: IssueTaskRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid issue request: {e}")))?;

    let task = state
        .reconciler
        .issue(IssueRequest {
            provider: req.provider,
            correlation_value: req.correlation_value,
            webhook_secret: req.webhook_secret.map(String::into_bytes),
        })
        .await?;

    let path = task_path(&task);
    let resp = ApiResponse::success(task, &clock)
        .with_link("self", &path)
        .with_link("cancel", &format!("{path}/cancel"));
    Ok((StatusCode::CREATED, Json(resp)))
}

/// GET /api/v1/tasks/{provider}/{value} - Show one task.
pub async fn get_task(
    State(state): State<AppState>,
    Path((provider, value)): Path<(String, String)>,
) -> Result<Json<ApiResponse<TaskState>>, AppError> {
    let clock = RequestClock::start();
    let task = state
        .reconciler
        .find_task(&provider, &value)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no task '{value}' for provider '{provider}'")))?;

    let path = task_path(&task);
    Ok(Json(ApiResponse::success(task, &clock).with_link("self", &path)))
}

/// POST /api/v1/tasks/{provider}/{value}/cancel - Ask the provider to abort.
///
/// Never changes the task; the abort resolves it through the normal
/// webhook or poll path.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path((provider, value)): Path<(String, String)>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let clock = RequestClock::start();
    let requested = state.reconciler.cancel(&provider, &value).await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "abort_requested": requested }),
        &clock,
    )))
}
