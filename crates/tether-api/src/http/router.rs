//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`; `/health` is also served at the root
//! for load balancers.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/webhooks/{provider}", post(handlers::webhook::receive_webhook))
        .route("/actions/{name}", post(handlers::action::run_action))
        .route("/tasks", post(handlers::task::issue_task))
        .route("/tasks/{provider}/{value}", get(handlers::task::get_task))
        .route(
            "/tasks/{provider}/{value}/cancel",
            post(handlers::task::cancel_task),
        )
        .route("/health", get(health_check));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness check.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
