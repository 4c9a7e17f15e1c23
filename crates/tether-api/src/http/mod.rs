//! HTTP surface for Tether.
//!
//! Axum routes under `/api/v1/`: the webhook entry point, the deferred
//! action entry point and task management. Responses use a shared envelope.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
