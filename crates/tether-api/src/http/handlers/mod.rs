//! HTTP handlers.

pub mod action;
pub mod task;
pub mod webhook;
