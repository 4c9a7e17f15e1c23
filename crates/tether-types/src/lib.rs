//! Shared domain types for Tether.
//!
//! Task State, resolution signals and outcomes, configuration, and the error
//! enums shared by the core and infrastructure layers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod signal;
pub mod task;
