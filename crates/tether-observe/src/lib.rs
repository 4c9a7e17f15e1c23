//! Observability setup for Tether.

pub mod tracing_setup;
