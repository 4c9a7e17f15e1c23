//! Infrastructure layer for Tether.
//!
//! Implements the ports defined in `tether-core`: SQLite task storage,
//! webhook signature verifiers, the timer-based callback scheduler, the
//! broadcast completion emitter and the HTTP status probe. Also loads
//! configuration and builds the provider registry from it.

pub mod config;
pub mod provider;
pub mod runtime;
pub mod sqlite;
pub mod webhook;
