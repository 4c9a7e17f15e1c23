//! Reconciliation logic for Tether.
//!
//! Holds the port traits the host implements (task storage, callback
//! scheduling, completion emission, status probing, signature verification)
//! and the `Reconciler` that drives suspended tasks to exactly one terminal
//! outcome.

pub mod reconcile;
pub mod repository;
