pub mod classifier;
pub mod emitter;
pub mod payload;
pub mod probe;
pub mod provider;
pub mod reconciler;
pub mod scheduler;
pub mod verifier;

pub use reconciler::{IssueRequest, ReconcileError, Reconciler};
