//! In-process runtime adapters for the reconciliation ports.

pub mod emitter;
pub mod probe;
pub mod scheduler;

pub use emitter::{BroadcastEmitter, EmittedCompletion};
pub use probe::HttpPollProbe;
pub use scheduler::{ScheduledCallback, TokioCallbackScheduler};
