//! Completion Emitter port.

use tether_types::error::EmitError;
use tether_types::task::Completion;

/// Delivers the final result of a task to the workflow engine.
///
/// Called exactly once per task, right after the terminal transition was
/// persisted.
pub trait CompletionEmitter: Send + Sync {
    fn emit(
        &self,
        channel: &str,
        payload_type: &str,
        completion: &Completion,
    ) -> impl std::future::Future<Output = Result<(), EmitError>> + Send;
}
