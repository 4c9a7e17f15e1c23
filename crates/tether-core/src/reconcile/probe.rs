//! Poll Probe port: asks the external system for a task's current status.

use tether_types::error::ProbeError;
use tether_types::signal::ExternalStatus;

/// Queries (and best-effort aborts) the external task behind a correlation
/// value.
pub trait PollProbe: Send + Sync {
    /// Fetch the current provider status.
    fn probe(
        &self,
        correlation_value: &str,
    ) -> impl std::future::Future<Output = Result<ExternalStatus, ProbeError>> + Send;

    /// Ask the provider to abort the external task.
    fn abort(
        &self,
        correlation_value: &str,
    ) -> impl std::future::Future<Output = Result<(), ProbeError>> + Send;
}
