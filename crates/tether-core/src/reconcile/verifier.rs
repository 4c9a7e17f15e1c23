//! Signature Verifier port.

use tether_types::error::VerifyError;
use tether_types::signal::WebhookHeaders;

/// Checks that an inbound webhook body is authentic.
///
/// Verification is synchronous and side-effect free; a failure must never
/// touch Task State.
pub trait SignatureVerifier: Send + Sync {
    /// Scheme name for logs.
    fn scheme(&self) -> &str;

    /// Whether the check is keyed by the secret stored on each task. When
    /// true the task is looked up first and its secret passed to `verify`.
    fn needs_task_secret(&self) -> bool {
        false
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError>;
}
