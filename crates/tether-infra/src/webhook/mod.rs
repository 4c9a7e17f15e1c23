//! Signature verifiers for inbound webhooks.
//!
//! One `SignatureVerifier` implementation per scheme, built from a
//! provider's `VerificationConfig` by `build_verifier`.

pub mod credentials;
pub mod ecdsa;
pub mod hmac_sha256;

use std::sync::Arc;

use tether_core::reconcile::verifier::SignatureVerifier;
use tether_types::config::VerificationConfig;
use tether_types::error::{ConfigError, VerifyError};
use tether_types::signal::WebhookHeaders;

pub use self::credentials::{BasicVerifier, BearerVerifier};
pub use self::ecdsa::EcdsaP256Verifier;
pub use self::hmac_sha256::{HmacSha256Verifier, PerTaskHmacSha256Verifier};

/// Explicit "no verification" mode. Only ever built from `scheme = "none"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVerification;

impl SignatureVerifier for NoVerification {
    fn scheme(&self) -> &str {
        "none"
    }

    fn verify(
        &self,
        _headers: &WebhookHeaders,
        _body: &[u8],
        _task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Build the verifier for a provider's configured scheme.
///
/// Key material is parsed here, so a bad public key fails at startup rather
/// than on the first delivery.
pub fn build_verifier(
    provider: &str,
    config: &VerificationConfig,
) -> Result<Arc<dyn SignatureVerifier>, ConfigError> {
    let verifier: Arc<dyn SignatureVerifier> = match config {
        VerificationConfig::None => {
            tracing::warn!(provider, "webhook verification disabled by configuration");
            Arc::new(NoVerification)
        }
        VerificationConfig::HmacSha256 { header, secret } => {
            Arc::new(HmacSha256Verifier::new(header, secret.as_bytes(), false))
        }
        VerificationConfig::PrefixedHmacSha256 { header, secret } => {
            Arc::new(HmacSha256Verifier::new(header, secret.as_bytes(), true))
        }
        VerificationConfig::PerTaskHmacSha256 { header, prefixed } => {
            Arc::new(PerTaskHmacSha256Verifier::new(header, *prefixed))
        }
        VerificationConfig::EcdsaP256 {
            public_key,
            timestamp_header,
            signature_header,
        } => Arc::new(
            EcdsaP256Verifier::from_public_key(public_key, timestamp_header, signature_header)
                .map_err(|e| ConfigError::provider(provider, e.to_string()))?,
        ),
        VerificationConfig::Bearer { token } => Arc::new(BearerVerifier::new(token)),
        VerificationConfig::Basic { username, password } => {
            Arc::new(BasicVerifier::new(username, password))
        }
    };
    Ok(verifier)
}

/// Constant-time byte comparison (XOR-based).
///
/// Returns true if and only if `a == b`. Time taken is independent of
/// how many bytes match.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Required header, trimmed; absence is a failure, never a skip.
pub(crate) fn required_header<'a>(
    headers: &'a WebhookHeaders,
    name: &str,
) -> Result<&'a str, VerifyError> {
    headers
        .get_trimmed(name)
        .ok_or_else(|| VerifyError::MissingHeader(name.to_string()))
}
