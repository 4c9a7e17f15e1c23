//! HMAC-SHA256 body signatures, raw or `sha256=`-prefixed, keyed per
//! integration or per task.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tether_core::reconcile::verifier::SignatureVerifier;
use tether_types::error::VerifyError;
use tether_types::signal::WebhookHeaders;

use super::required_header;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify `hex(HMAC-SHA256(secret, body))` against a header value.
///
/// With `prefixed`, the value must start with `sha256=`, which is stripped
/// before decoding; a missing prefix or an empty remainder fails
/// immediately. The MAC comparison is constant-time.
pub fn verify_hmac_sha256(
    secret: &[u8],
    body: &[u8],
    header_value: &str,
    prefixed: bool,
) -> Result<(), VerifyError> {
    let signature_hex = if prefixed {
        header_value
            .trim()
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(VerifyError::InvalidSignature)?
            .trim()
    } else {
        header_value.trim()
    };
    if signature_hex.is_empty() {
        return Err(VerifyError::InvalidSignature);
    }

    let expected = hex::decode(signature_hex).map_err(|_| VerifyError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| VerifyError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| VerifyError::InvalidSignature)
}

/// Compute `hex(HMAC-SHA256(secret, body))`.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, VerifyError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| VerifyError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// HMAC keyed by one secret shared by the whole integration.
pub struct HmacSha256Verifier {
    header: String,
    secret: Vec<u8>,
    prefixed: bool,
}

impl HmacSha256Verifier {
    pub fn new(header: impl Into<String>, secret: impl Into<Vec<u8>>, prefixed: bool) -> Self {
        Self {
            header: header.into(),
            secret: secret.into(),
            prefixed,
        }
    }
}

impl SignatureVerifier for HmacSha256Verifier {
    fn scheme(&self) -> &str {
        if self.prefixed {
            "prefixed_hmac_sha256"
        } else {
            "hmac_sha256"
        }
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        _task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let value = required_header(headers, &self.header)?;
        verify_hmac_sha256(&self.secret, body, value, self.prefixed)
    }
}

/// HMAC keyed by the secret stored on the addressed task.
pub struct PerTaskHmacSha256Verifier {
    header: String,
    prefixed: bool,
}

impl PerTaskHmacSha256Verifier {
    pub fn new(header: impl Into<String>, prefixed: bool) -> Self {
        Self {
            header: header.into(),
            prefixed,
        }
    }
}

impl SignatureVerifier for PerTaskHmacSha256Verifier {
    fn scheme(&self) -> &str {
        "per_task_hmac_sha256"
    }

    fn needs_task_secret(&self) -> bool {
        true
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let secret = task_secret
            .filter(|s| !s.is_empty())
            .ok_or(VerifyError::MissingSecret)?;
        let value = required_header(headers, &self.header)?;
        verify_hmac_sha256(secret, body, value, self.prefixed)
    }
}
