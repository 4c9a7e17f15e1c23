//! Static credential checks on the `Authorization` header.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tether_core::reconcile::verifier::SignatureVerifier;
use tether_types::error::VerifyError;
use tether_types::signal::WebhookHeaders;

use super::{constant_time_eq, required_header};

const AUTHORIZATION: &str = "authorization";

/// Strip a case-insensitive auth scheme (`Bearer`, `Basic`) from a header
/// value.
fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let (given, rest) = value.split_once(' ')?;
    given
        .eq_ignore_ascii_case(scheme)
        .then(|| rest.trim())
        .filter(|rest| !rest.is_empty())
}

/// `Authorization: Bearer <token>`.
pub struct BearerVerifier {
    token: String,
}

impl BearerVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl SignatureVerifier for BearerVerifier {
    fn scheme(&self) -> &str {
        "bearer"
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        _body: &[u8],
        _task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let value = required_header(headers, AUTHORIZATION)?;
        let presented = strip_scheme(value, "Bearer").ok_or(VerifyError::InvalidCredentials)?;
        if constant_time_eq(self.token.as_bytes(), presented.as_bytes()) {
            Ok(())
        } else {
            Err(VerifyError::InvalidCredentials)
        }
    }
}

/// `Authorization: Basic base64(username:password)`.
pub struct BasicVerifier {
    username: String,
    password: String,
}

impl BasicVerifier {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl SignatureVerifier for BasicVerifier {
    fn scheme(&self) -> &str {
        "basic"
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        _body: &[u8],
        _task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let value = required_header(headers, AUTHORIZATION)?;
        let encoded = strip_scheme(value, "Basic").ok_or(VerifyError::InvalidCredentials)?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| VerifyError::InvalidCredentials)?;
        let decoded = String::from_utf8(decoded).map_err(|_| VerifyError::InvalidCredentials)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(VerifyError::InvalidCredentials)?;

        // Compare both halves so timing does not reveal which one differed.
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        if user_ok & pass_ok {
            Ok(())
        } else {
            Err(VerifyError::InvalidCredentials)
        }
    }
}
