//! Timestamped ECDSA P-256 webhook signatures.
//!
//! The provider signs `SHA-256(timestamp || body)` and sends the timestamp
//! and a base64 signature in two headers. Signatures arrive either DER
//! encoded or as raw `r || s`; DER is tried first.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use tether_core::reconcile::verifier::SignatureVerifier;
use tether_types::error::VerifyError;
use tether_types::signal::WebhookHeaders;

use super::required_header;

const SCALAR_LEN: usize = 32;

pub struct EcdsaP256Verifier {
    key: VerifyingKey,
    timestamp_header: String,
    signature_header: String,
}

impl EcdsaP256Verifier {
    /// Parse a PEM public key, or a bare base64 SubjectPublicKeyInfo blob.
    pub fn from_public_key(
        public_key: &str,
        timestamp_header: impl Into<String>,
        signature_header: impl Into<String>,
    ) -> Result<Self, VerifyError> {
        let pem = normalize_pem(public_key);
        let key = VerifyingKey::from_public_key_pem(&pem)
            .map_err(|e| VerifyError::InvalidKey(e.to_string()))?;
        Ok(Self {
            key,
            timestamp_header: timestamp_header.into(),
            signature_header: signature_header.into(),
        })
    }
}

impl SignatureVerifier for EcdsaP256Verifier {
    fn scheme(&self) -> &str {
        "ecdsa_p256"
    }

    fn verify(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        _task_secret: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let timestamp = required_header(headers, &self.timestamp_header)?;
        let encoded = required_header(headers, &self.signature_header)?;

        let raw = STANDARD
            .decode(encoded)
            .map_err(|_| VerifyError::InvalidSignature)?;
        let signature = decode_signature(&raw)?;

        let mut hasher = Sha256::new();
        hasher.update(timestamp.as_bytes());
        hasher.update(body);
        let digest = hasher.finalize();

        self.key
            .verify_prehash(&digest, &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }
}

/// DER first, then an even-length split into `r` and `s`.
fn decode_signature(raw: &[u8]) -> Result<Signature, VerifyError> {
    if let Ok(signature) = Signature::from_der(raw) {
        return Ok(signature);
    }
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(VerifyError::InvalidSignature);
    }

    let (r, s) = raw.split_at(raw.len() / 2);
    let mut fixed = [0u8; SCALAR_LEN * 2];
    left_pad(r, &mut fixed[..SCALAR_LEN])?;
    left_pad(s, &mut fixed[SCALAR_LEN..])?;
    Signature::from_slice(&fixed).map_err(|_| VerifyError::InvalidSignature)
}

/// Copy a big-endian scalar right-aligned into `out`, dropping redundant
/// leading zero bytes.
fn left_pad(scalar: &[u8], out: &mut [u8]) -> Result<(), VerifyError> {
    let start = scalar.iter().position(|b| *b != 0).unwrap_or(scalar.len());
    let significant = &scalar[start..];
    if significant.len() > out.len() {
        return Err(VerifyError::InvalidSignature);
    }
    let offset = out.len() - significant.len();
    out[offset..].copy_from_slice(significant);
    Ok(())
}

/// Wrap a bare base64 blob in PEM armor; PEM input is passed through.
fn normalize_pem(public_key: &str) -> String {
    let trimmed = public_key.trim();
    if trimmed.starts_with("-----BEGIN") {
        return format!("{trimmed}\n");
    }

    let blob: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in blob.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}
