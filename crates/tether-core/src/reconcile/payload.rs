//! Webhook body extraction via JSON pointers.
//!
//! Pulls the correlation value and status snapshot out of a provider's
//! webhook body, and applies the optional event filter.

use serde_json::Value;
use tether_types::config::PayloadConfig;
use tether_types::signal::ExternalStatus;

/// A decoded webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The event passed the filter and names a task.
    Matched {
        correlation_value: String,
        snapshot: ExternalStatus,
    },
    /// The event type is not one the provider accepts.
    Filtered { event: Option<String> },
}

/// Reasons a webhook body cannot be decoded.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field at {0}")]
    MissingField(String),
}

/// Read a scalar at `pointer` as a string. Numbers and booleans are
/// rendered; objects, arrays and null count as absent.
pub fn pointer_string(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extracts deliveries according to a provider's `PayloadConfig`.
#[derive(Debug, Clone)]
pub struct PayloadExtractor {
    config: PayloadConfig,
}

impl PayloadExtractor {
    pub fn new(config: PayloadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Decode a raw webhook body.
    pub fn extract(&self, body: &[u8]) -> Result<Delivery, PayloadError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

        if let Some(event_pointer) = &self.config.event {
            let event = pointer_string(&value, event_pointer);
            let accepted = event
                .as_deref()
                .is_some_and(|e| self.config.accepted_events.iter().any(|a| a == e));
            if !accepted {
                return Ok(Delivery::Filtered { event });
            }
        }

        let correlation_value = pointer_string(&value, &self.config.id)
            .ok_or_else(|| PayloadError::MissingField(self.config.id.clone()))?;
        let status = pointer_string(&value, &self.config.status)
            .ok_or_else(|| PayloadError::MissingField(self.config.status.clone()))?;

        let mut snapshot = ExternalStatus::new(status);
        snapshot.summary = self
            .config
            .summary
            .as_deref()
            .and_then(|p| pointer_string(&value, p));
        snapshot.external_ref = self
            .config
            .external_ref
            .as_deref()
            .and_then(|p| pointer_string(&value, p));

        Ok(Delivery::Matched {
            correlation_value,
            snapshot,
        })
    }
}
