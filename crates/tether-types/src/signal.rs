//! Resolution signals and their outcomes.
//!
//! Two unordered sources race to resolve a waiting task: an inbound webhook
//! and a self-scheduled poll. Both are reduced to the same `ExternalStatus`
//! snapshot before reaching the reconciler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::task::TaskStatus;

/// Provider-reported state of the external task, already translated out of
/// the provider's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalStatus {
    /// Raw provider status string (e.g. `RUNNING`, `FINISHED`, `approved`).
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, String>,
}

impl ExternalStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }
}

/// A verified webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSignal {
    pub snapshot: ExternalStatus,
}

/// The result of one scheduled poll.
///
/// `attempt` and `errors` echo the callback parameters the poll was
/// scheduled with, so a stale or duplicated callback can be recognized.
#[derive(Debug, Clone)]
pub struct PollSignal {
    pub attempt: u32,
    pub errors: u32,
    pub observation: Result<ExternalStatus, ProbeError>,
}

/// Input to the reconciler's transition function.
#[derive(Debug, Clone)]
pub enum Signal {
    Webhook(WebhookSignal),
    Poll(PollSignal),
}

impl Signal {
    pub fn source(&self) -> &'static str {
        match self {
            Signal::Webhook(_) => "webhook",
            Signal::Poll(_) => "poll",
        }
    }
}

/// Why a signal was acknowledged without any effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No task is stored under the correlation value.
    NotFound,
    /// The task already reached a terminal status.
    AlreadyTerminal,
    /// A poll callback whose counters no longer match the stored task.
    Superseded,
}

/// What handling one signal did. Every variant is a success from the
/// caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The task transitioned to a terminal status and the completion was emitted.
    Resolved {
        status: TaskStatus,
        success: bool,
        channel: String,
    },
    /// A non-terminal status was recorded; the task keeps waiting.
    Pending { last_status: String },
    /// The next poll was scheduled.
    Rescheduled {
        attempt: u32,
        errors: u32,
        delay_ms: u64,
    },
    /// The webhook event did not match the provider's event filter.
    Filtered,
    /// Benign no-op.
    Ignored { reason: IgnoreReason },
}

impl SignalOutcome {
    pub fn ignored(reason: IgnoreReason) -> Self {
        SignalOutcome::Ignored { reason }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, SignalOutcome::Resolved { .. })
    }
}

/// Name of the deferred poll action.
pub const POLL_ACTION: &str = "poll";
/// Name of the deferred timeout-check action.
pub const CHECK_TIMEOUT_ACTION: &str = "check_timeout";

/// Parameters carried by a deferred callback, serialized into the opaque
/// parameter map handed to the host scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackParams {
    pub provider: String,
    pub correlation_key: String,
    pub correlation_value: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub errors: u32,
}

impl CallbackParams {
    pub fn into_map(self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self, String> {
        serde_json::from_value(serde_json::Value::Object(map.clone()))
            .map_err(|e| format!("invalid callback parameters: {e}"))
    }
}

/// Case-insensitive view over inbound webhook headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders(BTreeMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Header value with surrounding whitespace removed; empty counts as absent.
    pub fn get_trimmed(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|v| !v.is_empty())
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = WebhookHeaders::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}
