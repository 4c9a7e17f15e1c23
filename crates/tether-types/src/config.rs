//! Configuration types for Tether.
//!
//! `TetherConfig` represents the top-level `tether.toml`: server binding,
//! logging, database location, and one `[[providers]]` entry per
//! integration whose external tasks are reconciled.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the Tether service.
///
/// Loaded from `~/.tether/tether.toml`. All sections have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl TetherConfig {
    /// Validate every provider and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            provider.validate()?;
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}

/// Task State storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; defaults to `sqlite://{data_dir}/tether.db?mode=rwc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One integration whose external tasks are reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Route name: webhooks arrive at `/api/v1/webhooks/{name}`.
    pub name: String,

    /// Correlation namespace for this provider's tasks (e.g. `agent_id`).
    pub correlation_key: String,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Webhook authentication. Required: "no verification" must be chosen
    /// explicitly with `scheme = "none"`.
    pub verification: VerificationConfig,

    #[serde(default)]
    pub payload: PayloadConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    /// Webhook-only timeout window, checked once after issuance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeConfig>,
}

impl ProviderConfig {
    /// Reject configurations that would silently weaken verification or
    /// leave polling without a probe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(ConfigError::provider(name, "name must not be empty"));
        }
        if self.correlation_key.trim().is_empty() {
            return Err(ConfigError::provider(name, "correlation_key must not be empty"));
        }

        self.verification.validate(name)?;
        self.polling.validate(name)?;

        if self.polling.enabled && self.probe.is_none() {
            return Err(ConfigError::provider(
                name,
                "polling is enabled but no [probe] is configured",
            ));
        }
        if let Some(probe) = &self.probe {
            if probe.status_url.trim().is_empty() {
                return Err(ConfigError::provider(name, "probe.status_url must not be empty"));
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::provider(name, "timeout_secs must be > 0"));
        }
        if let ClassifierConfig::Custom {
            success, failure, ..
        } = &self.classifier
        {
            if success.is_empty() && failure.is_empty() {
                return Err(ConfigError::provider(
                    name,
                    "custom classifier needs at least one success or failure status",
                ));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Which status vocabulary maps provider statuses onto outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierConfig {
    /// Cloud coding-agent statuses (`FINISHED`, `ERROR`, `EXPIRED`, ...).
    #[default]
    CloudAgent,
    /// Interactive approval decisions (`approved`, `rejected`, ...).
    Approval,
    /// Explicit vocabulary, compared case-insensitively.
    Custom {
        #[serde(default)]
        success: Vec<String>,
        #[serde(default)]
        failure: Vec<String>,
        #[serde(default)]
        cancelled: Vec<String>,
    },
}

/// Webhook verification scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum VerificationConfig {
    /// Deliberately unauthenticated.
    None,
    /// `hex(HMAC-SHA256(secret, body))` in a header, no prefix.
    HmacSha256 {
        #[serde(default = "default_signature_header")]
        header: String,
        secret: String,
    },
    /// Same as `HmacSha256` with a `sha256=` prefix on the header value.
    PrefixedHmacSha256 {
        #[serde(default = "default_prefixed_header")]
        header: String,
        secret: String,
    },
    /// HMAC-SHA256 keyed by the secret stored on each task.
    PerTaskHmacSha256 {
        #[serde(default = "default_signature_header")]
        header: String,
        #[serde(default)]
        prefixed: bool,
    },
    /// ECDSA P-256 over `SHA-256(timestamp || body)`.
    EcdsaP256 {
        /// PEM public key, or a bare base64 SubjectPublicKeyInfo blob.
        public_key: String,
        #[serde(default = "default_timestamp_header")]
        timestamp_header: String,
        #[serde(default = "default_signature_header")]
        signature_header: String,
    },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// `Authorization: Basic base64(username:password)`.
    Basic { username: String, password: String },
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_prefixed_header() -> String {
    "x-hub-signature-256".to_string()
}

fn default_timestamp_header() -> String {
    "x-timestamp".to_string()
}

impl VerificationConfig {
    /// Short scheme name for logs.
    pub fn scheme(&self) -> &'static str {
        match self {
            VerificationConfig::None => "none",
            VerificationConfig::HmacSha256 { .. } => "hmac_sha256",
            VerificationConfig::PrefixedHmacSha256 { .. } => "prefixed_hmac_sha256",
            VerificationConfig::PerTaskHmacSha256 { .. } => "per_task_hmac_sha256",
            VerificationConfig::EcdsaP256 { .. } => "ecdsa_p256",
            VerificationConfig::Bearer { .. } => "bearer",
            VerificationConfig::Basic { .. } => "basic",
        }
    }

    fn validate(&self, provider: &str) -> Result<(), ConfigError> {
        let empty = |field: &str| {
            Err(ConfigError::provider(
                provider,
                format!("{} requires a non-empty {field}", self.scheme()),
            ))
        };
        match self {
            VerificationConfig::None => Ok(()),
            VerificationConfig::HmacSha256 { header, secret }
            | VerificationConfig::PrefixedHmacSha256 { header, secret } => {
                if header.trim().is_empty() {
                    empty("header")
                } else if secret.is_empty() {
                    empty("secret")
                } else {
                    Ok(())
                }
            }
            VerificationConfig::PerTaskHmacSha256 { header, .. } => {
                if header.trim().is_empty() {
                    empty("header")
                } else {
                    Ok(())
                }
            }
            VerificationConfig::EcdsaP256 {
                public_key,
                timestamp_header,
                signature_header,
            } => {
                if public_key.trim().is_empty() {
                    empty("public_key")
                } else if timestamp_header.trim().is_empty() || signature_header.trim().is_empty() {
                    empty("header")
                } else {
                    Ok(())
                }
            }
            VerificationConfig::Bearer { token } => {
                if token.is_empty() {
                    empty("token")
                } else {
                    Ok(())
                }
            }
            VerificationConfig::Basic { username, password } => {
                if username.is_empty() || password.is_empty() {
                    empty("username and password")
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// JSON pointers locating fields in a provider's webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_id_pointer")]
    pub id: String,
    #[serde(default = "default_status_pointer")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Event-type pointer; when set, only `accepted_events` are processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_events: Vec<String>,
}

fn default_id_pointer() -> String {
    "/id".to_string()
}

fn default_status_pointer() -> String {
    "/status".to_string()
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            id: default_id_pointer(),
            status: default_status_pointer(),
            summary: None,
            external_ref: None,
            event: None,
            accepted_events: Vec::new(),
        }
    }
}

/// Polling and backoff ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_interval_secs")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_initial_interval_secs() -> u64 {
    30
}

fn default_max_interval_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    20
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_interval_secs: default_initial_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            max_attempts: default_max_attempts(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl PollingConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    fn validate(&self, provider: &str) -> Result<(), ConfigError> {
        if self.initial_interval_secs == 0 {
            return Err(ConfigError::provider(provider, "polling.initial_interval_secs must be > 0"));
        }
        if self.max_interval_secs < self.initial_interval_secs {
            return Err(ConfigError::provider(
                provider,
                "polling.max_interval_secs must be >= initial_interval_secs",
            ));
        }
        if self.max_attempts == 0 || self.max_consecutive_errors == 0 {
            return Err(ConfigError::provider(
                provider,
                "polling.max_attempts and max_consecutive_errors must be > 0",
            ));
        }
        Ok(())
    }
}

/// HTTP status probe used by the poll path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Status endpoint; `{id}` is replaced with the correlation value.
    pub status_url: String,
    /// Abort endpoint (POST); `{id}` is replaced with the correlation value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
    #[serde(default = "default_status_pointer")]
    pub status_pointer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref_pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_probe_timeout_secs() -> u64 {
    30
}
