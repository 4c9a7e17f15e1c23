use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tether-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Webhook authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("missing header: {0}")]
    MissingHeader(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("credential verification failed")]
    InvalidCredentials,

    #[error("invalid verification key: {0}")]
    InvalidKey(String),

    #[error("no webhook secret stored for this task")]
    MissingSecret,
}

/// Failures while querying the external system during a poll.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("probe not configured: {0}")]
    NotConfigured(String),
}

/// Failures handing a deferred callback to the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    Closed,

    #[error("scheduler error: {0}")]
    Rejected(String),
}

/// Failures delivering a completion to the workflow engine.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("completion channel closed: {0}")]
    ChannelClosed(String),

    #[error("emit error: {0}")]
    Rejected(String),
}

/// Invalid configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider '{provider}': {message}")]
    Provider { provider: String, message: String },

    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),

    #[error("invalid config file: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn provider(provider: &str, message: impl Into<String>) -> Self {
        ConfigError::Provider {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}
