//! Task State: the persisted record of one suspended execution.
//!
//! A task is created when an integration starts a long-running external
//! operation and is keyed by a caller-chosen correlation value (an external
//! agent ID, a message timestamp, ...). Its status moves from `Waiting` to
//! exactly one terminal status and never moves again.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a suspended task.
///
/// `Waiting` is the only non-terminal status. Transitions form a DAG with a
/// single source and three sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Issued, no resolution yet.
    Waiting,
    /// A webhook or poll reported a final success or failure.
    Received,
    /// Attempts or the timeout window ran out without a resolution.
    TimedOut,
    /// Polling exhausted its consecutive-error budget.
    Error,
}

impl TaskStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Waiting)
    }

    /// Storage representation (matches the serde name).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Received => "received",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(TaskStatus::Waiting),
            "received" => Ok(TaskStatus::Received),
            "timed_out" => Ok(TaskStatus::TimedOut),
            "error" => Ok(TaskStatus::Error),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

/// Result metadata recorded on the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    /// Provider-side reference (URL, PR link, message permalink, ...).
    #[serde(default)]
    pub external_ref: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, String>,
}

impl TaskResult {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            external_ref: String::new(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            external_ref: String::new(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = external_ref.into();
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

/// Poll bookkeeping for a waiting task.
///
/// `attempt` is 1-based: it names the poll that is currently scheduled.
/// `errors` counts consecutive failed polls and resets on any successful
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCounters {
    pub attempt: u32,
    pub errors: u32,
}

impl PollCounters {
    pub const INITIAL: PollCounters = PollCounters {
        attempt: 1,
        errors: 0,
    };
}

impl Default for PollCounters {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// One suspended execution waiting on an external task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: Uuid,
    /// Name of the integration that issued the task.
    pub provider: String,
    /// Correlation namespace (e.g. `agent_id`).
    pub correlation_key: String,
    /// Externally visible identifier, unique within `correlation_key`.
    pub correlation_value: String,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    /// Per-task shared secret for providers that scope secrets per task.
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<Vec<u8>>,
    pub poll_attempt: u32,
    pub poll_errors: u32,
    /// Most recent non-terminal status reported by the provider.
    pub last_status: Option<String>,
    /// When the next poll or timeout check is due.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a new `Waiting` task with fresh poll counters.
    pub fn new(
        provider: impl Into<String>,
        correlation_key: impl Into<String>,
        correlation_value: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            provider: provider.into(),
            correlation_key: correlation_key.into(),
            correlation_value: correlation_value.into(),
            status: TaskStatus::Waiting,
            result: None,
            webhook_secret: None,
            poll_attempt: PollCounters::INITIAL.attempt,
            poll_errors: PollCounters::INITIAL.errors,
            last_status: None,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn counters(&self) -> PollCounters {
        PollCounters {
            attempt: self.poll_attempt,
            errors: self.poll_errors,
        }
    }
}

/// Payload type tag attached to every completion emission.
pub const COMPLETION_PAYLOAD_TYPE: &str = "tether.completion";

/// Output channel for successful `Received` results.
pub const CHANNEL_SUCCESS: &str = "success";
/// Output channel for failed `Received` results and polling errors.
pub const CHANNEL_FAILURE: &str = "failure";
/// Output channel for timeouts.
pub const CHANNEL_TIMEOUT: &str = "timeout";

/// The payload delivered to the workflow engine on the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub task_id: Uuid,
    pub provider: String,
    pub correlation_key: String,
    pub correlation_value: String,
    pub status: TaskStatus,
    pub result: TaskResult,
}

impl Completion {
    /// Output channel this completion is emitted on.
    pub fn channel(&self) -> &'static str {
        match self.status {
            TaskStatus::Received if self.result.success => CHANNEL_SUCCESS,
            TaskStatus::TimedOut => CHANNEL_TIMEOUT,
            _ => CHANNEL_FAILURE,
        }
    }
}
