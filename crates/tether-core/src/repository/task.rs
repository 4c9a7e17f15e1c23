//! Task repository trait definition.
//!
//! Combines the Correlation Store (correlation key/value -> suspended task)
//! with Task State persistence. Every write that can race with another
//! signal is a conditional update keyed on `status = waiting`, so a webhook
//! and a poll resolving the same task cannot both win.

use chrono::{DateTime, Utc};
use tether_types::error::RepositoryError;
use tether_types::task::{PollCounters, TaskResult, TaskState, TaskStatus};
use uuid::Uuid;

/// New poll bookkeeping written after a non-terminal poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollUpdate {
    pub counters: PollCounters,
    /// Provider status from a successful poll; `None` leaves the stored value.
    pub last_status: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Repository trait for Task State persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskRepository: Send + Sync {
    /// Insert a new task and its correlation entry.
    ///
    /// Fails with `RepositoryError::Conflict` when the correlation value is
    /// already taken within the task's provider and correlation key.
    fn store_correlation(
        &self,
        task: &TaskState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Find the task a provider stored under a correlation key/value pair.
    fn find_by_correlation(
        &self,
        provider: &str,
        correlation_key: &str,
        correlation_value: &str,
    ) -> impl std::future::Future<Output = Result<Option<TaskState>, RepositoryError>> + Send;

    /// Get a task by its internal ID.
    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TaskState>, RepositoryError>> + Send;

    /// Record a non-terminal provider status.
    ///
    /// Returns `false` if the task is no longer waiting.
    fn record_status(
        &self,
        id: &Uuid,
        last_status: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Compare-and-swap the poll counters.
    ///
    /// Applies `update` only if the task is waiting and its stored counters
    /// equal `expected`. Returns whether the write happened.
    fn record_poll(
        &self,
        id: &Uuid,
        expected: PollCounters,
        update: &PollUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move a waiting task to a terminal status.
    ///
    /// Returns `true` only for the single caller whose write moved the task
    /// out of `Waiting`; every later call returns `false`. `counters`, when
    /// given, replaces the stored poll counters in the same write.
    fn resolve(
        &self,
        id: &Uuid,
        status: TaskStatus,
        result: &TaskResult,
        counters: Option<PollCounters>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List tasks still waiting (restart recovery), oldest first.
    fn list_waiting(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<TaskState>, RepositoryError>> + Send;
}
