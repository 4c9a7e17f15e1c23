//! SQLite task repository implementation.
//!
//! Implements `TaskRepository` from `tether-core`. The `(provider,
//! correlation_key, correlation_value)` unique constraint is the Correlation
//! Store; every
//! mutating statement carries `WHERE status = 'waiting'` so that the first
//! terminal write wins and later ones affect zero rows.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tether_core::repository::task::{PollUpdate, TaskRepository};
use tether_types::error::RepositoryError;
use tether_types::task::{PollCounters, TaskResult, TaskState, TaskStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `TaskRepository`.
pub struct SqliteTaskRepository {
    pool: DatabasePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    provider: String,
    correlation_key: String,
    correlation_value: String,
    status: String,
    result: Option<String>,
    webhook_secret: Option<Vec<u8>>,
    poll_attempt: i64,
    poll_errors: i64,
    last_status: Option<String>,
    scheduled_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            correlation_key: row.try_get("correlation_key")?,
            correlation_value: row.try_get("correlation_value")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            webhook_secret: row.try_get("webhook_secret")?,
            poll_attempt: row.try_get("poll_attempt")?,
            poll_errors: row.try_get("poll_errors")?,
            last_status: row.try_get("last_status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<TaskState, RepositoryError> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str::<TaskResult>(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid result JSON: {e}")))
            })
            .transpose()?;

        Ok(TaskState {
            id: parse_uuid(&self.id)?,
            provider: self.provider,
            correlation_key: self.correlation_key,
            correlation_value: self.correlation_value,
            status,
            result,
            webhook_secret: self.webhook_secret,
            poll_attempt: parse_counter(self.poll_attempt, "poll_attempt")?,
            poll_errors: parse_counter(self.poll_errors, "poll_errors")?,
            last_status: self.last_status,
            scheduled_at: self.scheduled_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_counter(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("invalid {column}: {value}")))
}

// ---------------------------------------------------------------------------
// TaskRepository impl
// ---------------------------------------------------------------------------

impl TaskRepository for SqliteTaskRepository {
    async fn store_correlation(&self, task: &TaskState) -> Result<(), RepositoryError> {
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize result: {e}")))?;

        let result = sqlx::query(
            r#"INSERT INTO tasks (id, provider, correlation_key, correlation_value, status, result,
                                  webhook_secret, poll_attempt, poll_errors, last_status,
                                  scheduled_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.provider)
        .bind(&task.correlation_key)
        .bind(&task.correlation_value)
        .bind(task.status.as_str())
        .bind(&result_json)
        .bind(&task.webhook_secret)
        .bind(i64::from(task.poll_attempt))
        .bind(i64::from(task.poll_errors))
        .bind(&task.last_status)
        .bind(task.scheduled_at.as_ref().map(format_datetime))
        .bind(format_datetime(&task.created_at))
        .bind(format_datetime(&task.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::Conflict(format!(
                    "{} '{}' is already correlated for provider '{}'",
                    task.correlation_key, task.correlation_value, task.provider
                )))
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn find_by_correlation(
        &self,
        provider: &str,
        correlation_key: &str,
        correlation_value: &str,
    ) -> Result<Option<TaskState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE provider = ? AND correlation_key = ? AND correlation_value = ?",
        )
        .bind(provider)
        .bind(correlation_key)
        .bind(correlation_value)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            TaskRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_task()
        })
        .transpose()
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<TaskState>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            TaskRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_task()
        })
        .transpose()
    }

    async fn record_status(&self, id: &Uuid, last_status: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tasks SET last_status = ?, updated_at = ? WHERE id = ? AND status = 'waiting'",
        )
        .bind(last_status)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_poll(
        &self,
        id: &Uuid,
        expected: PollCounters,
        update: &PollUpdate,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET poll_attempt = ?, poll_errors = ?,
                   last_status = COALESCE(?, last_status),
                   scheduled_at = ?, updated_at = ?
               WHERE id = ? AND status = 'waiting'
                 AND poll_attempt = ? AND poll_errors = ?"#,
        )
        .bind(i64::from(update.counters.attempt))
        .bind(i64::from(update.counters.errors))
        .bind(&update.last_status)
        .bind(update.scheduled_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(i64::from(expected.attempt))
        .bind(i64::from(expected.errors))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve(
        &self,
        id: &Uuid,
        status: TaskStatus,
        result: &TaskResult,
        counters: Option<PollCounters>,
    ) -> Result<bool, RepositoryError> {
        if !status.is_terminal() {
            return Err(RepositoryError::Query(format!(
                "cannot resolve to non-terminal status '{status}'"
            )));
        }
        let result_json = serde_json::to_string(result)
            .map_err(|e| RepositoryError::Query(format!("serialize result: {e}")))?;

        let outcome = sqlx::query(
            r#"UPDATE tasks
               SET status = ?, result = ?,
                   poll_attempt = COALESCE(?, poll_attempt),
                   poll_errors = COALESCE(?, poll_errors),
                   scheduled_at = NULL, updated_at = ?
               WHERE id = ? AND status = 'waiting'"#,
        )
        .bind(status.as_str())
        .bind(&result_json)
        .bind(counters.map(|c| i64::from(c.attempt)))
        .bind(counters.map(|c| i64::from(c.errors)))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn list_waiting(&self) -> Result<Vec<TaskState>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = 'waiting' ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                TaskRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_task()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
