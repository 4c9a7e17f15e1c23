//! Poll scheduling with capped exponential backoff.
//!
//! The scheduler is a pure scheduling primitive: it turns `(attempt, errors)`
//! into a delay and hands one deferred callback to the host. Attempt and
//! error ceilings are enforced by the reconciler, not here.

use std::time::Duration;

use tether_types::config::PollingConfig;
use tether_types::error::SchedulerError;
use tether_types::signal::{CHECK_TIMEOUT_ACTION, CallbackParams, POLL_ACTION};

// ---------------------------------------------------------------------------
// CallbackScheduler port
// ---------------------------------------------------------------------------

/// Host capability for one-shot deferred callbacks.
///
/// The host invokes the named action with exactly `params` after `delay`.
pub trait CallbackScheduler: Send + Sync {
    fn schedule_callback(
        &self,
        name: &str,
        params: serde_json::Map<String, serde_json::Value>,
        delay: Duration,
    ) -> impl std::future::Future<Output = Result<(), SchedulerError>> + Send;
}

// ---------------------------------------------------------------------------
// PollBackoff
// ---------------------------------------------------------------------------

/// Capped exponential backoff: `min(initial * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    initial: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(config.initial_interval(), config.max_interval())
    }

    /// Delay before poll `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|multiplier| self.initial.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// The first `attempts` delays, in order.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (1..=attempts).map(|attempt| self.delay(attempt)).collect()
    }
}

// ---------------------------------------------------------------------------
// PollScheduler
// ---------------------------------------------------------------------------

/// Schedules poll and timeout-check callbacks through a `CallbackScheduler`.
pub struct PollScheduler<S: CallbackScheduler> {
    scheduler: S,
}

impl<S: CallbackScheduler> PollScheduler<S> {
    pub fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    pub fn inner(&self) -> &S {
        &self.scheduler
    }

    /// Schedule the poll named by `params.attempt`, returning its delay.
    pub async fn schedule_next(
        &self,
        backoff: &PollBackoff,
        params: CallbackParams,
    ) -> Result<Duration, SchedulerError> {
        let delay = backoff.delay(params.attempt);
        self.schedule_poll_in(params, delay).await?;
        Ok(delay)
    }

    /// Schedule a poll after an explicit delay (restart recovery).
    pub async fn schedule_poll_in(
        &self,
        params: CallbackParams,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        tracing::debug!(
            correlation_value = %params.correlation_value,
            attempt = params.attempt,
            errors = params.errors,
            delay_ms = delay.as_millis() as u64,
            "scheduling poll"
        );
        self.scheduler
            .schedule_callback(POLL_ACTION, params.into_map(), delay)
            .await
    }

    /// Schedule the single timeout check for a webhook-only task.
    pub async fn schedule_timeout_check(
        &self,
        params: CallbackParams,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        tracing::debug!(
            correlation_value = %params.correlation_value,
            delay_ms = delay.as_millis() as u64,
            "scheduling timeout check"
        );
        self.scheduler
            .schedule_callback(CHECK_TIMEOUT_ACTION, params.into_map(), delay)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
