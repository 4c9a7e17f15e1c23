//! The reconciliation state machine.
//!
//! `Reconciler` is the single transition authority for suspended tasks. It
//! consumes verified webhook deliveries and poll results, applies the same
//! transition function to both, and emits exactly one completion per task.
//!
//! Races are settled by the repository: every state write is conditional on
//! the task still waiting (and, for poll bookkeeping, on the counters it was
//! read with), so the losing signal observes a failed write and becomes a
//! benign no-op.

use std::time::Duration;

use chrono::Utc;
use tether_types::error::{EmitError, RepositoryError, SchedulerError, VerifyError};
use tether_types::signal::{
    CHECK_TIMEOUT_ACTION, CallbackParams, ExternalStatus, IgnoreReason, POLL_ACTION, PollSignal,
    Signal, SignalOutcome, WebhookHeaders, WebhookSignal,
};
use tether_types::task::{
    COMPLETION_PAYLOAD_TYPE, Completion, PollCounters, TaskResult, TaskState, TaskStatus,
};

use crate::repository::task::{PollUpdate, TaskRepository};

use super::classifier::Classification;
use super::emitter::CompletionEmitter;
use super::payload::Delivery;
use super::probe::PollProbe;
use super::provider::{Provider, ProviderRegistry};
use super::scheduler::{CallbackScheduler, PollScheduler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to the webhook and action entry points.
///
/// "Not found" and "already terminal" are deliberately absent: they are
/// `SignalOutcome::Ignored`, not errors.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("webhook authentication failed: {0}")]
    Unauthorized(#[from] VerifyError),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("scheduling error: {0}")]
    Scheduling(#[from] SchedulerError),

    #[error("emission error: {0}")]
    Emission(#[from] EmitError),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ReconcileError {
    /// HTTP status the webhook/action entry points answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ReconcileError::Unauthorized(_) => 401,
            ReconcileError::MalformedPayload(_) | ReconcileError::InvalidParameters(_) => 400,
            ReconcileError::UnknownProvider(_) => 404,
            ReconcileError::Persistence(RepositoryError::Conflict(_)) => 409,
            ReconcileError::Persistence(_)
            | ReconcileError::Scheduling(_)
            | ReconcileError::Emission(_) => 500,
        }
    }
}

/// Input for issuing a new task.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub provider: String,
    pub correlation_value: String,
    pub webhook_secret: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Unifies webhook and poll signals into one transition authority.
pub struct Reconciler<R, S, E, P>
where
    R: TaskRepository,
    S: CallbackScheduler,
    E: CompletionEmitter,
    P: PollProbe,
{
    repo: R,
    scheduler: PollScheduler<S>,
    emitter: E,
    providers: ProviderRegistry<P>,
}

impl<R, S, E, P> Reconciler<R, S, E, P>
where
    R: TaskRepository,
    S: CallbackScheduler,
    E: CompletionEmitter,
    P: PollProbe,
{
    pub fn new(repo: R, scheduler: S, emitter: E, providers: ProviderRegistry<P>) -> Self {
        Self {
            repo,
            scheduler: PollScheduler::new(scheduler),
            emitter,
            providers,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn scheduler(&self) -> &S {
        self.scheduler.inner()
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    pub fn providers(&self) -> &ProviderRegistry<P> {
        &self.providers
    }

    fn provider(&self, name: &str) -> Result<std::sync::Arc<Provider<P>>, ReconcileError> {
        self.providers
            .get(name)
            .ok_or_else(|| ReconcileError::UnknownProvider(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Issue
    // -----------------------------------------------------------------------

    /// Create a waiting task, store its correlation and arm the first poll
    /// or the single timeout check.
    pub async fn issue(&self, request: IssueRequest) -> Result<TaskState, ReconcileError> {
        let provider = self.provider(&request.provider)?;

        if request.correlation_value.trim().is_empty() {
            return Err(ReconcileError::InvalidParameters(
                "correlation_value must not be empty".to_string(),
            ));
        }
        if provider.verifier.needs_task_secret()
            && request.webhook_secret.as_ref().is_none_or(|s| s.is_empty())
        {
            return Err(ReconcileError::InvalidParameters(format!(
                "provider '{}' requires a per-task webhook secret",
                provider.name
            )));
        }

        let mut task = TaskState::new(
            &provider.name,
            &provider.correlation_key,
            &request.correlation_value,
        );
        task.webhook_secret = request.webhook_secret;

        let first_delay = if provider.polls() {
            Some(provider.backoff.delay(PollCounters::INITIAL.attempt))
        } else {
            provider.timeout
        };
        task.scheduled_at = first_delay.map(due_at);

        self.repo.store_correlation(&task).await?;
        tracing::debug!(task_id = %task.id, "checkpoint: correlation stored");

        let params = callback_params(&provider, &task.correlation_value, task.counters());
        if provider.polls() {
            self.scheduler
                .schedule_next(&provider.backoff, params)
                .await?;
        } else if let Some(timeout) = provider.timeout {
            self.scheduler.schedule_timeout_check(params, timeout).await?;
        }

        tracing::info!(
            task_id = %task.id,
            provider = %provider.name,
            correlation_key = %task.correlation_key,
            correlation_value = %task.correlation_value,
            polling = provider.polls(),
            "task issued"
        );
        Ok(task)
    }

    /// Look up a task by provider and correlation value.
    pub async fn find_task(
        &self,
        provider_name: &str,
        correlation_value: &str,
    ) -> Result<Option<TaskState>, ReconcileError> {
        let provider = self.provider(provider_name)?;
        self.lookup(&provider, correlation_value).await
    }

    /// Correlation lookup scoped to one provider. A task stored under another
    /// provider is never visible through this one's routes.
    async fn lookup(
        &self,
        provider: &Provider<P>,
        correlation_value: &str,
    ) -> Result<Option<TaskState>, ReconcileError> {
        let task = self
            .repo
            .find_by_correlation(&provider.name, &provider.correlation_key, correlation_value)
            .await?;
        Ok(task.filter(|t| t.provider == provider.name))
    }

    /// Lookup for a deferred callback, which names its provider and key.
    async fn lookup_callback(
        &self,
        provider: &Provider<P>,
        params: &CallbackParams,
    ) -> Result<Option<TaskState>, ReconcileError> {
        if params.correlation_key != provider.correlation_key {
            tracing::debug!(
                provider = %provider.name,
                correlation_key = %params.correlation_key,
                "callback correlation key does not match provider"
            );
            return Ok(None);
        }
        self.lookup(provider, &params.correlation_value).await
    }

    // -----------------------------------------------------------------------
    // Webhook entry point
    // -----------------------------------------------------------------------

    /// Authenticate, decode and apply one webhook delivery.
    pub async fn handle_webhook(
        &self,
        provider_name: &str,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<SignalOutcome, ReconcileError> {
        let provider = self.provider(provider_name)?;
        let per_task = provider.verifier.needs_task_secret();

        if !per_task {
            provider
                .verifier
                .verify(headers, body, None)
                .inspect_err(|e| {
                    tracing::warn!(
                        provider = %provider.name,
                        scheme = provider.verifier.scheme(),
                        error = %e,
                        "webhook rejected"
                    );
                })?;
        }

        let delivery = provider.extractor.extract(body).map_err(|e| {
            tracing::warn!(provider = %provider.name, error = %e, "malformed webhook body");
            ReconcileError::MalformedPayload(e.to_string())
        })?;

        let (correlation_value, snapshot) = match delivery {
            Delivery::Matched {
                correlation_value,
                snapshot,
            } => (correlation_value, snapshot),
            Delivery::Filtered { event } => {
                tracing::info!(
                    provider = %provider.name,
                    event = event.as_deref().unwrap_or("<none>"),
                    "webhook event filtered"
                );
                return Ok(SignalOutcome::Filtered);
            }
        };

        let Some(task) = self.lookup(&provider, &correlation_value).await? else {
            tracing::debug!(
                provider = %provider.name,
                correlation_value = %correlation_value,
                "webhook for unknown task acknowledged"
            );
            return Ok(SignalOutcome::ignored(IgnoreReason::NotFound));
        };

        if per_task {
            provider
                .verifier
                .verify(headers, body, task.webhook_secret.as_deref())
                .inspect_err(|e| {
                    tracing::warn!(
                        provider = %provider.name,
                        task_id = %task.id,
                        error = %e,
                        "webhook rejected"
                    );
                })?;
        }

        self.apply(&provider, task, Signal::Webhook(WebhookSignal { snapshot }))
            .await
    }

    /// Apply an already-verified signal to the task stored under
    /// `correlation_value`.
    pub async fn handle_signal(
        &self,
        provider_name: &str,
        correlation_value: &str,
        signal: Signal,
    ) -> Result<SignalOutcome, ReconcileError> {
        let provider = self.provider(provider_name)?;
        match self.lookup(&provider, correlation_value).await? {
            Some(task) => self.apply(&provider, task, signal).await,
            None => Ok(SignalOutcome::ignored(IgnoreReason::NotFound)),
        }
    }

    // -----------------------------------------------------------------------
    // Action entry point
    // -----------------------------------------------------------------------

    /// Dispatch a deferred callback by action name with the exact parameters
    /// it was scheduled with.
    pub async fn handle_action(
        &self,
        name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<SignalOutcome, ReconcileError> {
        let params = CallbackParams::from_map(params).map_err(ReconcileError::InvalidParameters)?;
        match name {
            POLL_ACTION => self.poll(params).await,
            CHECK_TIMEOUT_ACTION => self.check_timeout(params).await,
            other => Err(ReconcileError::InvalidParameters(format!(
                "unknown action '{other}'"
            ))),
        }
    }

    /// Run one scheduled poll.
    pub async fn poll(&self, params: CallbackParams) -> Result<SignalOutcome, ReconcileError> {
        let provider = self.provider(&params.provider)?;
        let Some(task) = self.lookup_callback(&provider, &params).await? else {
            return Ok(SignalOutcome::ignored(IgnoreReason::NotFound));
        };

        // Cheap checks before touching the provider.
        if task.is_terminal() {
            return Ok(SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        }
        let scheduled = PollCounters {
            attempt: params.attempt,
            errors: params.errors,
        };
        if scheduled != task.counters() {
            tracing::debug!(
                task_id = %task.id,
                attempt = params.attempt,
                errors = params.errors,
                "stale poll callback"
            );
            return Ok(SignalOutcome::ignored(IgnoreReason::Superseded));
        }

        let observation = match &provider.probe {
            Some(probe) => probe.probe(&task.correlation_value).await,
            None => Err(tether_types::error::ProbeError::NotConfigured(
                provider.name.clone(),
            )),
        };

        let signal = Signal::Poll(PollSignal {
            attempt: params.attempt,
            errors: params.errors,
            observation,
        });
        let outcome = self.apply(&provider, task, signal).await;
        if let Err(ReconcileError::Persistence(e)) = &outcome {
            self.rearm_poll(&provider, params, e).await;
        }
        outcome
    }

    /// A failed write leaves the stored counters untouched, so the same
    /// callback is still current and retrying it is the next poll.
    async fn rearm_poll(
        &self,
        provider: &Provider<P>,
        params: CallbackParams,
        cause: &RepositoryError,
    ) {
        let delay = provider.backoff.delay(params.attempt);
        tracing::warn!(
            correlation_value = %params.correlation_value,
            attempt = params.attempt,
            errors = params.errors,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "persistence failed, poll re-armed"
        );
        if let Err(e) = self.scheduler.schedule_poll_in(params, delay).await {
            tracing::error!(error = %e, "failed to re-arm poll");
        }
    }

    /// Time out a webhook-only task that is still waiting once its deadline
    /// has passed. Early, duplicate or misdirected checks are superseded.
    pub async fn check_timeout(
        &self,
        params: CallbackParams,
    ) -> Result<SignalOutcome, ReconcileError> {
        let provider = self.provider(&params.provider)?;
        let Some(task) = self.lookup_callback(&provider, &params).await? else {
            return Ok(SignalOutcome::ignored(IgnoreReason::NotFound));
        };
        if task.is_terminal() {
            return Ok(SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        }

        let Some(timeout) = provider.timeout.filter(|_| !provider.polls()) else {
            tracing::debug!(
                task_id = %task.id,
                provider = %provider.name,
                "timeout check for a provider without a webhook deadline"
            );
            return Ok(SignalOutcome::ignored(IgnoreReason::Superseded));
        };
        if task.scheduled_at.is_some_and(|due| Utc::now() < due) {
            tracing::debug!(task_id = %task.id, "timeout check before deadline");
            return Ok(SignalOutcome::ignored(IgnoreReason::Superseded));
        }

        let result = TaskResult::failure(format!("no resolution within {}s", timeout.as_secs()))
            .with_attachment("classification", "timeout");
        self.resolve(&provider, &task, TaskStatus::TimedOut, result, None)
            .await
    }

    // -----------------------------------------------------------------------
    // Cancel / recovery
    // -----------------------------------------------------------------------

    /// Best-effort request to abort the external task.
    ///
    /// Never transitions the task: a later webhook or poll reporting the
    /// abort resolves it through the normal path. Returns whether the abort
    /// request reached the provider.
    pub async fn cancel(
        &self,
        provider_name: &str,
        correlation_value: &str,
    ) -> Result<bool, ReconcileError> {
        let provider = self.provider(provider_name)?;
        let Some(task) = self.lookup(&provider, correlation_value).await? else {
            return Ok(false);
        };
        if task.is_terminal() {
            return Ok(false);
        }
        let Some(probe) = &provider.probe else {
            tracing::debug!(provider = %provider.name, "no probe configured, cancel is a no-op");
            return Ok(false);
        };

        match probe.abort(correlation_value).await {
            Ok(()) => {
                tracing::info!(
                    task_id = %task.id,
                    correlation_value = %correlation_value,
                    "abort requested"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    correlation_value = %correlation_value,
                    error = %e,
                    "abort request failed"
                );
                Ok(false)
            }
        }
    }

    /// Re-arm callbacks for every task still waiting, e.g. after a restart.
    /// Returns how many tasks were re-armed.
    pub async fn resume_waiting(&self) -> Result<usize, ReconcileError> {
        let waiting = self.repo.list_waiting().await?;
        let now = Utc::now();
        let mut resumed = 0;

        for task in waiting {
            let Some(provider) = self.providers.get(&task.provider) else {
                tracing::warn!(
                    task_id = %task.id,
                    provider = %task.provider,
                    "waiting task for unconfigured provider skipped"
                );
                continue;
            };
            let delay = task
                .scheduled_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            let params = callback_params(&provider, &task.correlation_value, task.counters());

            if provider.polls() {
                self.scheduler.schedule_poll_in(params, delay).await?;
            } else if provider.timeout.is_some() {
                self.scheduler.schedule_timeout_check(params, delay).await?;
            } else {
                continue;
            }
            resumed += 1;
        }

        tracing::info!(resumed, "resumed waiting tasks");
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Transition function
    // -----------------------------------------------------------------------

    async fn apply(
        &self,
        provider: &Provider<P>,
        task: TaskState,
        signal: Signal,
    ) -> Result<SignalOutcome, ReconcileError> {
        if task.is_terminal() {
            tracing::debug!(
                task_id = %task.id,
                source = signal.source(),
                status = %task.status,
                "signal for terminal task dropped"
            );
            return Ok(SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        }

        match signal {
            Signal::Webhook(WebhookSignal { snapshot }) => {
                self.apply_status(provider, &task, snapshot).await
            }
            Signal::Poll(poll) => self.apply_poll(provider, &task, poll).await,
        }
    }

    async fn apply_status(
        &self,
        provider: &Provider<P>,
        task: &TaskState,
        snapshot: ExternalStatus,
    ) -> Result<SignalOutcome, ReconcileError> {
        let classification = provider.classifier.classify(&snapshot.status);
        if let Some((status, result)) = terminal_result(provider, classification, &snapshot) {
            return self.resolve(provider, task, status, result, None).await;
        }

        if !self.repo.record_status(&task.id, &snapshot.status).await? {
            return Ok(SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        }
        tracing::info!(
            task_id = %task.id,
            status = %snapshot.status,
            "intermediate status recorded"
        );
        Ok(SignalOutcome::Pending {
            last_status: snapshot.status,
        })
    }

    async fn apply_poll(
        &self,
        provider: &Provider<P>,
        task: &TaskState,
        poll: PollSignal,
    ) -> Result<SignalOutcome, ReconcileError> {
        let scheduled = PollCounters {
            attempt: poll.attempt,
            errors: poll.errors,
        };
        if scheduled != task.counters() {
            return Ok(SignalOutcome::ignored(IgnoreReason::Superseded));
        }

        // Every completed poll consumes an attempt; only failures count
        // towards the consecutive-error budget.
        let next_attempt = poll.attempt.saturating_add(1);

        match poll.observation {
            Err(e) => {
                let errors = poll.errors.saturating_add(1);
                tracing::warn!(
                    task_id = %task.id,
                    attempt = poll.attempt,
                    errors,
                    error = %e,
                    "poll failed"
                );
                if errors >= provider.polling.max_consecutive_errors {
                    let result = TaskResult::failure(format!(
                        "polling failed {errors} consecutive times: {e}"
                    ))
                    .with_attachment("classification", "error")
                    .with_attachment("last_error", e.to_string());
                    let counters = PollCounters {
                        attempt: poll.attempt,
                        errors,
                    };
                    return self
                        .resolve(provider, task, TaskStatus::Error, result, Some(counters))
                        .await;
                }
                if next_attempt > provider.polling.max_attempts {
                    let counters = PollCounters {
                        attempt: poll.attempt,
                        errors,
                    };
                    return self.time_out(provider, task, counters).await;
                }
                let next = PollCounters {
                    attempt: next_attempt,
                    errors,
                };
                self.reschedule(provider, task, scheduled, next, None).await
            }
            Ok(snapshot) => {
                // A successful response clears the error streak even when it
                // ends the task.
                let counters = PollCounters {
                    attempt: poll.attempt,
                    errors: 0,
                };
                let classification = provider.classifier.classify(&snapshot.status);
                if let Some((status, result)) =
                    terminal_result(provider, classification, &snapshot)
                {
                    return self
                        .resolve(provider, task, status, result, Some(counters))
                        .await;
                }
                if next_attempt > provider.polling.max_attempts {
                    return self.time_out(provider, task, counters).await;
                }
                let next = PollCounters {
                    attempt: next_attempt,
                    errors: 0,
                };
                self.reschedule(provider, task, scheduled, next, Some(snapshot.status))
                    .await
            }
        }
    }

    async fn time_out(
        &self,
        provider: &Provider<P>,
        task: &TaskState,
        counters: PollCounters,
    ) -> Result<SignalOutcome, ReconcileError> {
        let max_attempts = provider.polling.max_attempts;
        let mut result = TaskResult::failure(format!(
            "no terminal status after {max_attempts} polls"
        ))
        .with_attachment("classification", "timeout");
        if let Some(last) = &task.last_status {
            result = result.with_attachment("last_status", last.clone());
        }
        self.resolve(provider, task, TaskStatus::TimedOut, result, Some(counters))
            .await
    }

    async fn reschedule(
        &self,
        provider: &Provider<P>,
        task: &TaskState,
        expected: PollCounters,
        next: PollCounters,
        last_status: Option<String>,
    ) -> Result<SignalOutcome, ReconcileError> {
        let delay = provider.backoff.delay(next.attempt);
        let update = PollUpdate {
            counters: next,
            last_status,
            scheduled_at: Some(due_at(delay)),
        };

        if !self.repo.record_poll(&task.id, expected, &update).await? {
            let reason = match self.repo.get_task(&task.id).await? {
                Some(current) if !current.is_terminal() => IgnoreReason::Superseded,
                _ => IgnoreReason::AlreadyTerminal,
            };
            tracing::debug!(task_id = %task.id, ?reason, "poll bookkeeping lost the race");
            return Ok(SignalOutcome::ignored(reason));
        }
        tracing::debug!(
            task_id = %task.id,
            attempt = next.attempt,
            errors = next.errors,
            "checkpoint: poll counters stored"
        );

        let params = callback_params(provider, &task.correlation_value, next);
        self.scheduler.schedule_poll_in(params, delay).await?;

        tracing::info!(
            task_id = %task.id,
            attempt = next.attempt,
            errors = next.errors,
            delay_ms = delay.as_millis() as u64,
            "poll rescheduled"
        );
        Ok(SignalOutcome::Rescheduled {
            attempt: next.attempt,
            errors: next.errors,
            delay_ms: delay.as_millis() as u64,
        })
    }

    /// Persist the terminal transition, then emit. Only the caller whose
    /// conditional write succeeded emits. Poll-sourced transitions carry the
    /// counters of the poll that ended the task.
    async fn resolve(
        &self,
        provider: &Provider<P>,
        task: &TaskState,
        status: TaskStatus,
        result: TaskResult,
        counters: Option<PollCounters>,
    ) -> Result<SignalOutcome, ReconcileError> {
        let won = self
            .repo
            .resolve(&task.id, status, &result, counters)
            .await
            .inspect_err(|e| {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist terminal transition");
            })?;
        if !won {
            tracing::debug!(task_id = %task.id, "terminal transition lost the race");
            return Ok(SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        }

        let completion = Completion {
            task_id: task.id,
            provider: provider.name.clone(),
            correlation_key: task.correlation_key.clone(),
            correlation_value: task.correlation_value.clone(),
            status,
            result,
        };
        let channel = completion.channel();
        self.emitter
            .emit(channel, COMPLETION_PAYLOAD_TYPE, &completion)
            .await
            .inspect_err(|e| {
                tracing::error!(task_id = %task.id, channel, error = %e, "failed to emit completion");
            })?;

        tracing::info!(
            task_id = %task.id,
            correlation_value = %task.correlation_value,
            status = %status,
            success = completion.result.success,
            channel,
            "task resolved"
        );
        Ok(SignalOutcome::Resolved {
            status,
            success: completion.result.success,
            channel: channel.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn due_at(delay: Duration) -> chrono::DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

fn callback_params<P>(
    provider: &Provider<P>,
    correlation_value: &str,
    counters: PollCounters,
) -> CallbackParams {
    CallbackParams {
        provider: provider.name.clone(),
        correlation_key: provider.correlation_key.clone(),
        correlation_value: correlation_value.to_string(),
        attempt: counters.attempt,
        errors: counters.errors,
    }
}

/// Map a terminal classification to the status and result to record.
fn terminal_result<P>(
    provider: &Provider<P>,
    classification: Classification,
    snapshot: &ExternalStatus,
) -> Option<(TaskStatus, TaskResult)> {
    let summary = snapshot
        .summary
        .clone()
        .unwrap_or_else(|| format!("{} reported {}", provider.name, snapshot.status));

    let mut result = match classification {
        Classification::Pending => return None,
        Classification::Succeeded => TaskResult::success(summary),
        Classification::Failed => TaskResult::failure(summary),
        Classification::Cancelled => {
            TaskResult::failure(summary).with_attachment("classification", "cancelled")
        }
    };
    if let Some(external_ref) = &snapshot.external_ref {
        result = result.with_external_ref(external_ref.clone());
    }
    for (k, v) in &snapshot.attachments {
        result.attachments.entry(k.clone()).or_insert_with(|| v.clone());
    }
    result = result.with_attachment("provider_status", snapshot.status.clone());
    Some((TaskStatus::Received, result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tether_types::config::{PayloadConfig, PollingConfig};
    use tether_types::error::ProbeError;
    use tether_types::task::{CHANNEL_FAILURE, CHANNEL_SUCCESS, CHANNEL_TIMEOUT};
    use uuid::Uuid;

    use crate::reconcile::classifier::CloudAgentClassifier;
    use crate::reconcile::payload::PayloadExtractor;
    use crate::reconcile::scheduler::PollBackoff;
    use crate::reconcile::verifier::SignatureVerifier;

    // -------------------------------------------------------------------
    // Fakes
    // -------------------------------------------------------------------

    #[derive(Default)]
    struct MemoryRepo {
        tasks: Mutex<HashMap<Uuid, TaskState>>,
        fail_resolve: AtomicBool,
    }

    impl MemoryRepo {
        fn only(&self) -> TaskState {
            let tasks = self.tasks.lock().unwrap();
            assert_eq!(tasks.len(), 1);
            tasks.values().next().cloned().unwrap()
        }

        /// Move every stored deadline into the past.
        fn expire_deadlines(&self) {
            let past = Utc::now() - chrono::Duration::seconds(1);
            for task in self.tasks.lock().unwrap().values_mut() {
                task.scheduled_at = Some(past);
            }
        }
    }

    impl TaskRepository for MemoryRepo {
        async fn store_correlation(&self, task: &TaskState) -> Result<(), RepositoryError> {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.values().any(|t| {
                t.provider == task.provider
                    && t.correlation_key == task.correlation_key
                    && t.correlation_value == task.correlation_value
            }) {
                return Err(RepositoryError::Conflict(task.correlation_value.clone()));
            }
            tasks.insert(task.id, task.clone());
            Ok(())
        }

        async fn find_by_correlation(
            &self,
            provider: &str,
            correlation_key: &str,
            correlation_value: &str,
        ) -> Result<Option<TaskState>, RepositoryError> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .find(|t| {
                    t.provider == provider
                        && t.correlation_key == correlation_key
                        && t.correlation_value == correlation_value
                })
                .cloned())
        }

        async fn get_task(&self, id: &Uuid) -> Result<Option<TaskState>, RepositoryError> {
            Ok(self.tasks.lock().unwrap().get(id).cloned())
        }

        async fn record_status(&self, id: &Uuid, last_status: &str) -> Result<bool, RepositoryError> {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get_mut(id) {
                Some(t) if !t.is_terminal() => {
                    t.last_status = Some(last_status.to_string());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn record_poll(
            &self,
            id: &Uuid,
            expected: PollCounters,
            update: &PollUpdate,
        ) -> Result<bool, RepositoryError> {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get_mut(id) {
                Some(t) if !t.is_terminal() && t.counters() == expected => {
                    t.poll_attempt = update.counters.attempt;
                    t.poll_errors = update.counters.errors;
                    if let Some(status) = &update.last_status {
                        t.last_status = Some(status.clone());
                    }
                    t.scheduled_at = update.scheduled_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn resolve(
            &self,
            id: &Uuid,
            status: TaskStatus,
            result: &TaskResult,
            counters: Option<PollCounters>,
        ) -> Result<bool, RepositoryError> {
            if self.fail_resolve.load(Ordering::SeqCst) {
                return Err(RepositoryError::Query("disk full".to_string()));
            }
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get_mut(id) {
                Some(t) if !t.is_terminal() => {
                    t.status = status;
                    t.result = Some(result.clone());
                    if let Some(counters) = counters {
                        t.poll_attempt = counters.attempt;
                        t.poll_errors = counters.errors;
                    }
                    t.scheduled_at = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn list_waiting(&self) -> Result<Vec<TaskState>, RepositoryError> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .filter(|t| !t.is_terminal())
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<(String, CallbackParams, Duration)>>,
    }

    impl RecordingScheduler {
        fn last(&self) -> (String, CallbackParams, Duration) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CallbackScheduler for RecordingScheduler {
        async fn schedule_callback(
            &self,
            name: &str,
            params: serde_json::Map<String, serde_json::Value>,
            delay: Duration,
        ) -> Result<(), SchedulerError> {
            let params = CallbackParams::from_map(&params).map_err(SchedulerError::Rejected)?;
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), params, delay));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEmitter {
        emitted: Mutex<Vec<(String, String, Completion)>>,
    }

    impl RecordingEmitter {
        fn count(&self) -> usize {
            self.emitted.lock().unwrap().len()
        }

        fn only(&self) -> (String, String, Completion) {
            let emitted = self.emitted.lock().unwrap();
            assert_eq!(emitted.len(), 1, "expected exactly one emission");
            emitted[0].clone()
        }
    }

    impl CompletionEmitter for RecordingEmitter {
        async fn emit(
            &self,
            channel: &str,
            payload_type: &str,
            completion: &Completion,
        ) -> Result<(), EmitError> {
            self.emitted.lock().unwrap().push((
                channel.to_string(),
                payload_type.to_string(),
                completion.clone(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedProbe {
        responses: Mutex<VecDeque<Result<ExternalStatus, ProbeError>>>,
        aborts: AtomicUsize,
        fail_abort: AtomicBool,
    }

    impl ScriptedProbe {
        fn push(&self, response: Result<ExternalStatus, ProbeError>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl PollProbe for Arc<ScriptedProbe> {
        async fn probe(&self, _correlation_value: &str) -> Result<ExternalStatus, ProbeError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExternalStatus::new("RUNNING")))
        }

        async fn abort(&self, _correlation_value: &str) -> Result<(), ProbeError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            if self.fail_abort.load(Ordering::SeqCst) {
                Err(ProbeError::Transport("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Accepts requests carrying `x-token: ok` (or the task secret when
    /// keyed per task).
    struct TokenVerifier {
        per_task: bool,
    }

    impl SignatureVerifier for TokenVerifier {
        fn scheme(&self) -> &str {
            "token"
        }

        fn needs_task_secret(&self) -> bool {
            self.per_task
        }

        fn verify(
            &self,
            headers: &WebhookHeaders,
            _body: &[u8],
            task_secret: Option<&[u8]>,
        ) -> Result<(), VerifyError> {
            let presented = headers
                .get_trimmed("x-token")
                .ok_or_else(|| VerifyError::MissingHeader("x-token".to_string()))?;
            let expected: &[u8] = if self.per_task {
                task_secret.ok_or(VerifyError::MissingSecret)?
            } else {
                b"ok"
            };
            if presented.as_bytes() == expected {
                Ok(())
            } else {
                Err(VerifyError::InvalidCredentials)
            }
        }
    }

    type TestReconciler =
        Reconciler<MemoryRepo, RecordingScheduler, RecordingEmitter, Arc<ScriptedProbe>>;

    fn provider(
        name: &str,
        polling: PollingConfig,
        timeout: Option<Duration>,
        probe: Option<Arc<ScriptedProbe>>,
        per_task: bool,
    ) -> Provider<Arc<ScriptedProbe>> {
        Provider {
            name: name.to_string(),
            correlation_key: "agent_id".to_string(),
            verifier: Arc::new(TokenVerifier { per_task }),
            extractor: PayloadExtractor::new(PayloadConfig {
                summary: Some("/summary".to_string()),
                ..PayloadConfig::default()
            }),
            classifier: Arc::new(CloudAgentClassifier),
            backoff: PollBackoff::from_config(&polling),
            polling,
            timeout,
            probe,
        }
    }

    fn polling(max_attempts: u32, max_consecutive_errors: u32) -> PollingConfig {
        PollingConfig {
            enabled: true,
            max_attempts,
            max_consecutive_errors,
            ..PollingConfig::default()
        }
    }

    fn polling_reconciler(
        max_attempts: u32,
        max_errors: u32,
    ) -> (TestReconciler, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::default());
        let registry = ProviderRegistry::new();
        registry.register(provider(
            "cloud-agent",
            polling(max_attempts, max_errors),
            None,
            Some(Arc::clone(&probe)),
            false,
        ));
        let reconciler = Reconciler::new(
            MemoryRepo::default(),
            RecordingScheduler::default(),
            RecordingEmitter::default(),
            registry,
        );
        (reconciler, probe)
    }

    fn webhook_reconciler(timeout: Option<Duration>, per_task: bool) -> TestReconciler {
        let registry = ProviderRegistry::new();
        registry.register(provider(
            "slack",
            PollingConfig::default(),
            timeout,
            None,
            per_task,
        ));
        Reconciler::new(
            MemoryRepo::default(),
            RecordingScheduler::default(),
            RecordingEmitter::default(),
            registry,
        )
    }

    fn issue_request(provider: &str, value: &str) -> IssueRequest {
        IssueRequest {
            provider: provider.to_string(),
            correlation_value: value.to_string(),
            webhook_secret: None,
        }
    }

    fn token_headers(token: &str) -> WebhookHeaders {
        [("X-Token", token)].into_iter().collect()
    }

    fn body(id: &str, status: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({"id": id, "status": status, "summary": "done"}))
            .unwrap()
    }

    async fn run_poll(reconciler: &TestReconciler) -> SignalOutcome {
        let (_, params, _) = reconciler.scheduler().last();
        reconciler.poll(params).await.unwrap()
    }

    // -------------------------------------------------------------------
    // issue
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_issue_schedules_first_poll_at_initial_interval() {
        let (reconciler, _) = polling_reconciler(20, 5);
        let task = reconciler
            .issue(issue_request("cloud-agent", "agent-42"))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.counters(), PollCounters::INITIAL);
        assert!(task.scheduled_at.is_some());

        let (name, params, delay) = reconciler.scheduler().last();
        assert_eq!(name, POLL_ACTION);
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!((params.attempt, params.errors), (1, 0));
        assert_eq!(params.correlation_value, "agent-42");
    }

    #[tokio::test]
    async fn test_issue_webhook_only_schedules_single_timeout_check() {
        let reconciler = webhook_reconciler(Some(Duration::from_secs(3600)), false);
        reconciler.issue(issue_request("slack", "1700000000.0001")).await.unwrap();

        assert_eq!(reconciler.scheduler().count(), 1);
        let (name, _, delay) = reconciler.scheduler().last();
        assert_eq!(name, CHECK_TIMEOUT_ACTION);
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_issue_duplicate_correlation_conflicts() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let err = reconciler
            .issue(issue_request("cloud-agent", "agent-42"))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn test_issue_unknown_provider() {
        let (reconciler, _) = polling_reconciler(20, 5);
        let err = reconciler.issue(issue_request("nope", "x")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownProvider(_)));
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_issue_per_task_provider_requires_secret() {
        let reconciler = webhook_reconciler(None, true);
        let err = reconciler.issue(issue_request("slack", "x")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidParameters(_)));
    }

    // -------------------------------------------------------------------
    // webhook path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_webhook_success_resolves_and_emits_once() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        let outcome = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Resolved {
                status: TaskStatus::Received,
                success: true,
                channel: CHANNEL_SUCCESS.to_string(),
            }
        );

        let (channel, payload_type, completion) = reconciler.emitter().only();
        assert_eq!(channel, CHANNEL_SUCCESS);
        assert_eq!(payload_type, COMPLETION_PAYLOAD_TYPE);
        assert_eq!(completion.correlation_value, "agent-42");
        assert_eq!(completion.result.summary, "done");
        assert_eq!(reconciler.repository().only().status, TaskStatus::Received);
    }

    #[tokio::test]
    async fn test_webhook_replay_is_idempotent() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let payload = body("agent-42", "FINISHED");

        reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &payload)
            .await
            .unwrap();
        let replay = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &payload)
            .await
            .unwrap();

        assert_eq!(replay, SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        assert_eq!(reconciler.emitter().count(), 1);
    }

    #[tokio::test]
    async fn test_webhook_unknown_task_is_benign() {
        let (reconciler, _) = polling_reconciler(20, 5);
        let outcome = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("ghost", "FINISHED"))
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::NotFound));
    }

    #[tokio::test]
    async fn test_webhook_bad_credentials_never_touch_state() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        let err = reconciler
            .handle_webhook("cloud-agent", &token_headers("wrong"), &body("agent-42", "FINISHED"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Unauthorized(_)));
        assert_eq!(err.http_status(), 401);
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
        assert_eq!(reconciler.emitter().count(), 0);
    }

    #[tokio::test]
    async fn test_webhook_malformed_body_is_client_error() {
        let (reconciler, _) = polling_reconciler(20, 5);
        let err = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), b"{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedPayload(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_webhook_intermediate_status_keeps_waiting() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let scheduled_before = reconciler.scheduler().count();

        let outcome = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "RUNNING"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Pending {
                last_status: "RUNNING".to_string()
            }
        );

        let task = reconciler.repository().only();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.last_status.as_deref(), Some("RUNNING"));
        assert_eq!(task.counters(), PollCounters::INITIAL);
        assert_eq!(reconciler.scheduler().count(), scheduled_before);
    }

    #[tokio::test]
    async fn test_webhook_cancelled_status_records_failure_classification() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "CANCELLED"))
            .await
            .unwrap();

        let (channel, _, completion) = reconciler.emitter().only();
        assert_eq!(channel, CHANNEL_FAILURE);
        assert!(!completion.result.success);
        assert_eq!(
            completion.result.attachments.get("classification").map(String::as_str),
            Some("cancelled")
        );
    }

    #[tokio::test]
    async fn test_per_task_secret_verified_after_lookup() {
        let reconciler = webhook_reconciler(None, true);
        reconciler
            .issue(IssueRequest {
                webhook_secret: Some(b"task-secret".to_vec()),
                ..issue_request("slack", "ts-1")
            })
            .await
            .unwrap();

        let err = reconciler
            .handle_webhook("slack", &token_headers("ok"), &body("ts-1", "FINISHED"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Unauthorized(_)));

        let outcome = reconciler
            .handle_webhook("slack", &token_headers("task-secret"), &body("ts-1", "FINISHED"))
            .await
            .unwrap();
        assert!(outcome.is_resolved());
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_emit() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        reconciler.repository().fail_resolve.store(true, Ordering::SeqCst);

        let err = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert_eq!(reconciler.emitter().count(), 0);

        // The natural redelivery succeeds once storage recovers.
        reconciler.repository().fail_resolve.store(false, Ordering::SeqCst);
        let outcome = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(reconciler.emitter().count(), 1);
    }

    fn shared_key_reconciler() -> TestReconciler {
        let registry = ProviderRegistry::new();
        registry.register(provider("open", PollingConfig::default(), None, None, false));
        registry.register(provider("secure", PollingConfig::default(), None, None, true));
        Reconciler::new(
            MemoryRepo::default(),
            RecordingScheduler::default(),
            RecordingEmitter::default(),
            registry,
        )
    }

    #[tokio::test]
    async fn test_shared_correlation_key_is_scoped_to_provider() {
        let reconciler = shared_key_reconciler();
        reconciler
            .issue(IssueRequest {
                webhook_secret: Some(b"s3cret".to_vec()),
                ..issue_request("secure", "agent-42")
            })
            .await
            .unwrap();

        // The weaker provider's route cannot see or resolve the task.
        let outcome = reconciler
            .handle_webhook("open", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::NotFound));
        assert!(reconciler.find_task("open", "agent-42").await.unwrap().is_none());
        assert!(!reconciler.cancel("open", "agent-42").await.unwrap());
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
        assert_eq!(reconciler.emitter().count(), 0);

        let outcome = reconciler
            .handle_webhook("secure", &token_headers("s3cret"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();
        assert!(outcome.is_resolved());
        let (_, _, completion) = reconciler.emitter().only();
        assert_eq!(completion.provider, "secure");
    }

    #[tokio::test]
    async fn test_same_value_under_two_providers_stays_separate() {
        let reconciler = shared_key_reconciler();
        reconciler.issue(issue_request("open", "agent-42")).await.unwrap();
        reconciler
            .issue(IssueRequest {
                webhook_secret: Some(b"s3cret".to_vec()),
                ..issue_request("secure", "agent-42")
            })
            .await
            .unwrap();

        reconciler
            .handle_webhook("open", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();

        let open = reconciler.find_task("open", "agent-42").await.unwrap().unwrap();
        let secure = reconciler.find_task("secure", "agent-42").await.unwrap().unwrap();
        assert_eq!(open.status, TaskStatus::Received);
        assert_eq!(secure.status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_callback_for_other_provider_is_not_found() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let (_, mut params, _) = reconciler.scheduler().last();
        params.correlation_key = "message_ts".to_string();

        let outcome = reconciler.poll(params).await.unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::NotFound));
        assert_eq!(reconciler.repository().only().counters(), PollCounters::INITIAL);
    }

    // -------------------------------------------------------------------
    // poll path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_poll_persistence_failure_rearms_same_callback() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let (_, first, _) = reconciler.scheduler().last();

        reconciler.repository().fail_resolve.store(true, Ordering::SeqCst);
        probe.push(Ok(ExternalStatus::new("FINISHED")));
        let err = reconciler.poll(first.clone()).await.unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert_eq!(reconciler.emitter().count(), 0);

        let (name, rearmed, delay) = reconciler.scheduler().last();
        assert_eq!(reconciler.scheduler().count(), 2);
        assert_eq!(name, POLL_ACTION);
        assert_eq!(rearmed, first);
        assert_eq!(delay, Duration::from_secs(30));

        reconciler.repository().fail_resolve.store(false, Ordering::SeqCst);
        probe.push(Ok(ExternalStatus::new("FINISHED")));
        assert!(run_poll(&reconciler).await.is_resolved());
        assert_eq!(reconciler.emitter().count(), 1);
    }

    #[tokio::test]
    async fn test_error_budget_exhaustion_transitions_to_error() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        for _ in 0..5 {
            probe.push(Err(ProbeError::Transport("timeout".to_string())));
        }
        for expected_errors in 1..5 {
            let outcome = run_poll(&reconciler).await;
            assert!(
                matches!(outcome, SignalOutcome::Rescheduled { errors, .. } if errors == expected_errors),
                "unexpected outcome {outcome:?}"
            );
        }
        let outcome = run_poll(&reconciler).await;
        assert_eq!(
            outcome,
            SignalOutcome::Resolved {
                status: TaskStatus::Error,
                success: false,
                channel: CHANNEL_FAILURE.to_string(),
            }
        );
        assert_eq!(reconciler.emitter().count(), 1);
        assert_eq!(reconciler.repository().only().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_successful_poll_resets_error_counter() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        for _ in 0..4 {
            probe.push(Err(ProbeError::Provider {
                status: 503,
                message: "busy".to_string(),
            }));
        }
        probe.push(Ok(ExternalStatus::new("RUNNING")));
        for _ in 0..5 {
            run_poll(&reconciler).await;
        }

        let task = reconciler.repository().only();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.poll_errors, 0);
        assert_eq!(task.poll_attempt, 6);
        assert_eq!(task.last_status.as_deref(), Some("RUNNING"));
        assert_eq!(reconciler.emitter().count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_poll_after_failures_clears_error_counter() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        probe.push(Err(ProbeError::Transport("reset".to_string())));
        probe.push(Err(ProbeError::Transport("reset".to_string())));
        probe.push(Ok(ExternalStatus::new("FINISHED")));
        run_poll(&reconciler).await;
        run_poll(&reconciler).await;
        assert_eq!(reconciler.repository().only().poll_errors, 2);

        assert!(run_poll(&reconciler).await.is_resolved());
        let task = reconciler.repository().only();
        assert_eq!(task.status, TaskStatus::Received);
        assert_eq!(task.poll_errors, 0);
        assert_eq!(task.poll_attempt, 3);
    }

    #[tokio::test]
    async fn test_exceeding_max_attempts_times_out_once() {
        let (reconciler, probe) = polling_reconciler(3, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        probe.push(Ok(ExternalStatus::new("RUNNING")));
        probe.push(Err(ProbeError::Transport("reset".to_string())));
        probe.push(Ok(ExternalStatus::new("CREATING")));

        assert!(matches!(run_poll(&reconciler).await, SignalOutcome::Rescheduled { attempt: 2, .. }));
        assert!(matches!(run_poll(&reconciler).await, SignalOutcome::Rescheduled { attempt: 3, .. }));
        let outcome = run_poll(&reconciler).await;
        assert_eq!(
            outcome,
            SignalOutcome::Resolved {
                status: TaskStatus::TimedOut,
                success: false,
                channel: CHANNEL_TIMEOUT.to_string(),
            }
        );
        // Scheduler saw the initial poll plus two reschedules, nothing after.
        assert_eq!(reconciler.scheduler().count(), 3);
        assert_eq!(reconciler.emitter().count(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_uses_backoff_for_next_attempt() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        let outcome = run_poll(&reconciler).await;
        assert_eq!(
            outcome,
            SignalOutcome::Rescheduled {
                attempt: 2,
                errors: 0,
                delay_ms: 60_000,
            }
        );
        let (_, params, delay) = reconciler.scheduler().last();
        assert_eq!((params.attempt, params.errors), (2, 0));
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_duplicate_poll_callback_is_superseded() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let (_, first, _) = reconciler.scheduler().last();

        run_poll(&reconciler).await;
        let again = reconciler.poll(first).await.unwrap();
        assert_eq!(again, SignalOutcome::ignored(IgnoreReason::Superseded));
        assert_eq!(reconciler.repository().only().poll_attempt, 2);
    }

    #[tokio::test]
    async fn test_agent_scenario_webhook_wins_over_inflight_poll() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        // Poll 1: still running.
        probe.push(Ok(ExternalStatus::new("RUNNING")));
        assert!(matches!(run_poll(&reconciler).await, SignalOutcome::Rescheduled { .. }));
        let (_, inflight, _) = reconciler.scheduler().last();

        // Webhook reports completion.
        let outcome = reconciler
            .handle_webhook("cloud-agent", &token_headers("ok"), &body("agent-42", "FINISHED"))
            .await
            .unwrap();
        assert!(outcome.is_resolved());

        // Poll 2 was already scheduled and finds the task terminal.
        let late = reconciler.poll(inflight).await.unwrap();
        assert_eq!(late, SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        assert_eq!(reconciler.emitter().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_webhook_and_poll_emit_at_most_once() {
        for round in 0..25 {
            let (reconciler, probe) = polling_reconciler(20, 5);
            let reconciler = Arc::new(reconciler);
            let value = format!("agent-{round}");
            reconciler.issue(issue_request("cloud-agent", &value)).await.unwrap();
            probe.push(Ok(ExternalStatus::new("ERROR")));
            let (_, params, _) = reconciler.scheduler().last();

            let webhook = {
                let reconciler = Arc::clone(&reconciler);
                let payload = body(&value, "FINISHED");
                tokio::spawn(async move {
                    reconciler
                        .handle_webhook("cloud-agent", &token_headers("ok"), &payload)
                        .await
                        .unwrap()
                })
            };
            let poll = {
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move { reconciler.poll(params).await.unwrap() })
            };

            let (a, b) = (webhook.await.unwrap(), poll.await.unwrap());
            assert_eq!(
                [a.is_resolved(), b.is_resolved()].iter().filter(|r| **r).count(),
                1
            );

            let (channel, _, completion) = reconciler.emitter().only();
            // The emitted result belongs to whichever signal won.
            if a.is_resolved() {
                assert_eq!(channel, CHANNEL_SUCCESS);
            } else {
                assert_eq!(channel, CHANNEL_FAILURE);
            }
            assert_eq!(
                reconciler.repository().only().result.unwrap(),
                completion.result
            );
        }
    }

    // -------------------------------------------------------------------
    // timeout check / actions
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_timeout_check_times_out_waiting_task() {
        let reconciler = webhook_reconciler(Some(Duration::from_secs(60)), false);
        reconciler.issue(issue_request("slack", "ts-1")).await.unwrap();
        let (name, params, _) = reconciler.scheduler().last();
        reconciler.repository().expire_deadlines();

        let outcome = reconciler
            .handle_action(&name, &params.into_map())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Resolved {
                status: TaskStatus::TimedOut,
                success: false,
                channel: CHANNEL_TIMEOUT.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_check_before_deadline_is_superseded() {
        let reconciler = webhook_reconciler(Some(Duration::from_secs(60)), false);
        reconciler.issue(issue_request("slack", "ts-1")).await.unwrap();
        let (name, params, _) = reconciler.scheduler().last();

        let outcome = reconciler
            .handle_action(&name, &params.into_map())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::Superseded));
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
        assert_eq!(reconciler.emitter().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_check_never_ends_polling_task() {
        let (reconciler, _) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        let (_, params, _) = reconciler.scheduler().last();
        reconciler.repository().expire_deadlines();

        let outcome = reconciler
            .handle_action(CHECK_TIMEOUT_ACTION, &params.into_map())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::Superseded));
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
        assert_eq!(reconciler.emitter().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_check_without_configured_timeout_is_superseded() {
        let reconciler = webhook_reconciler(None, false);
        reconciler.issue(issue_request("slack", "ts-1")).await.unwrap();
        assert_eq!(reconciler.scheduler().count(), 0);

        let params = CallbackParams {
            provider: "slack".to_string(),
            correlation_key: "agent_id".to_string(),
            correlation_value: "ts-1".to_string(),
            attempt: 1,
            errors: 0,
        };
        let outcome = reconciler.check_timeout(params).await.unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::Superseded));
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_timeout_check_after_resolution_is_noop() {
        let reconciler = webhook_reconciler(Some(Duration::from_secs(60)), false);
        reconciler.issue(issue_request("slack", "ts-1")).await.unwrap();
        reconciler
            .handle_webhook("slack", &token_headers("ok"), &body("ts-1", "FINISHED"))
            .await
            .unwrap();

        let (_, params, _) = reconciler.scheduler().last();
        let outcome = reconciler.check_timeout(params).await.unwrap();
        assert_eq!(outcome, SignalOutcome::ignored(IgnoreReason::AlreadyTerminal));
        assert_eq!(reconciler.emitter().count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_and_bad_params_are_rejected() {
        let (reconciler, _) = polling_reconciler(20, 5);
        let err = reconciler
            .handle_action("poll", &serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidParameters(_)));

        let params = CallbackParams {
            provider: "cloud-agent".to_string(),
            correlation_key: "agent_id".to_string(),
            correlation_value: "x".to_string(),
            attempt: 1,
            errors: 0,
        };
        let err = reconciler
            .handle_action("explode", &params.into_map())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    // -------------------------------------------------------------------
    // cancel / resume
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_aborts_without_transition() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();

        assert!(reconciler.cancel("cloud-agent", "agent-42").await.unwrap());
        assert_eq!(probe.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
        assert_eq!(reconciler.emitter().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_failure_is_swallowed() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        probe.fail_abort.store(true, Ordering::SeqCst);

        assert!(!reconciler.cancel("cloud-agent", "agent-42").await.unwrap());
        assert_eq!(reconciler.repository().only().status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_resume_waiting_rearms_polls_with_stored_counters() {
        let (reconciler, probe) = polling_reconciler(20, 5);
        reconciler.issue(issue_request("cloud-agent", "agent-42")).await.unwrap();
        probe.push(Err(ProbeError::Transport("reset".to_string())));
        run_poll(&reconciler).await;

        let resumed = reconciler.resume_waiting().await.unwrap();
        assert_eq!(resumed, 1);
        let (name, params, delay) = reconciler.scheduler().last();
        assert_eq!(name, POLL_ACTION);
        assert_eq!((params.attempt, params.errors), (2, 1));
        assert!(delay <= Duration::from_secs(60));

        // The re-armed callback is accepted as current.
        assert!(matches!(
            reconciler.poll(params).await.unwrap(),
            SignalOutcome::Rescheduled { attempt: 3, errors: 0, .. }
        ));
    }
}
