//! Background loops: callback dispatch and completion forwarding.

use std::sync::Arc;

use tether_infra::runtime::{EmittedCompletion, ScheduledCallback};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::state::{Background, ConcreteReconciler};

/// Route due callbacks to the reconciler's action entry point until
/// shutdown. Each callback runs in its own task on `tracker` so a slow probe
/// does not hold up the rest.
pub async fn run_dispatcher(
    reconciler: Arc<ConcreteReconciler>,
    mut callbacks: mpsc::Receiver<ScheduledCallback>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let callback = tokio::select! {
            callback = callbacks.recv() => callback,
            _ = shutdown.cancelled() => break,
        };
        let Some(callback) = callback else { break };

        let reconciler = Arc::clone(&reconciler);
        tracker.spawn(async move {
            match reconciler
                .handle_action(&callback.name, &callback.params)
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(action = %callback.name, ?outcome, "callback dispatched");
                }
                Err(e) => {
                    tracing::error!(action = %callback.name, error = %e, "callback failed");
                }
            }
        });
    }
    tracing::debug!("dispatcher stopped");
}

/// Forward completions to the log until `stop`. This is the hand-off point
/// to the workflow engine that resumes the suspended execution.
///
/// Completions already buffered when `stop` fires are still forwarded.
/// Returns how many completions were forwarded.
pub async fn log_completions(
    mut completions: broadcast::Receiver<EmittedCompletion>,
    stop: CancellationToken,
) -> usize {
    let mut forwarded = 0;
    loop {
        let received = tokio::select! {
            received = completions.recv() => received,
            _ = stop.cancelled() => break,
        };
        match received {
            Ok(emitted) => {
                forward(&emitted);
                forwarded += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "completion subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return forwarded,
        }
    }

    loop {
        match completions.try_recv() {
            Ok(emitted) => {
                forward(&emitted);
                forwarded += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "completion subscriber lagged");
            }
            Err(_) => break,
        }
    }
    forwarded
}

fn forward(emitted: &EmittedCompletion) {
    let completion = &emitted.completion;
    tracing::info!(
        task_id = %completion.task_id,
        provider = %completion.provider,
        correlation_value = %completion.correlation_value,
        status = %completion.status,
        channel = %emitted.channel,
        payload_type = %emitted.payload_type,
        summary = %completion.result.summary,
        "completion emitted"
    );
}

/// The running background loops of `tetherd serve`.
pub struct BackgroundTasks {
    dispatcher: JoinHandle<()>,
    completions: JoinHandle<usize>,
    callbacks: TaskTracker,
    completions_stop: CancellationToken,
}

impl BackgroundTasks {
    /// Start the dispatcher and the completion forwarder. The dispatcher
    /// stops taking callbacks when `shutdown` is cancelled.
    pub fn spawn(
        reconciler: Arc<ConcreteReconciler>,
        background: Background,
        shutdown: CancellationToken,
    ) -> Self {
        let callbacks = TaskTracker::new();
        let completions_stop = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            reconciler,
            background.callbacks,
            shutdown,
            callbacks.clone(),
        ));
        let completions = tokio::spawn(log_completions(
            background.completions,
            completions_stop.clone(),
        ));
        Self {
            dispatcher,
            completions,
            callbacks,
            completions_stop,
        }
    }

    /// Stop in dependency order: the dispatcher, then every callback still
    /// running, then the completion forwarder once nothing can emit.
    /// Returns how many completions were forwarded over the whole run.
    pub async fn shutdown(self) -> usize {
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "dispatcher task failed");
        }

        self.callbacks.close();
        if !self.callbacks.is_empty() {
            tracing::info!(in_flight = self.callbacks.len(), "waiting for in-flight callbacks");
        }
        self.callbacks.wait().await;

        self.completions_stop.cancel();
        match self.completions.await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                tracing::error!(error = %e, "completion forwarder failed");
                0
            }
        }
    }
}
