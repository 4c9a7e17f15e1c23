//! Timer-based callback scheduler.
//!
//! Each `schedule_callback` spawns one sleeping task. When it wakes, the
//! callback is pushed onto an mpsc channel drained by the host's dispatcher.
//! Cancelling the shutdown token drops every pending callback; waiting
//! tasks are re-armed from storage on the next start.

use std::time::Duration;

use tether_core::reconcile::scheduler::CallbackScheduler;
use tether_types::error::SchedulerError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A callback whose delay has elapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCallback {
    pub name: String,
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct TokioCallbackScheduler {
    sender: mpsc::Sender<ScheduledCallback>,
    shutdown: CancellationToken,
}

impl TokioCallbackScheduler {
    /// Create a scheduler and the receiver its due callbacks arrive on.
    pub fn new(
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<ScheduledCallback>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, shutdown }, receiver)
    }
}

impl CallbackScheduler for TokioCallbackScheduler {
    async fn schedule_callback(
        &self,
        name: &str,
        params: serde_json::Map<String, serde_json::Value>,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() || self.sender.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let callback = ScheduledCallback {
            name: name.to_string(),
            params,
        };
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if sender.send(callback).await.is_err() {
                        tracing::warn!("dispatcher gone, callback dropped");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!(action = %callback.name, "pending callback dropped on shutdown");
                }
            }
        });
        Ok(())
    }
}
