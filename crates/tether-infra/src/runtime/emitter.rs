//! Broadcast completion emitter.
//!
//! Built on `tokio::sync::broadcast`; the host subscribes and forwards
//! completions to the workflow engine. Emitting with no subscriber is an
//! error, since the completion would be lost.

use tether_core::reconcile::emitter::CompletionEmitter;
use tether_types::error::EmitError;
use tether_types::task::Completion;
use tokio::sync::broadcast;

/// One emission as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EmittedCompletion {
    pub channel: String,
    pub payload_type: String,
    pub completion: Completion,
}

#[derive(Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<EmittedCompletion>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmittedCompletion> {
        self.sender.subscribe()
    }
}

impl std::fmt::Debug for BroadcastEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEmitter")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl CompletionEmitter for BroadcastEmitter {
    async fn emit(
        &self,
        channel: &str,
        payload_type: &str,
        completion: &Completion,
    ) -> Result<(), EmitError> {
        let emitted = EmittedCompletion {
            channel: channel.to_string(),
            payload_type: payload_type.to_string(),
            completion: completion.clone(),
        };
        self.sender
            .send(emitted)
            .map(|_| ())
            .map_err(|_| EmitError::ChannelClosed(channel.to_string()))
    }
}
