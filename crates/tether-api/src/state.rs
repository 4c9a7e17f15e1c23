//! Application state wiring the reconciler to its infra adapters.
//!
//! The reconciler is generic over its ports; `AppState` pins it to SQLite
//! storage, the tokio timer scheduler, the broadcast emitter and the HTTP
//! status probe.

use std::path::PathBuf;
use std::sync::Arc;

use tether_core::reconcile::Reconciler;
use tether_infra::provider::build_registry;
use tether_infra::runtime::{
    BroadcastEmitter, EmittedCompletion, HttpPollProbe, ScheduledCallback, TokioCallbackScheduler,
};
use tether_infra::sqlite::pool::{DatabasePool, database_url_in};
use tether_infra::sqlite::task::SqliteTaskRepository;
use tether_types::config::TetherConfig;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Pending callbacks allowed in flight between timers and the dispatcher.
const CALLBACK_CAPACITY: usize = 1024;
/// Completions buffered per subscriber before it starts lagging.
const COMPLETION_CAPACITY: usize = 256;

pub type ConcreteReconciler =
    Reconciler<SqliteTaskRepository, TokioCallbackScheduler, BroadcastEmitter, HttpPollProbe>;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<ConcreteReconciler>,
    pub data_dir: PathBuf,
}

/// Receivers the host drains in the background.
pub struct Background {
    pub callbacks: mpsc::Receiver<ScheduledCallback>,
    pub completions: broadcast::Receiver<EmittedCompletion>,
}

impl AppState {
    /// Validate the configuration, open the database and wire the reconciler.
    ///
    /// The completion receiver is subscribed before the reconciler exists so
    /// no emission can find the channel without a listener.
    pub async fn init(
        data_dir: PathBuf,
        config: &TetherConfig,
        shutdown: CancellationToken,
    ) -> anyhow::Result<(Self, Background)> {
        let providers = build_registry(config)?;

        tokio::fs::create_dir_all(&data_dir).await?;
        let db_url = config
            .database
            .url
            .clone()
            .unwrap_or_else(|| database_url_in(&data_dir));
        let pool = DatabasePool::new(&db_url).await?;

        let (scheduler, callbacks) = TokioCallbackScheduler::new(CALLBACK_CAPACITY, shutdown);
        let emitter = BroadcastEmitter::new(COMPLETION_CAPACITY);
        let completions = emitter.subscribe();

        let reconciler = Reconciler::new(
            SqliteTaskRepository::new(pool),
            scheduler,
            emitter,
            providers,
        );

        Ok((
            Self {
                reconciler: Arc::new(reconciler),
                data_dir,
            },
            Background {
                callbacks,
                completions,
            },
        ))
    }
}
