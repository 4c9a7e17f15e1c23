//! Tether daemon entry point.
//!
//! Binary name: `tetherd`
//!
//! Loads configuration, initializes tracing, then either serves the
//! webhook/action HTTP surface or runs a one-shot inspection command.

mod cli;
mod dispatcher;
mod http;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tether_core::reconcile::scheduler::PollBackoff;
use tether_infra::config::{CONFIG_FILE, default_data_dir, load_config};
use tether_observe::tracing_setup::{init_tracing, level_for_verbosity, shutdown_tracing};
use tether_types::config::TetherConfig;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use dispatcher::BackgroundTasks;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let mut config = load_config(&config_path).await;
    config.log.level = level_for_verbosity(&config.log.level, cli.verbose);

    init_tracing(&config.log).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(data_dir, config).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Backoff {
            initial,
            max,
            attempts,
        } => {
            print_backoff(initial, max, attempts);
            Ok(())
        }
    };

    shutdown_tracing();
    result
}

async fn serve(data_dir: PathBuf, config: TetherConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let (state, background) = AppState::init(data_dir, &config, shutdown.clone()).await?;

    let background =
        BackgroundTasks::spawn(Arc::clone(&state.reconciler), background, shutdown.clone());

    let resumed = state.reconciler.resume_waiting().await?;
    tracing::info!(
        providers = ?state.reconciler.providers().names(),
        resumed,
        data_dir = %state.data_dir.display(),
        "reconciler ready"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "tetherd listening");

    let router = http::router::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let forwarded = background.shutdown().await;
    tracing::info!(forwarded, "server stopped");
    Ok(())
}

fn print_backoff(initial: u64, max: u64, attempts: u32) {
    let backoff = PollBackoff::new(
        std::time::Duration::from_secs(initial),
        std::time::Duration::from_secs(max),
    );
    let mut elapsed = 0u64;
    println!("{:>7}  {:>8}  {:>10}", "attempt", "delay_s", "elapsed_s");
    for (i, delay) in backoff.schedule(attempts).into_iter().enumerate() {
        elapsed = elapsed.saturating_add(delay.as_secs());
        println!("{:>7}  {:>8}  {:>10}", i + 1, delay.as_secs(), elapsed);
    }
}

/// Wait for Ctrl+C, SIGTERM or an internal cancel, then cancel `token`.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }
    token.cancel();
}
