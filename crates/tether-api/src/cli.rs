//! CLI definitions for the `tetherd` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reconcile suspended workflow executions with external tasks.
#[derive(Parser)]
#[command(name = "tetherd", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory holding `tether.toml` and the task database.
    #[arg(long, global = true, env = "TETHER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file path (defaults to `{data_dir}/tether.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the webhook and action HTTP server.
    Serve {
        /// Address to bind (overrides `[server].host`).
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides `[server].port`).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the effective configuration as TOML.
    Config,

    /// Print a poll backoff schedule.
    Backoff {
        /// First poll interval in seconds.
        #[arg(long, default_value_t = 30)]
        initial: u64,

        /// Interval ceiling in seconds.
        #[arg(long, default_value_t = 600)]
        max: u64,

        /// Number of attempts to show.
        #[arg(long, default_value_t = 20)]
        attempts: u32,
    },
}
