//! Configuration loader for Tether.
//!
//! Reads `tether.toml` from the data directory (`~/.tether/` by default) and
//! deserializes it into [`TetherConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use tether_types::config::TetherConfig;

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "tether.toml";

/// `TETHER_DATA_DIR`, falling back to `~/.tether`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TETHER_DATA_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Load configuration from `path`.
///
/// - If the file does not exist, returns [`TetherConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config. Validation is the caller's job.
pub async fn load_config(path: &Path) -> TetherConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return TetherConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return TetherConfig::default();
        }
    };

    match toml::from_str::<TetherConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            TetherConfig::default()
        }
    }
}
