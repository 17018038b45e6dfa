//! Engine configuration loader for Synapse.
//!
//! Reads `synapse.toml` from the data directory (`~/.synapse/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use synapse_types::config::EngineConfig;

/// File name of the engine configuration inside the data directory.
pub const CONFIG_FILE_NAME: &str = "synapse.toml";

/// Load engine configuration from `{data_dir}/synapse.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No synapse.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Data directory for Synapse state.
///
/// `SYNAPSE_DATA_DIR` wins; otherwise `~/.synapse`, or `./.synapse` when no
/// home directory can be determined.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SYNAPSE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".synapse")
}

/// Default SQLite URL inside [`data_dir`].
pub fn default_database_url() -> String {
    format!("sqlite://{}?mode=rwc", data_dir().join("synapse.db").display())
}

/// Database URL for the SQLite backend: the configured one, else the default.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .store
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
