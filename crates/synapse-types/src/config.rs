//! Engine configuration types for Synapse.
//!
//! `EngineConfig` represents the top-level `synapse.toml` that selects the
//! instance store backend and tunes the correlation engine and event bus.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Synapse engines.
///
/// Loaded from `synapse.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub tracing: TracingConfig,
}

fn default_event_bus_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            correlation: CorrelationConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
            tracing: TracingConfig::default(),
        }
    }
}

/// Which instance store implementation backs the engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite connection URL. Falls back to the data-dir default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Upper bound on open contexts per parallel correlation. The oldest
    /// context is evicted once exceeded.
    #[serde(default = "default_max_open_contexts")]
    pub max_open_contexts: usize,

    /// Upper bound on distinct filter faults kept per correlation. Repeats
    /// of one fault are counted in place.
    #[serde(default = "default_max_recorded_faults")]
    pub max_recorded_faults: usize,
}

fn default_max_open_contexts() -> usize {
    1024
}

fn default_max_recorded_faults() -> usize {
    32
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_open_contexts: default_max_open_contexts(),
            max_recorded_faults: default_max_recorded_faults(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Export spans through OpenTelemetry in addition to the fmt layer.
    #[serde(default)]
    pub otel: bool,
}
