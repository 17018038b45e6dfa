//! Infrastructure layer for Synapse.
//!
//! Contains implementations of the ports defined in `synapse-core`: the
//! SQLite-backed instance store and the `synapse.toml` configuration loader.

pub mod config;
pub mod sqlite;
