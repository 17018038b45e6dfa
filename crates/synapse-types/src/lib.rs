//! Shared domain types for Synapse.
//!
//! This crate contains the domain types used across the Synapse workflow
//! engine: workflow definitions, workflow and task instances, correlations,
//! events, configuration and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
