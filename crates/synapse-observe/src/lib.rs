//! Observability for Synapse: tracing subscriber setup and an engine event
//! logger that turns bus notifications into structured log records.

pub mod event_log;
pub mod tracing_setup;
