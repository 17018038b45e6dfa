use synapse_types::error::RepositoryError;
use thiserror::Error;

/// Errors returned by the correlation engine.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// A rule that can never complete (no conditions, empty filter lists).
    #[error("invalid correlation rule: {0}")]
    InvalidRule(String),

    #[error("correlation '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why an outcome could not be applied to the task flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("outcome target not found: {0}")]
    TargetNotFound(String),

    /// The instance to resume already completed, faulted or was cancelled.
    #[error("outcome target is terminal: {0}")]
    TargetTerminal(String),

    #[error("outcome dispatch failed: {0}")]
    Failed(String),
}
