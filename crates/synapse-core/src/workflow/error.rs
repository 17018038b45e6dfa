use synapse_types::error::RepositoryError;
use thiserror::Error;

use super::definition::DefinitionError;
use crate::expression::ExpressionError;

/// Errors returned by the task flow engine.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed definition (e.g. unresolvable flow target). Fatal, not retried.
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// An illegal state transition. Signals a caller or race bug.
    #[error("unexpected state: cannot move {kind} '{id}' from {from} to {to}")]
    UnexpectedState {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A task reference that is not among the tasks ready to run.
    #[error("task '{0}' is not scheduled to run")]
    NotScheduled(String),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] ExpressionError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl FlowError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FlowError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Only optimistic-concurrency conflicts may be retried, against a
    /// freshly reloaded aggregate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Repository(e) if e.is_version_conflict())
    }
}
