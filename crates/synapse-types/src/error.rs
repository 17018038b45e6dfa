use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by the store trait in synapse-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Optimistic concurrency violation. Callers reload and retry.
    #[error("version conflict on {kind} '{id}': expected version {expected}, found {actual}")]
    VersionConflict {
        kind: String,
        id: String,
        expected: u64,
        actual: u64,
    },
}

impl RepositoryError {
    /// Whether the failed operation may succeed against a freshly reloaded aggregate.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, RepositoryError::VersionConflict { .. })
    }
}

/// Structured error recorded on faulted tasks and workflow instances.
///
/// Follows the problem-details shape (`type`, `title`, `status`, `detail`)
/// so it can be replayed verbatim through an external API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// URI identifying the kind of problem.
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Short, human-readable summary.
    pub title: String,
    /// Status code associated with the problem.
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Reference to the task that raised the problem (task reference path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Well-known problem type URIs.
pub mod problem_types {
    pub const CONFIGURATION: &str = "https://synapse.io/errors/types/configuration";
    pub const VALIDATION: &str = "https://synapse.io/errors/types/validation";
    pub const EXPRESSION: &str = "https://synapse.io/errors/types/expression";
    pub const RUNTIME: &str = "https://synapse.io/errors/types/runtime";
    pub const TIMEOUT: &str = "https://synapse.io/errors/types/timeout";
    pub const COMMUNICATION: &str = "https://synapse.io/errors/types/communication";
}

impl ProblemDetails {
    pub fn new(problem_type: impl Into<String>, title: impl Into<String>, status: u16) -> Self {
        Self {
            problem_type: problem_type.into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// A runtime failure reported by a task handler.
    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::new(problem_types::RUNTIME, "Runtime Error", 500).with_detail(detail)
    }

    /// A workflow definition that cannot be executed.
    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(problem_types::CONFIGURATION, "Configuration Error", 400).with_detail(detail)
    }

    /// An expression that failed to evaluate.
    pub fn expression(detail: impl Into<String>) -> Self {
        Self::new(problem_types::EXPRESSION, "Expression Error", 400).with_detail(detail)
    }

    /// A task that exceeded its allotted time.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(problem_types::TIMEOUT, "Timeout", 408).with_detail(detail)
    }
}

impl std::fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({}): {}", self.title, self.status, detail),
            None => write!(f, "{} ({})", self.title, self.status),
        }
    }
}
