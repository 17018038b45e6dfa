//! Instance store trait definition (port).
//!
//! The store persists the engines' aggregates as versioned documents. The
//! infrastructure layer (synapse-infra) implements it with SQLite; `memory`
//! provides a `dashmap`-backed implementation for tests and embedded use.
//! The core crate never depends on any specific storage technology.

pub mod memory;

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use synapse_types::correlation::Correlation;
use synapse_types::error::RepositoryError;
use synapse_types::instance::{TaskInstance, WorkflowInstance};
use synapse_types::workflow::WorkflowDefinition;

pub use memory::MemoryInstanceStore;

/// Aggregate families held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKind {
    WorkflowDefinition,
    WorkflowInstance,
    TaskInstance,
    Correlation,
}

impl AggregateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateKind::WorkflowDefinition => "workflow_definition",
            AggregateKind::WorkflowInstance => "workflow_instance",
            AggregateKind::TaskInstance => "task_instance",
            AggregateKind::Correlation => "correlation",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document the store can persist.
pub trait Aggregate: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: AggregateKind;

    /// Identity of the aggregate within its kind.
    fn key(&self) -> String;
}

impl Aggregate for WorkflowDefinition {
    const KIND: AggregateKind = AggregateKind::WorkflowDefinition;

    fn key(&self) -> String {
        self.reference().to_string()
    }
}

impl Aggregate for WorkflowInstance {
    const KIND: AggregateKind = AggregateKind::WorkflowInstance;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Aggregate for TaskInstance {
    const KIND: AggregateKind = AggregateKind::TaskInstance;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Aggregate for Correlation {
    const KIND: AggregateKind = AggregateKind::Correlation;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// An aggregate together with the version it was loaded at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Durable key/value store of versioned aggregates.
///
/// Every mutation is a read-modify-write guarded by an optimistic version
/// check: `save(a, 0)` creates, `save(a, v)` replaces only if the stored
/// version is still `v`. Any mismatch is `RepositoryError::VersionConflict`
/// and is never retried here.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync {
    /// Load one aggregate by key.
    fn get<A: Aggregate>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Versioned<A>>, RepositoryError>> + Send;

    /// Load every aggregate of a kind that satisfies `predicate`, ordered by key.
    fn find<A, F>(
        &self,
        predicate: F,
    ) -> impl std::future::Future<Output = Result<Vec<Versioned<A>>, RepositoryError>> + Send
    where
        A: Aggregate,
        F: Fn(&A) -> bool + Send + Sync;

    /// Persist an aggregate, returning its new version.
    fn save<A: Aggregate>(
        &self,
        aggregate: &A,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Delete an aggregate. Returns `true` if it existed.
    fn delete<A: Aggregate>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Build the conflict error for a failed optimistic save.
pub fn version_conflict(kind: AggregateKind, key: &str, expected: u64, actual: u64) -> RepositoryError {
    RepositoryError::VersionConflict {
        kind: kind.to_string(),
        id: key.to_string(),
        expected,
        actual,
    }
}
