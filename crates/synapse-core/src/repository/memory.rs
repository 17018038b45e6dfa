//! In-memory `InstanceStore` backed by `dashmap`.
//!
//! Documents are kept as `serde_json::Value` so the store behaves like the
//! durable implementations: every `get` hands back an independent copy.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use synapse_types::error::RepositoryError;

use super::{Aggregate, AggregateKind, InstanceStore, Versioned, version_conflict};

type Slot = (AggregateKind, String);

/// Process-local instance store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryInstanceStore {
    entries: Arc<DashMap<Slot, (u64, Value)>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored aggregates of a kind.
    pub fn count(&self, kind: AggregateKind) -> usize {
        self.entries.iter().filter(|e| e.key().0 == kind).count()
    }
}

fn decode<A: Aggregate>(version: u64, document: &Value) -> Result<Versioned<A>, RepositoryError> {
    let value = serde_json::from_value(document.clone())
        .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
    Ok(Versioned { version, value })
}

impl InstanceStore for MemoryInstanceStore {
    async fn get<A: Aggregate>(&self, key: &str) -> Result<Option<Versioned<A>>, RepositoryError> {
        match self.entries.get(&(A::KIND, key.to_string())) {
            Some(entry) => {
                let (version, document) = entry.value();
                decode(*version, document).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn find<A, F>(&self, predicate: F) -> Result<Vec<Versioned<A>>, RepositoryError>
    where
        A: Aggregate,
        F: Fn(&A) -> bool + Send + Sync,
    {
        let mut rows: Vec<(String, u64, Value)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == A::KIND)
            .map(|entry| {
                let (version, document) = entry.value();
                (entry.key().1.clone(), *version, document.clone())
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut found = Vec::new();
        for (_, version, document) in rows {
            let versioned: Versioned<A> = decode(version, &document)?;
            if predicate(&versioned.value) {
                found.push(versioned);
            }
        }
        Ok(found)
    }

    async fn save<A: Aggregate>(&self, aggregate: &A, expected_version: u64) -> Result<u64, RepositoryError> {
        let key = aggregate.key();
        let document =
            serde_json::to_value(aggregate).map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        match self.entries.entry((A::KIND, key.clone())) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().0;
                if actual != expected_version {
                    return Err(version_conflict(A::KIND, &key, expected_version, actual));
                }
                let version = actual + 1;
                occupied.insert((version, document));
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(version_conflict(A::KIND, &key, expected_version, 0));
                }
                vacant.insert((1, document));
                Ok(1)
            }
        }
    }

    async fn delete<A: Aggregate>(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.entries.remove(&(A::KIND, key.to_string())).is_some())
    }
}
