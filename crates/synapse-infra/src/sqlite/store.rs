//! SQLite implementation of `InstanceStore`.
//!
//! Every aggregate is one row in `aggregates`, keyed by `(kind, id)`, with its
//! JSON document and an integer version. Saves are compare-and-set on the
//! version column; the writer pool has a single connection so the version
//! check and the write never interleave with another writer.

use chrono::Utc;
use sqlx::Row;
use synapse_core::repository::{Aggregate, AggregateKind, InstanceStore, Versioned, version_conflict};
use synapse_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `InstanceStore`.
#[derive(Clone)]
pub struct SqliteInstanceStore {
    pool: DatabasePool,
}

impl SqliteInstanceStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url).await.map_err(|e| {
            tracing::error!(database_url, error = %e, "failed to open instance store");
            RepositoryError::Connection
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn current_version(&self, kind: AggregateKind, key: &str) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT version FROM aggregates WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(key)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(version as u64)
            }
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Private Row type for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct AggregateRow {
    version: i64,
    document: String,
}

impl AggregateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            version: row.try_get("version")?,
            document: row.try_get("document")?,
        })
    }

    fn into_versioned<A: Aggregate>(self) -> Result<Versioned<A>, RepositoryError> {
        let value: A = serde_json::from_str(&self.document)
            .map_err(|e| RepositoryError::Serialization(format!("invalid {} document: {e}", A::KIND)))?;
        Ok(Versioned {
            version: self.version as u64,
            value,
        })
    }
}

// ---------------------------------------------------------------------------
// InstanceStore implementation
// ---------------------------------------------------------------------------

impl InstanceStore for SqliteInstanceStore {
    async fn get<A: Aggregate>(&self, key: &str) -> Result<Option<Versioned<A>>, RepositoryError> {
        let row = sqlx::query("SELECT version, document FROM aggregates WHERE kind = ? AND id = ?")
            .bind(A::KIND.as_str())
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => AggregateRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_versioned()
                .map(Some),
            None => Ok(None),
        }
    }

    async fn find<A, F>(&self, predicate: F) -> Result<Vec<Versioned<A>>, RepositoryError>
    where
        A: Aggregate,
        F: Fn(&A) -> bool + Send + Sync,
    {
        let rows = sqlx::query("SELECT version, document FROM aggregates WHERE kind = ? ORDER BY id")
            .bind(A::KIND.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut found = Vec::new();
        for row in &rows {
            let versioned: Versioned<A> = AggregateRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_versioned()?;
            if predicate(&versioned.value) {
                found.push(versioned);
            }
        }
        Ok(found)
    }

    async fn save<A: Aggregate>(&self, aggregate: &A, expected_version: u64) -> Result<u64, RepositoryError> {
        let key = aggregate.key();
        let document =
            serde_json::to_string(aggregate).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let next_version = expected_version + 1;

        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO aggregates (kind, id, version, document, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (kind, id) DO NOTHING",
            )
            .bind(A::KIND.as_str())
            .bind(&key)
            .bind(next_version as i64)
            .bind(&document)
            .bind(&now)
            .execute(&self.pool.writer)
            .await
        } else {
            sqlx::query(
                "UPDATE aggregates SET version = ?, document = ?, updated_at = ?
                 WHERE kind = ? AND id = ? AND version = ?",
            )
            .bind(next_version as i64)
            .bind(&document)
            .bind(&now)
            .bind(A::KIND.as_str())
            .bind(&key)
            .bind(expected_version as i64)
            .execute(&self.pool.writer)
            .await
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            let actual = self.current_version(A::KIND, &key).await?;
            tracing::debug!(kind = %A::KIND, id = %key, expected_version, actual, "version conflict");
            return Err(version_conflict(A::KIND, &key, expected_version, actual));
        }
        Ok(next_version)
    }

    async fn delete<A: Aggregate>(&self, key: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM aggregates WHERE kind = ? AND id = ?")
            .bind(A::KIND.as_str())
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}
