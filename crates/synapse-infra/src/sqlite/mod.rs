//! SQLite persistence for the Synapse engines.

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteInstanceStore;
