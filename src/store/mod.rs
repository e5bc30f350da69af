//! Document store contract.
//!
//! The orchestrator only needs four primitives from its database:
//! - point read returning the document and its version tag
//! - version-conditioned write that reports a precondition conflict
//! - filtered, ordered query
//! - change-feed read with an optional continuation cursor
//!
//! Backends: `MemoryStore` (tests, single process) and `SqliteStore`
//! (shared file, safe across worker processes).

pub mod memory;
pub mod query;
pub mod repositories;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use query::{Filter, Order, Query};
pub use repositories::{
    Checkpoint, CheckpointRepository, Document, EditionRepository, FeedbackRepository,
    ItemRepository, Repository, RunRepository,
};
pub use sqlite::SqliteStore;

/// Container holding work items
pub const ITEMS: &str = "items";
/// Container holding editions
pub const EDITIONS: &str = "editions";
/// Container holding editor feedback
pub const FEEDBACK: &str = "feedback";
/// Container holding stage runs
pub const RUNS: &str = "runs";
/// Container holding change-feed checkpoints
pub const CHECKPOINTS: &str = "checkpoints";

/// Opaque version tag of a stored document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(pub String);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub doc: T,
    pub version: Version,
}

/// One batch read from a container's change feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Latest version of each document changed since the cursor, in feed order
    pub items: Vec<Value>,

    /// Continuation to pass on the next read, if the store reported one
    pub cursor: Option<String>,
}

/// Document store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document changed since it was read
    #[error("Precondition failed: {container}/{id} was modified concurrently")]
    PreconditionFailed { container: String, id: String },

    #[error("Document not found: {container}/{id}")]
    NotFound { container: String, id: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid change feed cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Trait for document store backends
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Read a document and its current version
    async fn read(&self, container: &str, id: &str) -> Result<Option<Versioned<Value>>, StoreError>;

    /// Create or overwrite a document unconditionally
    async fn upsert(&self, container: &str, id: &str, doc: Value) -> Result<Version, StoreError>;

    /// Overwrite a document only if it is still at `if_match`.
    ///
    /// Returns `StoreError::PreconditionFailed` when another writer got there first.
    async fn replace(
        &self,
        container: &str,
        id: &str,
        doc: Value,
        if_match: &Version,
    ) -> Result<Version, StoreError>;

    /// Run a filtered query; tombstoned documents are excluded unless asked for
    async fn query(&self, container: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Read up to `max_items` changes after `cursor` (from the start when `None`)
    async fn read_changes(
        &self,
        container: &str,
        cursor: Option<&str>,
        max_items: usize,
    ) -> Result<ChangeBatch, StoreError>;

    /// Verify the store is reachable
    async fn health_check(&self) -> Result<(), StoreError>;
}
