//! presswork - Event-driven content pipeline orchestrator
//!
//! Drives submitted links through fetch, review, draft, edit and publish
//! stages across documents in a shared store, coordinated across any
//! number of worker processes.
//!
//! # Architecture
//!
//! - A change-feed poller discovers new work in the document store
//! - A claim protocol (optimistic concurrency + time-boxed marker)
//!   guarantees at most one active processor per item
//! - A per-edition lock serializes mutation of the shared edition document
//! - Stages run under a bounded retry policy and every attempt is recorded
//!   as a Run
//! - Lifecycle events and commands travel over a message broker
//!
//! # Modules
//!
//! - `adapters`: Stage executors (HTTP fetch, Fabric patterns, file publish)
//! - `broker`: Message broker contract and backends
//! - `core`: Orchestration logic (claims, locks, retry, change feed)
//! - `domain`: Data structures (WorkItem, Edition, Run, EventEnvelope)
//! - `events`: Publisher and consumers bridging the broker
//! - `store`: Document store contract, backends and repositories
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a link to an edition
//! presswork submit https://example.com/post --edition ed-1
//!
//! # Run a worker
//! presswork worker
//!
//! # Request publication
//! presswork publish ed-1
//! ```

pub mod adapters;
pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod events;
pub mod store;

// Re-export main types at crate root for convenience
pub use crate::core::{ClaimCoordinator, KeyedLockRegistry, PipelineOrchestrator, RetryExecutor};
pub use crate::domain::{Edition, EventEnvelope, ItemStatus, Run, RunStatus, Stage, WorkItem};
pub use crate::store::{DocumentStore, MemoryStore, SqliteStore};
