//! Core orchestration logic.
//!
//! This module contains:
//! - ClaimCoordinator: at-most-one active processor per work item
//! - KeyedLockRegistry: per-edition mutual exclusion
//! - RetryExecutor: bounded retries with exponential backoff
//! - ChangeFeedProcessor: change stream polling and dispatch
//! - PipelineOrchestrator: the per-item state machine

pub mod change_feed;
pub mod claim;
pub(crate) mod lifecycle;
pub mod locks;
pub mod orchestrator;
pub mod retry;
pub mod stages;

// Re-export commonly used types
pub use change_feed::{ChangeFeedProcessor, ChangeHandler, CursorStore, FeedConfig, FeedStream};
pub use claim::{is_active_claim, Claim, ClaimCoordinator, RejectReason, DEFAULT_CLAIM_TTL};
pub use locks::{AggregateGuard, KeyedLockRegistry};
pub use orchestrator::{FeedbackChanges, ItemChanges, OrchestratorConfig, PipelineOrchestrator};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use stages::{StageError, StageExecutor, StageInput, StageOutput, StageRegistry};
