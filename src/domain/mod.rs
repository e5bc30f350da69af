//! Domain types for the presswork orchestrator.
//!
//! This module contains the core data structures:
//! - WorkItem: A submitted link moving through the pipeline
//! - Edition: The shared aggregate that items contribute to
//! - Feedback: Editor notes that trigger edits of an edition
//! - Run: One recorded stage execution
//! - Events: The broker wire envelope and lifecycle payloads

pub mod edition;
pub mod events;
pub mod item;
pub mod run;

// Re-export commonly used types
pub use edition::{Edition, EditionContent, EditionError, EditionStatus, Feedback};
pub use events::{
    item_update_payload, run_complete_payload, run_start_payload, EventData, EventEnvelope,
    ItemSummary, PublishRequest, RunSummary, ITEM_UPDATE, PUBLISH_REQUEST, RUN_COMPLETE,
    RUN_START,
};
pub use item::{ItemStatus, WorkItem};
pub use run::{Run, RunStatus, Stage, Usage};
