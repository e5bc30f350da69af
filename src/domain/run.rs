//! Stage runs.
//!
//! A Run records one stage execution: created when the stage starts,
//! finalized exactly once when the retry-wrapped attempt resolves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record of one stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: String,

    /// Stage that was executed
    pub stage: Stage,

    /// Item, feedback or edition id that caused this run
    pub trigger_id: String,

    /// Edition the run belongs to
    pub aggregate_id: String,

    /// Current status of the run
    pub status: RunStatus,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Stage output summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Token usage reported by the stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Last error if the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Attempts consumed by the retry executor
    #[serde(default)]
    pub attempts: u32,
}

impl Run {
    /// Start a new run
    pub fn start(stage: Stage, trigger_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stage,
            trigger_id: trigger_id.into(),
            aggregate_id: aggregate_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            output: None,
            usage: None,
            error: None,
            attempts: 0,
        }
    }

    /// Finalize as completed. No-op (returns false) if already finished.
    pub fn complete(
        &mut self,
        output: serde_json::Value,
        usage: Option<Usage>,
        attempts: u32,
    ) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.output = Some(output);
        self.usage = usage;
        self.attempts = attempts;
        true
    }

    /// Finalize as failed. No-op (returns false) if already finished.
    pub fn fail(&mut self, error: impl Into<String>, attempts: u32) -> bool {
        if self.is_finished() {
            return false;
        }
        let error = error.into();
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.output = Some(serde_json::json!({ "error": error }));
        self.error = Some(error);
        self.attempts = attempts;
        true
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Check if the run has completed (successfully or not)
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The closed set of pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Review,
    Draft,
    Edit,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Review,
        Stage::Draft,
        Stage::Edit,
        Stage::Publish,
    ];

    /// Stages run for a newly claimed item, in order
    pub const ITEM_PIPELINE: [Stage; 3] = [Stage::Fetch, Stage::Review, Stage::Draft];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Review => "review",
            Self::Draft => "draft",
            Self::Edit => "edit",
            Self::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build a usage record, deriving the total when missing.
    ///
    /// All-zero counts mean the stage reported nothing.
    pub fn normalize(input_tokens: u64, output_tokens: u64, total_tokens: Option<u64>) -> Option<Self> {
        let total_tokens = match total_tokens {
            Some(total) if total > 0 => total,
            _ => input_tokens + output_tokens,
        };
        if input_tokens == 0 && output_tokens == 0 && total_tokens == 0 {
            return None;
        }
        Some(Self {
            input_tokens,
            output_tokens,
            total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_creation() {
        let run = Run::start(Stage::Fetch, "l-1", "ed-1");

        assert_eq!(run.stage, Stage::Fetch);
        assert_eq!(run.trigger_id, "l-1");
        assert!(run.is_running());
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_run_finalizes_once() {
        let mut run = Run::start(Stage::Review, "l-1", "ed-1");

        assert!(run.fail("boom", 2));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));

        // A finished run is never rewritten
        assert!(!run.complete(serde_json::json!("late"), None, 3));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempts, 2);
    }

    #[test]
    fn test_usage_total_derived_when_missing() {
        let usage = Usage::normalize(80, 20, None).unwrap();
        assert_eq!(usage.total_tokens, 100);

        let usage = Usage::normalize(500, 120, Some(620)).unwrap();
        assert_eq!(usage.total_tokens, 620);
    }

    #[test]
    fn test_usage_all_zero_is_none() {
        assert_eq!(Usage::normalize(0, 0, None), None);
        assert_eq!(Usage::normalize(0, 0, Some(0)), None);
    }

    #[test]
    fn test_stage_serialization() {
        let json = serde_json::to_string(&Stage::Publish).unwrap();
        assert_eq!(json, "\"publish\"");
    }
}
