//! Stage executor interface and the startup dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Edition, Feedback, Stage, Usage, WorkItem};

/// Everything a stage may read
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Triggering item (item pipeline stages only)
    pub item: Option<WorkItem>,

    pub edition: Edition,

    /// Triggering feedback (edit stage only)
    pub feedback: Option<Feedback>,
}

impl StageInput {
    pub fn for_item(item: WorkItem, edition: Edition) -> Self {
        Self {
            item: Some(item),
            edition,
            feedback: None,
        }
    }

    pub fn for_feedback(feedback: Feedback, edition: Edition) -> Self {
        Self {
            item: None,
            edition,
            feedback: Some(feedback),
        }
    }

    pub fn for_edition(edition: Edition) -> Self {
        Self {
            item: None,
            edition,
            feedback: None,
        }
    }
}

/// What a stage produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub text: String,

    /// Title discovered by the stage, if any
    pub title: Option<String>,

    pub usage: Option<Usage>,
}

impl StageOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

/// Trait for stage executors
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Stage this executor implements
    fn stage(&self) -> Stage;

    /// Run the stage once; the caller handles retries
    async fn execute(&self, input: &StageInput) -> Result<StageOutput>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("No executor registered for stage '{0}'")]
    Missing(Stage),

    #[error("Stage '{0}' registered twice")]
    Duplicate(Stage),
}

/// Executor per stage, complete for the closed stage set
#[derive(Clone)]
pub struct StageRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    /// Build the table; every stage must have exactly one executor
    pub fn new(executors: Vec<Arc<dyn StageExecutor>>) -> Result<Self, StageError> {
        let mut table = HashMap::new();
        for executor in executors {
            let stage = executor.stage();
            if table.insert(stage, executor).is_some() {
                return Err(StageError::Duplicate(stage));
            }
        }
        if let Some(missing) = Stage::ALL.iter().find(|s| !table.contains_key(*s)) {
            return Err(StageError::Missing(*missing));
        }
        Ok(Self { executors: table })
    }

    pub fn get(&self, stage: Stage) -> Result<&Arc<dyn StageExecutor>, StageError> {
        self.executors.get(&stage).ok_or(StageError::Missing(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(Stage);

    #[async_trait]
    impl StageExecutor for Echo {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn execute(&self, _input: &StageInput) -> Result<StageOutput> {
            Ok(StageOutput::new(self.0.as_str()))
        }
    }

    fn all() -> Vec<Arc<dyn StageExecutor>> {
        Stage::ALL
            .iter()
            .map(|s| Arc::new(Echo(*s)) as Arc<dyn StageExecutor>)
            .collect()
    }

    #[test]
    fn test_registry_requires_every_stage() {
        let mut executors = all();
        executors.retain(|e| e.stage() != Stage::Edit);
        assert_eq!(
            StageRegistry::new(executors).unwrap_err(),
            StageError::Missing(Stage::Edit)
        );
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut executors = all();
        executors.push(Arc::new(Echo(Stage::Fetch)));
        assert_eq!(
            StageRegistry::new(executors).unwrap_err(),
            StageError::Duplicate(Stage::Fetch)
        );
    }

    #[tokio::test]
    async fn test_dispatch_by_stage() {
        let registry = StageRegistry::new(all()).unwrap();
        let input = StageInput::for_edition(Edition::new("ed-1"));
        let output = registry.get(Stage::Draft).unwrap().execute(&input).await.unwrap();
        assert_eq!(output.text, "draft");
    }
}
