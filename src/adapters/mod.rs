//! Stage executors backed by external systems.
//!
//! - `fetch`: HTTP download of the item URL
//! - `fabric`: Fabric patterns for review, draft and edit
//! - `publish`: writes the finished edition to disk

pub mod fabric;
pub mod fetch;
pub mod publish;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::StageSettings;
use crate::core::{StageExecutor, StageRegistry};
use crate::domain::Stage;

pub use fabric::{FabricRunner, PatternStage};
pub use fetch::FetchStage;
pub use publish::PublishStage;

/// Build the production dispatch table from settings
pub fn default_registry(settings: &StageSettings, output_dir: &Path) -> Result<StageRegistry> {
    let timeout = Duration::from_secs(settings.timeout_seconds);
    let runner = Arc::new(match settings.fabric_binary {
        Some(ref binary) => FabricRunner::with_binary_path(binary.clone()),
        None => FabricRunner::new(),
    });

    let executors: Vec<Arc<dyn StageExecutor>> = vec![
        Arc::new(FetchStage::new(timeout, settings.fetch_max_bytes)?),
        Arc::new(PatternStage::new(
            Stage::Review,
            settings.review_pattern.clone(),
            runner.clone(),
            timeout,
        )),
        Arc::new(PatternStage::new(
            Stage::Draft,
            settings.draft_pattern.clone(),
            runner.clone(),
            timeout,
        )),
        Arc::new(PatternStage::new(
            Stage::Edit,
            settings.edit_pattern.clone(),
            runner,
            timeout,
        )),
        Arc::new(PublishStage::new(output_dir)),
    ];

    Ok(StageRegistry::new(executors)?)
}
