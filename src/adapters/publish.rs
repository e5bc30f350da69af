//! Publish stage: writes the rendered edition to disk.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::{StageExecutor, StageInput, StageOutput};
use crate::domain::Stage;

pub struct PublishStage {
    output_dir: PathBuf,
}

impl PublishStage {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl StageExecutor for PublishStage {
    fn stage(&self) -> Stage {
        Stage::Publish
    }

    /// Output text is the written file's path
    async fn execute(&self, input: &StageInput) -> Result<StageOutput> {
        let edition = &input.edition;
        if edition.content.is_empty() {
            anyhow::bail!("Edition {} has no content to publish", edition.id);
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let path = self.output_dir.join(format!("{}.md", edition.id));
        let document = format!("# {}\n\n{}\n", edition.id, edition.content.render());
        tokio::fs::write(&path, document)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(StageOutput::new(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Edition;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_rendered_edition() {
        let temp = TempDir::new().unwrap();
        let stage = PublishStage::new(temp.path().join("out"));

        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "first".to_string()).unwrap();

        let output = stage.execute(&StageInput::for_edition(edition)).await.unwrap();
        let written = std::fs::read_to_string(&output.text).unwrap();
        assert_eq!(written, "# ed-1\n\nfirst\n");
    }

    #[tokio::test]
    async fn test_empty_edition_is_rejected() {
        let temp = TempDir::new().unwrap();
        let stage = PublishStage::new(temp.path());
        let input = StageInput::for_edition(Edition::new("ed-1"));
        assert!(stage.execute(&input).await.is_err());
    }
}
