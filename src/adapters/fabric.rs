//! Fabric-backed stages (review, draft, edit).
//!
//! Uses subprocess mode, calling the `fabric` CLI directly with the
//! stage input on stdin.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::{StageExecutor, StageInput, StageOutput};
use crate::domain::Stage;

/// Runs fabric patterns as subprocesses
#[derive(Debug, Clone)]
pub struct FabricRunner {
    binary_path: String,
}

impl Default for FabricRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricRunner {
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new() -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .output()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self { binary_path }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    pub fn binary_path(&self) -> &str {
        &self.binary_path
    }

    /// Spawn `fabric -p <pattern>`, pipe `input` to stdin and collect stdout
    pub async fn run(&self, pattern: &str, input: &str, step_timeout: Duration) -> Result<String> {
        let mut child = Command::new(&self.binary_path)
            .args(["-p", pattern])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn fabric process for pattern '{}'", pattern))?;

        // Feed stdin while draining stdout so neither pipe can stall the other.
        // Dropping the exchange on timeout drops the child, which kills it.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes()).await?;
                // Dropping stdin signals EOF
            }
            Ok::<_, std::io::Error>(())
        };
        let exchange = async {
            let (written, output) = tokio::join!(feed, child.wait_with_output());
            let output = output
                .with_context(|| format!("Failed to wait for fabric process for pattern '{}'", pattern))?;
            if let Err(e) = written {
                // The process may legitimately exit before reading everything
                if output.status.success() {
                    tracing::debug!(pattern, error = %e, "Fabric closed stdin early");
                } else {
                    return Err(anyhow::Error::new(e).context("Failed to write to fabric stdin"));
                }
            }
            Ok::<_, anyhow::Error>(output)
        };

        let output = timeout(step_timeout, exchange).await.with_context(|| {
            format!(
                "Fabric pattern '{}' timed out after {:?}",
                pattern, step_timeout
            )
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Fabric pattern '{}' failed with exit code {}: {}",
                pattern,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Fabric output is not valid UTF-8")?;
        if stdout.trim().is_empty() {
            anyhow::bail!("Fabric pattern '{}' produced no output", pattern);
        }

        Ok(stdout)
    }

    /// Check that fabric is available and can list patterns
    pub async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("-l")
            .output()
            .await
            .context("Failed to run fabric health check")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Fabric health check failed: {}", stderr);
        }

        Ok(())
    }
}

/// A stage that runs one fabric pattern over text derived from its input
pub struct PatternStage {
    stage: Stage,
    pattern: String,
    runner: Arc<FabricRunner>,
    timeout: Duration,
}

impl PatternStage {
    pub fn new(stage: Stage, pattern: impl Into<String>, runner: Arc<FabricRunner>, timeout: Duration) -> Self {
        Self {
            stage,
            pattern: pattern.into(),
            runner,
            timeout,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Text piped to the pattern for a given stage
pub fn pattern_input(stage: Stage, input: &StageInput) -> Result<String> {
    match stage {
        Stage::Review => {
            let item = input.item.as_ref().context("Review stage needs an item")?;
            item.content
                .clone()
                .filter(|c| !c.trim().is_empty())
                .with_context(|| format!("Item {} has no fetched content", item.id))
        }
        Stage::Draft => {
            let item = input.item.as_ref().context("Draft stage needs an item")?;
            let review = item
                .review
                .as_deref()
                .with_context(|| format!("Item {} has no review", item.id))?;
            let title = item.title.as_deref().unwrap_or(&item.url);
            Ok(format!("# {}\n\nSource: {}\n\n{}", title, item.url, review))
        }
        Stage::Edit => {
            let feedback = input.feedback.as_ref().context("Edit stage needs feedback")?;
            Ok(format!(
                "{}\n\n---\nEditor feedback:\n{}",
                input.edition.content.render(),
                feedback.text
            ))
        }
        Stage::Fetch | Stage::Publish => {
            anyhow::bail!("Stage '{}' does not run a fabric pattern", stage)
        }
    }
}

#[async_trait]
impl StageExecutor for PatternStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, input: &StageInput) -> Result<StageOutput> {
        let text = pattern_input(self.stage, input)?;
        let content = self.runner.run(&self.pattern, &text, self.timeout).await?;
        Ok(StageOutput::new(content.trim().to_string()))
    }
}
