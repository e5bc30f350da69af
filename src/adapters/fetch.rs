//! HTTP fetch stage.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::{StageExecutor, StageInput, StageOutput};
use crate::domain::Stage;

/// Downloads the item's URL, capped at `max_bytes`
pub struct FetchStage {
    client: reqwest::Client,
    max_bytes: usize,
}

impl FetchStage {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("presswork/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, max_bytes })
    }

    async fn download(&self, url: &str) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Fetch of {} failed ({})", url, status);
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?
        {
            let room = self.max_bytes.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= self.max_bytes {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Contents of the first `<title>` element, whitespace collapsed
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;

    let title = html[start..end].split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

#[async_trait]
impl StageExecutor for FetchStage {
    fn stage(&self) -> Stage {
        Stage::Fetch
    }

    async fn execute(&self, input: &StageInput) -> Result<StageOutput> {
        let item = input.item.as_ref().context("Fetch stage needs an item")?;
        let body = self.download(&item.url).await?;
        if body.trim().is_empty() {
            anyhow::bail!("Fetch of {} returned an empty body", item.url);
        }

        let title = extract_title(&body);
        Ok(StageOutput::new(body).with_title(title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title() {
        let html = "<html><head><TITLE lang=\"en\">\n  Hello   World </TITLE></head></html>";
        assert_eq!(extract_title(html), Some("Hello World".to_string()));
    }

    #[test]
    fn test_extract_title_missing_or_empty() {
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
        assert_eq!(extract_title("<title>  </title>"), None);
        assert_eq!(extract_title("<title>unterminated"), None);
    }

    #[tokio::test]
    async fn test_fetch_requires_item() {
        let stage = FetchStage::new(Duration::from_secs(1), 1024).unwrap();
        let input = StageInput::for_edition(crate::domain::Edition::new("ed-1"));
        assert!(stage.execute(&input).await.is_err());
    }
}
