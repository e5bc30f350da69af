//! Configuration for presswork workers and tools.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PRESSWORK_HOME, PRESSWORK_STORE, PRESSWORK_BROKER)
//! 2. Config file (.presswork/config.yaml)
//! 3. Defaults (~/.presswork)
//!
//! Config file discovery:
//! - Searches current directory and parents for .presswork/config.yaml
//! - Paths in config file are relative to the directory holding .presswork/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{FeedConfig, OrchestratorConfig, RetryPolicy};
use crate::events::{ConsumerConfig, ReconnectBackoff};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub version: Option<String>,
    /// Engine state directory
    pub home: Option<String>,
    pub store: StoreFileConfig,
    pub broker: BrokerSettings,
    pub feed: FeedSettings,
    pub claim: ClaimSettings,
    pub retry: RetryPolicy,
    pub consumer: ConsumerSettings,
    pub stages: StageSettings,
    pub shutdown_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreFileConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker database file; no broker when unset
    pub path: Option<PathBuf>,
    pub event_topic: String,
    pub command_topic: String,
    pub event_subscription: String,
    pub command_subscription: String,
    pub max_delivery_count: u32,
    pub lock_duration_seconds: u64,
    /// Undrained and dead-lettered messages older than this are purged at worker start
    pub message_ttl_hours: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            path: None,
            event_topic: "pipeline-events".to_string(),
            command_topic: "pipeline-commands".to_string(),
            event_subscription: "web-consumer".to_string(),
            command_subscription: "worker-consumer".to_string(),
            max_delivery_count: 10,
            lock_duration_seconds: 60,
            message_ttl_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub poll_interval_ms: u64,
    pub max_batch: usize,
    /// Persist cursors so a restarted worker resumes instead of re-scanning
    pub checkpoint: bool,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_batch: 100,
            checkpoint: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimSettings {
    pub ttl_seconds: u64,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self { ttl_seconds: 900 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_messages: usize,
    pub max_wait_ms: u64,
    pub dedupe_capacity: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_messages: 10,
            max_wait_ms: 5000,
            dedupe_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Fabric binary; auto-detected when unset
    pub fabric_binary: Option<String>,
    pub review_pattern: String,
    pub draft_pattern: String,
    pub edit_pattern: String,
    pub timeout_seconds: u64,
    pub fetch_max_bytes: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            fabric_binary: None,
            review_pattern: "extract_wisdom".to_string(),
            draft_pattern: "summarize".to_string(),
            edit_pattern: "improve_writing".to_string(),
            timeout_seconds: 300,
            fetch_max_bytes: 1_048_576, // 1MB
            output_dir: None,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store_path: PathBuf,
    pub broker: BrokerSettings,
    pub feed: FeedSettings,
    pub claim: ClaimSettings,
    pub retry: RetryPolicy,
    pub consumer: ConsumerSettings,
    pub stages: StageSettings,
    /// Where the publish stage writes editions
    pub output_dir: PathBuf,
    pub shutdown_grace: Duration,
}

impl ResolvedConfig {
    /// Load from the discovered config file and the process environment
    pub fn load() -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".presswork");

        let file = match find_config_file() {
            Some(path) => {
                let config = load_config_file(&path)?;
                Some((path, config))
            }
            None => None,
        };

        Ok(resolve(file, default_home, |key| std::env::var(key).ok()))
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            poll_interval: Duration::from_millis(self.feed.poll_interval_ms),
            max_batch: self.feed.max_batch,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            claim_ttl: Duration::from_secs(self.claim.ttl_seconds),
            retry: self.retry.clone(),
        }
    }

    pub fn consumer_config(&self, topic: &str, subscription: &str) -> ConsumerConfig {
        ConsumerConfig {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            max_messages: self.consumer.max_messages,
            max_wait: Duration::from_millis(self.consumer.max_wait_ms),
            backoff: ReconnectBackoff::new(
                Duration::from_millis(self.consumer.base_delay_ms),
                Duration::from_millis(self.consumer.max_delay_ms),
            ),
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".presswork").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Merge file settings, environment overrides and defaults
fn resolve<E>(file: Option<(PathBuf, ConfigFile)>, default_home: PathBuf, env: E) -> ResolvedConfig
where
    E: Fn(&str) -> Option<String>,
{
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path), config),
        None => (None, ConfigFile::default()),
    };

    // Base directory is the parent of .presswork/ (i.e., grandparent of config.yaml)
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let from_file = |p: &str| resolve_path(&base_dir, Path::new(p));

    let home = env("PRESSWORK_HOME")
        .map(PathBuf::from)
        .or_else(|| config.home.as_deref().map(from_file))
        .unwrap_or(default_home);

    let store_path = env("PRESSWORK_STORE")
        .map(PathBuf::from)
        .or_else(|| config.store.path.as_deref().map(from_file))
        .unwrap_or_else(|| home.join("store.db"));

    let mut broker = config.broker;
    let file_broker = broker.path.take();
    broker.path = env("PRESSWORK_BROKER")
        .map(PathBuf::from)
        .or_else(|| file_broker.map(|p| resolve_path(&base_dir, &p)));

    let output_dir = config
        .stages
        .output_dir
        .as_deref()
        .map(|p| resolve_path(&base_dir, p))
        .unwrap_or_else(|| home.join("published"));

    ResolvedConfig {
        home,
        config_file,
        store_path,
        broker,
        feed: config.feed,
        claim: config.claim,
        retry: config.retry,
        consumer: config.consumer,
        stages: config.stages,
        output_dir,
        shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds.unwrap_or(10)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/home/user/.presswork");
        let config = resolve(None, home.clone(), no_env);

        assert_eq!(config.store_path, home.join("store.db"));
        assert_eq!(config.output_dir, home.join("published"));
        assert!(config.broker.path.is_none());
        assert_eq!(config.claim.ttl_seconds, 900);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.consumer.dedupe_capacity, 10_000);
        assert_eq!(config.feed_config().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".presswork");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
store:
  path: data/store.db
broker:
  path: data/broker.db
  max_delivery_count: 3
feed:
  poll_interval_ms: 250
  checkpoint: true
retry:
  max_attempts: 4
stages:
  review_pattern: analyze_claims
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));
        assert_eq!(parsed.broker.event_topic, "pipeline-events");

        let config = resolve(Some((config_path, parsed)), PathBuf::from("/unused"), no_env);
        assert_eq!(config.store_path, temp.path().join("data/store.db"));
        assert_eq!(config.broker.path, Some(temp.path().join("data/broker.db")));
        assert_eq!(config.broker.max_delivery_count, 3);
        assert!(config.feed.checkpoint);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.stages.review_pattern, "analyze_claims");
        assert_eq!(config.stages.draft_pattern, "summarize");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            store: StoreFileConfig {
                path: Some("/from/file.db".to_string()),
            },
            ..Default::default()
        };
        let env = |key: &str| match key {
            "PRESSWORK_STORE" => Some("/from/env.db".to_string()),
            "PRESSWORK_BROKER" => Some("/from/env-broker.db".to_string()),
            _ => None,
        };

        let config = resolve(
            Some((PathBuf::from("/project/.presswork/config.yaml"), file)),
            PathBuf::from("/home/user/.presswork"),
            env,
        );
        assert_eq!(config.store_path, PathBuf::from("/from/env.db"));
        assert_eq!(config.broker.path, Some(PathBuf::from("/from/env-broker.db")));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, Path::new("./subdir")),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
