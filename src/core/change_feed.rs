//! Change-feed polling.
//!
//! Each stream polls one container's change feed on its own task. Within a
//! stream documents are handed to the handler one at a time in feed order.
//! The stream's cursor only moves after a batch was retrieved and handled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::store::{Checkpoint, CheckpointRepository, DocumentStore, StoreError};

use super::lifecycle::{sleep_or_shutdown, Background};

/// Receives documents from a change stream
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, doc: Value) -> anyhow::Result<()>;
}

/// One tracked change stream
#[derive(Clone)]
pub struct FeedStream {
    pub name: String,
    pub container: String,
    pub handler: Arc<dyn ChangeHandler>,
}

impl FeedStream {
    pub fn new(
        name: impl Into<String>,
        container: impl Into<String>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            container: container.into(),
            handler,
        }
    }
}

/// Polling settings
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub poll_interval: Duration,
    pub max_batch: usize,
    pub shutdown_grace: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_batch: 100,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Continuation cursors per stream.
///
/// Always held in memory; optionally mirrored to the checkpoints container
/// so a restarted worker resumes instead of re-scanning.
#[derive(Default)]
pub struct CursorStore {
    cursors: Mutex<HashMap<String, String>>,
    checkpoints: Option<CheckpointRepository>,
}

impl CursorStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn durable(checkpoints: CheckpointRepository) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            checkpoints: Some(checkpoints),
        }
    }

    pub async fn get(&self, stream: &str) -> Option<String> {
        if let Some(cursor) = self.cursors.lock().await.get(stream) {
            return Some(cursor.clone());
        }

        let checkpoints = self.checkpoints.as_ref()?;
        match checkpoints.get(stream).await {
            Ok(Some(checkpoint)) => {
                self.cursors
                    .lock()
                    .await
                    .insert(stream.to_string(), checkpoint.cursor.clone());
                Some(checkpoint.cursor)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(stream, error = %e, "Failed to load checkpoint, starting from the beginning");
                None
            }
        }
    }

    pub async fn set(&self, stream: &str, cursor: String) {
        let changed = {
            let mut cursors = self.cursors.lock().await;
            cursors.insert(stream.to_string(), cursor.clone()).as_ref() != Some(&cursor)
        };

        if let (true, Some(checkpoints)) = (changed, self.checkpoints.as_ref()) {
            let checkpoint = Checkpoint {
                id: stream.to_string(),
                cursor,
                updated_at: Utc::now(),
            };
            if let Err(e) = checkpoints.save(&checkpoint).await {
                warn!(stream, error = %e, "Failed to persist checkpoint");
            }
        }
    }
}

/// Polls change streams and dispatches documents to their handlers
pub struct ChangeFeedProcessor {
    store: Arc<dyn DocumentStore>,
    streams: Vec<Arc<FeedStream>>,
    cursors: Arc<CursorStore>,
    config: FeedConfig,
    background: Mutex<Background>,
}

impl ChangeFeedProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        streams: Vec<FeedStream>,
        cursors: CursorStore,
        config: FeedConfig,
    ) -> Self {
        Self {
            store,
            streams: streams.into_iter().map(Arc::new).collect(),
            cursors: Arc::new(cursors),
            config,
            background: Mutex::new(Background::default()),
        }
    }

    /// Start polling every stream. No-op if already running.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        let started = background.start(|shutdown| {
            self.streams
                .iter()
                .map(|stream| {
                    let poller = StreamPoller {
                        store: Arc::clone(&self.store),
                        stream: Arc::clone(stream),
                        cursors: Arc::clone(&self.cursors),
                        max_batch: self.config.max_batch,
                    };
                    let interval = self.config.poll_interval;
                    let shutdown = shutdown.clone();
                    tokio::spawn(poller.run(interval, shutdown))
                })
                .collect()
        });
        if started {
            info!(streams = self.streams.len(), "Change feed processor started");
        }
    }

    /// Stop polling and wait for the stream tasks. No-op if not running.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        if background.stop("change-feed", self.config.shutdown_grace).await {
            info!("Change feed processor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_running()
    }

    /// Current cursor of a stream
    pub async fn cursor(&self, stream: &str) -> Option<String> {
        self.cursors.get(stream).await
    }

    /// Poll one stream once; returns the number of documents dispatched
    pub async fn poll_once(&self, stream_name: &str) -> Result<usize, StoreError> {
        let stream = self
            .streams
            .iter()
            .find(|s| s.name == stream_name)
            .ok_or_else(|| StoreError::Backend(format!("unknown stream '{}'", stream_name)))?;

        let poller = StreamPoller {
            store: Arc::clone(&self.store),
            stream: Arc::clone(stream),
            cursors: Arc::clone(&self.cursors),
            max_batch: self.config.max_batch,
        };
        let (_tx, rx) = watch::channel(false);
        poller.poll(&rx).await
    }
}

struct StreamPoller {
    store: Arc<dyn DocumentStore>,
    stream: Arc<FeedStream>,
    cursors: Arc<CursorStore>,
    max_batch: usize,
}

impl StreamPoller {
    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(stream = %self.stream.name, "Change stream polling");
        loop {
            if let Err(e) = self.poll(&shutdown).await {
                warn!(stream = %self.stream.name, error = %e, "Change feed read failed");
            }
            if sleep_or_shutdown(&mut shutdown, interval).await {
                break;
            }
        }
        debug!(stream = %self.stream.name, "Change stream stopped");
    }

    async fn poll(&self, shutdown: &watch::Receiver<bool>) -> Result<usize, StoreError> {
        let name = &self.stream.name;
        let cursor = self.cursors.get(name).await;
        let batch = self
            .store
            .read_changes(&self.stream.container, cursor.as_deref(), self.max_batch)
            .await?;

        let mut dispatched = 0;
        for doc in batch.items {
            if *shutdown.borrow() {
                // Leave the cursor where it was; the rest is re-read next start
                debug!(stream = %name, dispatched, "Shutdown requested mid-batch");
                return Ok(dispatched);
            }
            let id = doc.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
            if let Err(e) = self.stream.handler.handle(doc).await {
                warn!(stream = %name, doc_id = %id, error = %e, "Change handler failed");
            }
            dispatched += 1;
        }

        if let Some(next) = batch.cursor {
            self.cursors.set(name, next).await;
        }
        Ok(dispatched)
    }
}
