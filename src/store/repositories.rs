//! Typed repositories over the document store.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Edition, Feedback, Run, WorkItem};

use super::{
    DocumentStore, Query, StoreError, Version, Versioned, CHECKPOINTS, EDITIONS, FEEDBACK,
    ITEMS, RUNS,
};

/// A document type stored in a fixed container
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const CONTAINER: &'static str;

    fn id(&self) -> &str;
}

impl Document for WorkItem {
    const CONTAINER: &'static str = ITEMS;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Edition {
    const CONTAINER: &'static str = EDITIONS;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Feedback {
    const CONTAINER: &'static str = FEEDBACK;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Run {
    const CONTAINER: &'static str = RUNS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Persisted change-feed position for one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stream name
    pub id: String,
    pub cursor: String,
    pub updated_at: DateTime<Utc>,
}

impl Document for Checkpoint {
    const CONTAINER: &'static str = CHECKPOINTS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Typed access to one container
pub struct Repository<T> {
    store: Arc<dyn DocumentStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

pub type ItemRepository = Repository<WorkItem>;
pub type EditionRepository = Repository<Edition>;
pub type FeedbackRepository = Repository<Feedback>;
pub type RunRepository = Repository<Run>;
pub type CheckpointRepository = Repository<Checkpoint>;

impl<T: Document> Repository<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.get_versioned(id).await?.map(|v| v.doc))
    }

    pub async fn get_versioned(&self, id: &str) -> Result<Option<Versioned<T>>, StoreError> {
        match self.store.read(T::CONTAINER, id).await? {
            Some(Versioned { doc, version }) => {
                let doc = serde_json::from_value(doc).map_err(|e| {
                    StoreError::InvalidDocument(format!("{}/{}: {}", T::CONTAINER, id, e))
                })?;
                Ok(Some(Versioned { doc, version }))
            }
            None => Ok(None),
        }
    }

    /// Unconditional write
    pub async fn save(&self, doc: &T) -> Result<Version, StoreError> {
        let value = serde_json::to_value(doc)?;
        self.store.upsert(T::CONTAINER, doc.id(), value).await
    }

    /// Write only if the stored document is still at `if_match`
    pub async fn replace(&self, doc: &T, if_match: &Version) -> Result<Version, StoreError> {
        let value = serde_json::to_value(doc)?;
        self.store
            .replace(T::CONTAINER, doc.id(), value, if_match)
            .await
    }

    /// Run a query, skipping documents that no longer match the type
    pub async fn query(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        let docs = self.store.query(T::CONTAINER, query).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(container = T::CONTAINER, error = %e, "Skipping unreadable document");
                    None
                }
            })
            .collect())
    }
}

impl Repository<Run> {
    /// Run history for a trigger, oldest first
    pub async fn by_trigger(&self, trigger_id: &str) -> Result<Vec<Run>, StoreError> {
        // Timestamps serialize with variable precision, so order on parsed values
        let mut runs = self.query(&Query::new().eq("trigger_id", trigger_id)).await?;
        runs.sort_by_key(|run| run.started_at);
        Ok(runs)
    }
}

impl Repository<WorkItem> {
    /// Live items associated with an edition
    pub async fn by_edition(&self, edition_id: &str) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = self.query(&Query::new().eq("aggregate_id", edition_id)).await?;
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_runs_by_trigger_in_start_order() {
        let runs = RunRepository::new(Arc::new(MemoryStore::new()));

        let first = Run::start(Stage::Fetch, "l-1", "ed-1");
        let mut second = Run::start(Stage::Review, "l-1", "ed-1");
        second.started_at = first.started_at + chrono::Duration::seconds(1);
        let other = Run::start(Stage::Fetch, "l-2", "ed-1");

        runs.save(&second).await.unwrap();
        runs.save(&other).await.unwrap();
        runs.save(&first).await.unwrap();

        let history = runs.by_trigger("l-1").await.unwrap();
        let stages: Vec<Stage> = history.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::Fetch, Stage::Review]);
    }

    #[tokio::test]
    async fn test_run_order_ignores_fraction_formatting() {
        use chrono::TimeZone;

        // "...:01Z" sorts after "...:01.500Z" as text
        let whole = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap();
        let stores: Vec<Arc<dyn DocumentStore>> = vec![
            Arc::new(MemoryStore::new()),
            Arc::new(crate::store::SqliteStore::in_memory().unwrap()),
        ];
        for store in stores {
            let runs = RunRepository::new(store);
            let mut first = Run::start(Stage::Fetch, "l-1", "ed-1");
            first.started_at = whole;
            let mut second = Run::start(Stage::Review, "l-1", "ed-1");
            second.started_at = whole + chrono::Duration::milliseconds(500);

            runs.save(&second).await.unwrap();
            runs.save(&first).await.unwrap();

            let stages: Vec<Stage> = runs
                .by_trigger("l-1")
                .await
                .unwrap()
                .iter()
                .map(|r| r.stage)
                .collect();
            assert_eq!(stages, vec![Stage::Fetch, Stage::Review]);
        }
    }

    #[tokio::test]
    async fn test_deleted_items_excluded_from_edition() {
        let items = ItemRepository::new(Arc::new(MemoryStore::new()));

        let live = WorkItem::new("https://a.example", Some("ed-1".to_string()));
        let mut gone = WorkItem::new("https://b.example", Some("ed-1".to_string()));
        gone.soft_delete();

        items.save(&live).await.unwrap();
        items.save(&gone).await.unwrap();

        let members = items.by_edition("ed-1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, live.id);
    }
}
