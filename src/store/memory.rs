//! In-process document store.
//!
//! Every write takes the next value of a store-wide sequence, which serves
//! both as the version tag and as the change-feed position.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{ChangeBatch, DocumentStore, Query, StoreError, Version, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    doc: Value,
    lsn: u64,
}

#[derive(Debug, Default)]
struct State {
    lsn: u64,
    containers: HashMap<String, BTreeMap<String, Entry>>,
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,

    /// Successful writes, for asserting that a path performed none
    writes: AtomicU64,

    /// Change-feed reads that should fail before succeeding again
    failing_feed_reads: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` change-feed reads fail with a backend error
    pub fn fail_next_feed_reads(&self, n: u32) {
        self.failing_feed_reads.store(n, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(state: &mut State, container: &str, id: &str, doc: Value) -> Version {
        state.lsn += 1;
        let lsn = state.lsn;
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(id.to_string(), Entry { doc, lsn });
        Version(lsn.to_string())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, container: &str, id: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        let state = self.state()?;
        Ok(state
            .containers
            .get(container)
            .and_then(|c| c.get(id))
            .map(|entry| Versioned {
                doc: entry.doc.clone(),
                version: Version(entry.lsn.to_string()),
            }))
    }

    async fn upsert(&self, container: &str, id: &str, doc: Value) -> Result<Version, StoreError> {
        let mut state = self.state()?;
        let version = Self::write(&mut state, container, id, doc);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn replace(
        &self,
        container: &str,
        id: &str,
        doc: Value,
        if_match: &Version,
    ) -> Result<Version, StoreError> {
        let mut state = self.state()?;
        let current = state
            .containers
            .get(container)
            .and_then(|c| c.get(id))
            .map(|entry| entry.lsn)
            .ok_or_else(|| StoreError::NotFound {
                container: container.to_string(),
                id: id.to_string(),
            })?;

        if current.to_string() != if_match.0 {
            return Err(StoreError::PreconditionFailed {
                container: container.to_string(),
                id: id.to_string(),
            });
        }

        let version = Self::write(&mut state, container, id, doc);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn query(&self, container: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        query.validate().map_err(StoreError::InvalidQuery)?;
        let state = self.state()?;
        let mut docs: Vec<Value> = state
            .containers
            .get(container)
            .map(|c| {
                c.values()
                    .filter(|entry| query.matches(&entry.doc))
                    .map(|entry| entry.doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        query.sort(&mut docs);
        Ok(docs)
    }

    async fn read_changes(
        &self,
        container: &str,
        cursor: Option<&str>,
        max_items: usize,
    ) -> Result<ChangeBatch, StoreError> {
        if self
            .failing_feed_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("injected change feed failure".to_string()));
        }

        let after = match cursor {
            Some(c) => c
                .parse::<u64>()
                .map_err(|_| StoreError::InvalidCursor(c.to_string()))?,
            None => 0,
        };

        let state = self.state()?;
        let mut changed: Vec<&Entry> = state
            .containers
            .get(container)
            .map(|c| c.values().filter(|entry| entry.lsn > after).collect())
            .unwrap_or_default();
        changed.sort_by_key(|entry| entry.lsn);
        changed.truncate(max_items.max(1));

        let cursor = changed
            .last()
            .map(|entry| entry.lsn.to_string())
            .or_else(|| cursor.map(str::to_string));

        Ok(ChangeBatch {
            items: changed.into_iter().map(|entry| entry.doc.clone()).collect(),
            cursor,
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }
}
