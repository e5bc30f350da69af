//! Claim Integration Tests
//!
//! Tests for the claim protocol: eligibility, expiry and races between
//! workers sharing one store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use presswork::core::{Claim, ClaimCoordinator, RejectReason, DEFAULT_CLAIM_TTL};
use presswork::domain::{ItemStatus, WorkItem};
use presswork::store::{
    ChangeBatch, DocumentStore, ItemRepository, MemoryStore, Query, StoreError, Version,
    Versioned,
};
use serde_json::Value;

fn coordinator(store: Arc<dyn DocumentStore>) -> ClaimCoordinator {
    ClaimCoordinator::new(ItemRepository::new(store), DEFAULT_CLAIM_TTL)
}

async fn seed(store: &Arc<MemoryStore>, item: &WorkItem) {
    ItemRepository::new(store.clone()).save(item).await.unwrap();
}

fn item() -> WorkItem {
    WorkItem::new("https://example.com/post", Some("ed-1".to_string())).with_id("l-1")
}

#[tokio::test]
async fn test_claim_stamps_marker_without_changing_status() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &item()).await;

    let claim = coordinator(store.clone()).claim("l-1").await.unwrap();
    let Claim::Acquired(claimed) = claim else {
        panic!("expected claim to be acquired");
    };
    assert_eq!(claimed.doc.status, ItemStatus::Submitted);
    assert!(claimed.doc.claim_marker.is_some());

    let stored = ItemRepository::new(store).get("l-1").await.unwrap().unwrap();
    assert_eq!(stored.claim_marker, claimed.doc.claim_marker);
}

#[tokio::test]
async fn test_ineligible_items_are_rejected_without_writes() {
    let cases: Vec<(WorkItem, RejectReason)> = vec![
        (
            {
                let mut i = item();
                i.aggregate_id = None;
                i
            },
            RejectReason::NoAggregate,
        ),
        (
            {
                let mut i = item();
                i.status = ItemStatus::Drafted;
                i
            },
            RejectReason::NotSubmitted(ItemStatus::Drafted),
        ),
        (
            {
                let mut i = item();
                i.soft_delete();
                i
            },
            RejectReason::Deleted,
        ),
        (
            {
                let mut i = item();
                i.claim_marker = Some(Utc::now().to_rfc3339());
                i
            },
            RejectReason::ActiveClaim,
        ),
    ];

    for (doc, expected) in cases {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &doc).await;
        let writes = store.write_count();

        match coordinator(store.clone()).claim("l-1").await.unwrap() {
            Claim::Rejected(reason) => assert_eq!(reason, expected),
            Claim::Acquired(_) => panic!("claim should be rejected with {}", expected),
        }
        assert_eq!(store.write_count(), writes, "rejection must not write");
    }
}

#[tokio::test]
async fn test_missing_item_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let claim = coordinator(store).claim("nope").await.unwrap();
    assert!(matches!(claim, Claim::Rejected(RejectReason::NotFound)));
}

#[tokio::test]
async fn test_expired_marker_can_be_reclaimed() {
    let store = Arc::new(MemoryStore::new());
    let mut stale = item();
    stale.claim_marker = Some((Utc::now() - chrono::Duration::minutes(20)).to_rfc3339());
    seed(&store, &stale).await;

    assert!(coordinator(store).claim("l-1").await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_naive_marker_is_read_as_utc() {
    let store = Arc::new(MemoryStore::new());
    let mut recent = item();
    recent.claim_marker = Some(Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    seed(&store, &recent).await;

    let claim = ClaimCoordinator::new(ItemRepository::new(store), Duration::from_secs(60))
        .claim("l-1")
        .await
        .unwrap();
    assert!(matches!(claim, Claim::Rejected(RejectReason::ActiveClaim)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    for _ in 0..20 {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &item()).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let claims = coordinator(store.clone());
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    claims.claim("l-1").await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Claim::Acquired(_) => winners += 1,
                Claim::Rejected(reason) => assert!(matches!(
                    reason,
                    RejectReason::ActiveClaim | RejectReason::Conflict
                )),
            }
        }
        assert_eq!(winners, 1);
    }
}

/// Store where another writer slips in between every read and replace
struct RacingStore {
    inner: MemoryStore,
    raced: AtomicBool,
}

#[async_trait]
impl DocumentStore for RacingStore {
    fn name(&self) -> &str {
        "racing"
    }

    async fn read(&self, container: &str, id: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        self.inner.read(container, id).await
    }

    async fn upsert(&self, container: &str, id: &str, doc: Value) -> Result<Version, StoreError> {
        self.inner.upsert(container, id, doc).await
    }

    async fn replace(
        &self,
        container: &str,
        id: &str,
        doc: Value,
        if_match: &Version,
    ) -> Result<Version, StoreError> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            if let Some(current) = self.inner.read(container, id).await? {
                self.inner.upsert(container, id, current.doc).await?;
            }
        }
        self.inner.replace(container, id, doc, if_match).await
    }

    async fn query(&self, container: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        self.inner.query(container, query).await
    }

    async fn read_changes(
        &self,
        container: &str,
        cursor: Option<&str>,
        max_items: usize,
    ) -> Result<ChangeBatch, StoreError> {
        self.inner.read_changes(container, cursor, max_items).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_lost_race_is_a_conflict() {
    let inner = MemoryStore::new();
    inner
        .upsert("items", "l-1", serde_json::to_value(item()).unwrap())
        .await
        .unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(RacingStore {
        inner,
        raced: AtomicBool::new(false),
    });

    let claims = coordinator(store.clone());
    assert!(matches!(
        claims.claim("l-1").await.unwrap(),
        Claim::Rejected(RejectReason::Conflict)
    ));

    // The interfering write did not claim the item, so a retry wins
    assert!(claims.claim("l-1").await.unwrap().is_acquired());
}
