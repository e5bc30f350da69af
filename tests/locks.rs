//! Keyed Lock Integration Tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presswork::core::KeyedLockRegistry;
use tokio_test::{assert_pending, assert_ready, task};

#[test]
fn test_waiter_wakes_when_holder_releases() {
    let registry = KeyedLockRegistry::new();
    let held = tokio_test::block_on(registry.acquire("ed-1"));

    let mut waiting = task::spawn(registry.acquire("ed-1"));
    assert_pending!(waiting.poll());

    let mut other = task::spawn(registry.acquire("ed-2"));
    assert_ready!(other.poll());

    drop(held);
    assert!(waiting.is_woken());
    let guard = assert_ready!(waiting.poll());
    assert_eq!(guard.key(), "ed-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_never_overlaps() {
    let registry = Arc::new(KeyedLockRegistry::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("ed-1").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let registry = Arc::new(KeyedLockRegistry::new());
    let barrier = Arc::new(tokio::sync::Barrier::new(3));

    let tasks: Vec<_> = ["ed-1", "ed-2", "ed-3"]
        .into_iter()
        .map(|key| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(key).await;
                // Deadlocks unless all three hold their locks at once
                barrier.wait().await;
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(2), async {
        for t in tasks {
            t.await.unwrap();
        }
    })
    .await
    .expect("distinct keys should not block each other");
}
