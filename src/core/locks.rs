//! Per-aggregate mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

/// Lazily-created async mutex per aggregate key.
///
/// Mutexes are retained for the registry's lifetime so that every caller
/// for the same key contends on the same lock.
#[derive(Debug, Default)]
pub struct KeyedLockRegistry {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one aggregate, released on drop
#[derive(Debug)]
pub struct AggregateGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl AggregateGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> AggregateGuard {
        let lock = self.lock_for(key).await;
        let guard = lock.lock_owned().await;
        trace!(key, "Acquired aggregate lock");
        AggregateGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Number of keys seen so far
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(key) {
            return Arc::clone(lock);
        }

        // Another task may have inserted between dropping the read lock and here
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_reuses_lock() {
        let registry = KeyedLockRegistry::new();
        {
            let guard = registry.acquire("ed-1").await;
            assert_eq!(guard.key(), "ed-1");
        }
        let _again = registry.acquire("ed-1").await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_try_lock_blocked_while_held() {
        let registry = KeyedLockRegistry::new();
        let _held = registry.acquire("ed-1").await;

        let lock = registry.lock_for("ed-1").await;
        assert!(lock.try_lock().is_err());

        let other = registry.lock_for("ed-2").await;
        assert!(other.try_lock().is_ok());
    }
}
