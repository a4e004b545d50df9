use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A table of async mutexes keyed by id.
///
/// Used to keep at most one in-flight reconciliation per group and one in-flight game recording
/// per match within a process. Entries are dropped again once nobody holds or waits on them.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is free and holds it until the guard is dropped.
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let lock = self.table().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn active(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
        // The table only holds Arcs, so a panic while it was held cannot leave it inconsistent.
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds a key of a [`KeyedLocks`] table.
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.owner.table();
        if let Some(lock) = table.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KeyedLocks;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(1).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _first = locks.lock(1).await;
        let _second = tokio::time::timeout(Duration::from_millis(50), locks.lock(2))
            .await
            .expect("a different key must not wait");
        assert_eq!(locks.active(), 2);
    }
}
