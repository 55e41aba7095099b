//! Per-key async read/write locks.
//!
//! Entries are created on first use and dropped once no task holds or waits
//! for them, so the map only grows with concurrent keys.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

/// Holds a key until dropped. Also releases the map entry when the waiting
/// future is dropped before the lock was granted.
pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    shared: Option<OwnedRwLockReadGuard<()>>,
    exclusive: Option<OwnedRwLockWriteGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: String) -> (Arc<RwLock<()>>, KeyedGuard<'_>) {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(key.clone()).or_default().clone()
        };
        let guard = KeyedGuard {
            locks: self,
            key,
            shared: None,
            exclusive: None,
        };
        (entry, guard)
    }

    /// Wait until nobody else holds `key` and hold it exclusively.
    pub async fn lock(&self, key: impl Into<String>) -> KeyedGuard<'_> {
        let (entry, mut guard) = self.entry(key.into());
        guard.exclusive = Some(entry.write_owned().await);
        guard
    }

    /// Hold `key` alongside other shared holders; excludes [`lock`](Self::lock).
    pub async fn lock_shared(&self, key: impl Into<String>) -> KeyedGuard<'_> {
        let (entry, mut guard) = self.entry(key.into());
        guard.shared = Some(entry.read_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.shared.take();
        self.exclusive.take();
        let mut entries = self
            .locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&self.key) {
            // only the map still references it: nobody holds or waits
            if Arc::strong_count(entry) == 1 {
                entries.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("upload-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn shared_holders_coexist_but_exclude_writers() {
        let locks = KeyedLocks::new();
        let first = locks.lock_shared("u").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock_shared("u")).await;
        assert!(second.is_ok());

        let writer = tokio::time::timeout(Duration::from_millis(20), locks.lock("u")).await;
        assert!(writer.is_err());

        drop(second);
        drop(first);
        let writer = tokio::time::timeout(Duration::from_millis(100), locks.lock("u")).await;
        assert!(writer.is_ok());
        drop(writer);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_its_entry() {
        let locks = KeyedLocks::new();
        let holder = locks.lock("busy").await;

        let mut waiter = Box::pin(locks.lock("busy"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());
        drop(holder);
        assert_eq!(locks.len(), 1);

        drop(waiter);
        assert_eq!(locks.len(), 0);
    }
}
