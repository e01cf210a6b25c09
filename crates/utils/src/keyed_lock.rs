//! Per-key async mutual exclusion.
//!
//! Entries are held as weak references and disappear as soon as the last guard
//! for a key goes away, so the map only ever contains keys that are in use.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = DashMap<K, Weak<Mutex<()>>>;

/// Exclusive access to one key; released on drop.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K> KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> fmt::Debug for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLockGuard").field("key", &self.key).finish()
    }
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // Only our own handle is left: nobody holds or waits for this key.
        if Arc::strong_count(&self.mutex) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

/// Serializes work per key while letting different keys proceed in parallel.
///
/// ```rust,ignore
/// let locks = KeyedLock::<String>::new();
/// let guard = locks.lock(&"default/pod1".to_string()).await;
/// // read-modify-write for default/pod1
/// drop(guard);
/// ```
pub struct KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<LockMap<K>>,
}

impl<K> KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits until `key` is free and takes it.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).lock_owned().await;
        self.guard(guard, mutex, key)
    }

    /// Takes `key` only if nobody else holds it.
    pub fn try_lock(&self, key: &K) -> Option<KeyedLockGuard<K>> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).try_lock_owned().ok()?;
        Some(self.guard(guard, mutex, key))
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self, guard: OwnedMutexGuard<()>, mutex: Arc<Mutex<()>>, key: &K) -> KeyedLockGuard<K> {
        KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(Mutex::new(()));
                    occupied.insert(Arc::downgrade(&mutex));
                    mutex
                }
            },
            Entry::Vacant(vacant) => {
                let mutex = Arc::new(Mutex::new(()));
                vacant.insert(Arc::downgrade(&mutex));
                mutex
            }
        }
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::time::sleep;

    use super::*;

    #[test(tokio::test)]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLock::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _guard = locks.lock(&"default/pod1".to_string()).await;
                    let seen = counter.load(Ordering::SeqCst);
                    sleep(Duration::from_millis(1)).await;
                    counter.store(seen + 1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test(tokio::test)]
    async fn other_keys_are_not_blocked() {
        let locks = KeyedLock::<String>::new();
        let _held = locks.lock(&"default/pod1".to_string()).await;

        let other = locks.try_lock(&"default/pod2".to_string());
        assert!(other.is_some());
        assert!(locks.try_lock(&"default/pod1".to_string()).is_none());
    }

    #[test(tokio::test)]
    async fn entries_are_dropped_with_last_guard() {
        let locks = KeyedLock::<u32>::new();

        {
            let _first = locks.lock(&1).await;
            let _second = locks.lock(&2).await;
            assert_eq!(locks.len(), 2);
        }

        assert!(locks.is_empty());
        for key in 0..100 {
            let _guard = locks.lock(&key).await;
        }
        assert!(locks.is_empty());
    }

    #[test(tokio::test)]
    async fn waiter_keeps_entry_alive() {
        let locks = Arc::new(KeyedLock::<u32>::new());
        let first = locks.lock(&7).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guard = locks.lock(&7).await;
                *guard.key()
            })
        };
        tokio::task::yield_now().await;
        drop(first);

        assert_eq!(waiter.await.unwrap(), 7);
        assert!(locks.is_empty());
    }

    #[test(tokio::test)]
    async fn double_checked_registration_runs_once() {
        let locks = Arc::new(KeyedLock::<String>::new());
        let registered = Arc::new(AtomicBool::new(false));
        let registrations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let registered = Arc::clone(&registered);
                let registrations = Arc::clone(&registrations);
                tokio::spawn(async move {
                    let _guard = locks.lock(&"default/pod1".to_string()).await;
                    if registered.load(Ordering::SeqCst) {
                        return;
                    }
                    sleep(Duration::from_millis(2)).await;
                    registered.store(true, Ordering::SeqCst);
                    registrations.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registrations.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
