//! Keyed cache of shared in-flight fetches.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{DriverError, DriverResult};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, DriverError>>>;

struct Slot<V: Clone> {
    generation: u64,
    fetch: SharedFetch<V>,
}

/// A cached value and the generation it was fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub generation: u64,
    pub value: V,
}

/// Concurrent callers for one key share one in-flight fetch.
///
/// A forced refresh only starts a new fetch if the caller's `obsolete`
/// generation is still the cached one and has resolved; otherwise it joins
/// whatever replaced it. Failed fetches are evicted so the next caller retries.
pub struct AsyncCache<K, V: Clone> {
    entries: DashMap<K, Arc<Slot<V>>>,
    next_generation: AtomicU64,
}

impl<K, V> Default for AsyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> AsyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { entries: DashMap::new(), next_generation: AtomicU64::new(1) }
    }

    fn slot<F, Fut>(&self, fetch: F) -> Arc<Slot<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DriverResult<V>> + Send + 'static,
    {
        Arc::new(Slot {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            fetch: fetch().boxed().shared(),
        })
    }

    /// Get the value for `key`, fetching it if absent.
    ///
    /// With `force_refresh`, a new fetch starts only when the cached generation
    /// equals `obsolete` (or `obsolete` is `None`).
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &K,
        force_refresh: bool,
        obsolete: Option<u64>,
        fetch: F,
    ) -> DriverResult<Versioned<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DriverResult<V>> + Send + 'static,
    {
        let slot = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                // An in-flight fetch is as fresh as a new one would be.
                let stale = force_refresh
                    && current.fetch.peek().is_some()
                    && obsolete.is_none_or(|g| g == current.generation);
                if stale {
                    let slot = self.slot(fetch);
                    occupied.insert(Arc::clone(&slot));
                    slot
                } else {
                    Arc::clone(occupied.get())
                }
            },
            Entry::Vacant(vacant) => {
                let slot = self.slot(fetch);
                vacant.insert(Arc::clone(&slot));
                slot
            },
        };

        match slot.fetch.clone().await {
            Ok(value) => Ok(Versioned { generation: slot.generation, value }),
            Err(e) => {
                self.entries.remove_if(key, |_, current| current.generation == slot.generation);
                Err(e)
            },
        }
    }

    /// Store an already-known value.
    pub fn insert(&self, key: K, value: V) -> u64 {
        let slot = self.slot(|| futures::future::ready(Ok(value)));
        let generation = slot.generation;
        self.entries.insert(key, slot);
        generation
    }

    /// Resolved value for `key`, without waiting on an in-flight fetch.
    pub fn try_get(&self, key: &K) -> Option<Versioned<V>> {
        let slot = self.entries.get(key).map(|s| Arc::clone(s.value()))?;
        let value = slot.fetch.peek()?.as_ref().ok()?.clone();
        Some(Versioned { generation: slot.generation, value })
    }

    /// Generation currently cached for `key`.
    pub fn generation(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|s| s.generation)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict resolved entries whose value matches `predicate`; returns the keys removed.
    pub fn remove_where<P>(&self, predicate: P) -> Vec<K>
    where
        P: Fn(&V) -> bool,
    {
        let matching: Vec<(K, u64)> = self
            .entries
            .iter()
            .filter(|e| matches!(e.value().fetch.peek(), Some(Ok(v)) if predicate(v)))
            .map(|e| (e.key().clone(), e.value().generation))
            .collect();
        matching
            .into_iter()
            .filter(|(key, generation)| {
                self.entries.remove_if(key, |_, s| s.generation == *generation).is_some()
            })
            .map(|(key, _)| key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, DriverResult<u32>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_fetch() {
        let cache = Arc::new(AsyncCache::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let gets: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let fetch = counting_fetch(&calls, 7);
                tokio::spawn(async move { cache.get_or_fetch(&"k".to_string(), false, None, fetch).await })
            })
            .collect();

        let mut generations = Vec::new();
        for get in gets {
            let got = get.await.unwrap().unwrap();
            assert_eq!(got.value, 7);
            generations.push(got.generation);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        generations.dedup();
        assert_eq!(generations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_refresh_collapses_force_refreshes() {
        let cache = Arc::new(AsyncCache::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "k".to_string();
        let first = cache.get_or_fetch(&key, false, None, counting_fetch(&calls, 1)).await.unwrap();

        let refreshes: Vec<_> = (0..5)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let fetch = counting_fetch(&calls, 2);
                let key = key.clone();
                let obsolete = Some(first.generation);
                tokio::spawn(async move { cache.get_or_fetch(&key, true, obsolete, fetch).await })
            })
            .collect();
        for refresh in refreshes {
            assert_eq!(refresh.await.unwrap().unwrap().value, 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_evicted() {
        let cache = AsyncCache::<String, u32>::new();
        let key = "k".to_string();
        let err = cache
            .get_or_fetch(&key, false, None, || async { Err(DriverError::Network("down".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::Network("down".to_string()));
        assert!(cache.is_empty());

        let ok = cache.get_or_fetch(&key, false, None, || async { Ok(3) }).await.unwrap();
        assert_eq!(ok.value, 3);
        assert_eq!(cache.try_get(&key), Some(ok));
    }

    #[test]
    fn test_remove_where() {
        let cache = AsyncCache::<u32, u32>::new();
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 10);

        let mut removed = cache.remove_where(|v| *v == 10);
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(cache.len(), 1);
    }
}
