//! Bounded LRU cache.
//!
//! Backs the query plan cache and is reusable for any key/value pair. The
//! cache is internally synchronized; recency is tracked with a monotonic
//! tick instead of wall-clock time. An optional eviction listener runs
//! under the cache lock, so an observer never sees an entry both evicted
//! and resident.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hit/miss/put/eviction counters plus the current entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Inserts (including overwrites).
    pub puts: u64,
    /// Entries removed to respect the bound.
    pub evictions: u64,
    /// Entries currently resident.
    pub size: usize,
}

type EvictionListener<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    last_used: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

/// LRU cache bounded to a maximum number of entries.
///
/// When an insert would exceed the bound, the least-recently-used entry is
/// evicted first. Values are handed out by clone; callers store `Arc`s for
/// anything non-trivial.
pub struct BoundedCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    on_evict: Option<EvictionListener<K, V>>,
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    /// Create a cache bounded to `max_size` entries.
    ///
    /// A bound of zero is treated as one: the cache always holds the most
    /// recent entry.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(max_size.min(256)),
                tick: 0,
            }),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            on_evict: None,
        }
    }

    /// Create a cache that calls `listener` for every evicted entry.
    #[must_use]
    pub fn with_eviction_listener(
        max_size: usize,
        listener: impl Fn(&K, &V) + Send + Sync + 'static,
    ) -> Self {
        let mut cache = Self::new(max_size);
        cache.on_evict = Some(Box::new(listener));
        cache
    }

    /// Look up a value, refreshing its recency on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, evicting the least-recently-used entry when full.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.max_size {
                let lru_key = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone());
                let Some(lru_key) = lru_key else { break };
                if let Some(evicted) = inner.entries.remove(&lru_key) {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    if let Some(listener) = &self.on_evict {
                        listener(&lru_key, &evicted.value);
                    }
                }
            }
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                last_used: tick,
            },
        );
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove an entry, returning its value. Does not count as an eviction.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .entries
            .remove(key)
            .map(|e| e.value)
    }

    /// Evict least-recently-used entries until at most `keep` remain.
    /// Evicted entries count as evictions and notify the listener.
    pub fn trim(&self, keep: usize) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        while inner.entries.len() > keep {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            let Some(lru_key) = lru_key else { break };
            if let Some(evicted) = inner.entries.remove(&lru_key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(listener) = &self.on_evict {
                    listener(&lru_key, &evicted.value);
                }
            }
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries without touching the counters. Cleared entries do
    /// not notify the eviction listener.
    pub fn clear(&self) {
        self.inner.lock().expect("lock poisoned").entries.clear();
    }

    /// Snapshot of all resident entries, in no particular order.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_get_put() {
        let cache: BoundedCache<u64, String> = BoundedCache::new(4);
        assert_eq!(cache.get(&1), None);

        cache.put(1, "one".to_string());
        assert_eq!(cache.get(&1).as_deref(), Some("one"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(2);
        cache.put(1, 10);
        cache.put(2, 20);

        // Touch 1 so that 2 becomes the LRU entry.
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);

        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(2);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(1, 11);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_eviction_listener_fires() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&evicted);
        let cache: BoundedCache<u64, u64> =
            BoundedCache::with_eviction_listener(1, move |key, value| {
                assert_eq!((*key, *value), (1, 10));
                seen.fetch_add(1, Ordering::SeqCst);
            });

        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_is_not_an_eviction() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(4);
        cache.put(1, 10);
        assert_eq!(cache.remove(&1), Some(10));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_trim_drops_least_recent_first() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(4);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.get(&1), Some(10));

        cache.trim(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_stats_counters() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(1);
        cache.get(&1);
        cache.put(1, 10);
        cache.get(&1);
        cache.put(2, 20);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_zero_bound_holds_one_entry() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(0);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_entries_snapshot() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new(4);
        cache.put(1, 10);
        cache.put(2, 20);
        let mut entries = cache.entries();
        entries.sort_unstable();
        assert_eq!(entries, vec![(1, 10), (2, 20)]);
    }
}
