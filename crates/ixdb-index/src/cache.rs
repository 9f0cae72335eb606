//! Bounded two-generation caches
//!
//! New entries go to the current generation. When it fills up, it becomes
//! the previous generation and the old previous one is dropped. Hits in the
//! previous generation are promoted, so the working set survives rotations.

use crate::config::IndexConfig;
use crate::hour::HourTracker;
use fxhash::FxHashMap;
use ixdb_core::{hour_from_timestamp, now_millis, MetricId, Scope, Tsid};
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub rotations: u64,
}

struct Generations<K, V> {
    current: FxHashMap<K, V>,
    previous: FxHashMap<K, V>,
}

/// Fixed-capacity key/value cache with generational eviction
pub struct WorkingSetCache<K, V> {
    capacity: usize,
    inner: RwLock<Generations<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    rotations: AtomicU64,
}

impl<K, V> WorkingSetCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Create a cache holding up to `capacity` entries per generation
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Generations {
                current: FxHashMap::default(),
                previous: FxHashMap::default(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    /// Look up a key
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq + ToOwned<Owned = K>,
    {
        let promoted = {
            let inner = self.inner.read();
            if let Some(v) = inner.current.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(v.clone());
            }
            inner.previous.get(key).cloned()
        };

        match promoted {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.set(key.to_owned(), v.clone());
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        if inner.current.len() >= self.capacity && !inner.current.contains_key(&key) {
            let full = std::mem::take(&mut inner.current);
            inner.previous = full;
            self.rotations.fetch_add(1, Ordering::Relaxed);
        }
        inner.current.insert(key, value);
    }

    /// Drop every entry
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.current.clear();
        inner.previous.clear();
    }

    /// Number of entries across both generations
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.current.len() + inner.previous.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }
}

/// Caches shared by index instances.
///
/// Owned by the caller so several `IndexDb` generations can reuse them.
#[derive(Clone)]
pub struct IndexCaches {
    /// Encoded identity -> TSID
    pub tsid: Arc<WorkingSetCache<Vec<u8>, Tsid>>,
    /// (scope, metric id) -> encoded identity
    pub metric_name: Arc<WorkingSetCache<(Scope, MetricId), Vec<u8>>>,
    /// Hourly active-set of metric ids
    pub hours: Arc<HourTracker>,
}

impl IndexCaches {
    /// Create caches sized by `config`
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            tsid: Arc::new(WorkingSetCache::new(config.tsid_cache_capacity)),
            metric_name: Arc::new(WorkingSetCache::new(config.metric_name_cache_capacity)),
            hours: Arc::new(HourTracker::new(hour_from_timestamp(now_millis()))),
        }
    }

    /// Drop all cached entries
    pub fn reset(&self) {
        self.tsid.reset();
        self.metric_name.reset();
    }
}

impl Default for IndexCaches {
    fn default() -> Self {
        Self::new(&IndexConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_reset() {
        let cache: WorkingSetCache<Vec<u8>, u64> = WorkingSetCache::new(10);
        assert_eq!(cache.get(&b"a"[..]), None);

        cache.set(b"a".to_vec(), 1);
        assert_eq!(cache.get(&b"a"[..]), Some(1));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);

        cache.reset();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let cache: WorkingSetCache<u64, u64> = WorkingSetCache::new(2);
        cache.set(1, 10);
        cache.set(2, 20);
        cache.set(3, 30); // rotates: {1,2} become previous

        assert_eq!(cache.stats().rotations, 1);
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&1), Some(10)); // promoted

        cache.set(4, 40); // rotates again: {3,1} previous, {2} dropped
        cache.set(5, 50);
        assert_eq!(cache.get(&2), None);
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_overwrite_does_not_rotate() {
        let cache: WorkingSetCache<u64, u64> = WorkingSetCache::new(1);
        cache.set(1, 10);
        cache.set(1, 11);
        assert_eq!(cache.stats().rotations, 0);
        assert_eq!(cache.get(&1), Some(11));
    }
}
