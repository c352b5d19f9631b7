//! Time-bounded cache for container metadata

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries expire a fixed time after insertion.
///
/// Expired entries are never returned. They are evicted lazily by the
/// lookup that finds them, there is no background sweep. All methods take
/// `&self` and may be called from several tasks at once.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Look up a live entry
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Look up an entry as of `now`, evicting it if it has expired
    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if now <= entry.expires_at => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        // Re-check under the shard lock so a concurrent refresh is kept
        self.entries.remove_if(key, |_, entry| now > entry.expires_at);
        None
    }

    /// Store a value that expires one TTL from now
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    /// Store a value that expires one TTL after `now`
    pub fn insert_at(&self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
