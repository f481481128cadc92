//! Bounded TTL cache for per-path lookups.
//!
//! The queue resolves an executable descriptor and a git remote for every
//! report; both are stable per path for long stretches, so they are cached
//! with explicit TTLs and a hard entry bound.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default entry bound shared by the executable and git-remote caches.
pub const DEFAULT_CAPACITY: usize = 1000;

pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, then the oldest live one if still at capacity.
    fn evict_one(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_miss() {
        let mut cache = TtlCache::new(10, Duration::from_millis(0));
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn live_entries_hit() {
        let mut cache = TtlCache::new(10, Duration::from_secs(60));
        cache.insert("k", 7);
        assert_eq!(cache.get(&"k"), Some(7));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut cache = TtlCache::new(3, Duration::from_secs(60));
        for i in 0..10 {
            cache.insert(i, i);
        }
        assert!(cache.len() <= 3);
        // The most recent insert always survives.
        assert_eq!(cache.get(&9), Some(9));
    }
}
