//! Capacity- and age-bounded cache
//!
//! Backs the zone-snapshot table: a fixed-size map keyed by zone id where
//! entries expire by age and the least-recently-touched entry is recycled
//! when the table is full.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
pub struct TimeCache<K, V> {
    map: HashMap<K, Entry<V>>,
    capacity: usize,
    max_age_ms: i64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    touched_ms: i64,
}

impl<K: Eq + Hash + Clone, V> TimeCache<K, V> {
    pub fn new(capacity: usize, max_age_ms: i64) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        Self {
            map: HashMap::with_capacity(capacity),
            capacity,
            max_age_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|e| &e.value)
    }

    /// Mutable access; refreshes the entry's age
    pub fn get_mut(&mut self, key: &K, now_ms: i64) -> Option<&mut V> {
        self.map.get_mut(key).map(|e| {
            e.touched_ms = now_ms;
            &mut e.value
        })
    }

    /// Fetch or create, recycling the stalest entry when at capacity
    pub fn get_or_insert_with(&mut self, key: K, now_ms: i64, make: impl FnOnce() -> V) -> &mut V {
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            self.evict_stalest();
        }
        let entry = self.map.entry(key).or_insert_with(|| Entry {
            value: make(),
            touched_ms: now_ms,
        });
        entry.touched_ms = now_ms;
        &mut entry.value
    }

    /// Drop entries untouched for longer than `max_age_ms`
    pub fn evict_expired(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.max_age_ms;
        self.map.retain(|_, e| e.touched_ms >= cutoff);
    }

    /// Drop entries failing `keep` (detector cleanup hooks)
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) {
        self.map.retain(|k, e| keep(k, &mut e.value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter().map(|(k, e)| (k, &e.value))
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .map
            .iter()
            .min_by_key(|(_, e)| e.touched_ms)
            .map(|(k, _)| k.clone());
        if let Some(key) = stalest {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_recycles_stalest() {
        let mut cache: TimeCache<i64, &str> = TimeCache::new(2, 60_000);
        cache.get_or_insert_with(1, 100, || "a");
        cache.get_or_insert_with(2, 200, || "b");
        // touch 1 so 2 becomes stalest
        cache.get_mut(&1, 300);
        cache.get_or_insert_with(3, 400, || "c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn test_age_eviction() {
        let mut cache: TimeCache<i64, i32> = TimeCache::new(8, 1_000);
        cache.get_or_insert_with(1, 0, || 1);
        cache.get_or_insert_with(2, 900, || 2);
        cache.evict_expired(1_500);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
    }
}
