//! In-process cache tier with capacity eviction and lazy expiry.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::CacheEntry;
use crate::store::FrontTier;

/// Bounded in-memory cache. Expired entries are dropped on access or by
/// [`LocalCache::sweep_expired`]; when full, the oldest entry by creation
/// time is evicted.
pub struct LocalCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn sweep_expired(&self) -> u64 {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        (before - entries.len()) as u64
    }

    /// Keys starting with the given prefix.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

impl FrontTier<String, CacheEntry> for LocalCache {
    fn get(&self, key: &String) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: String, value: CacheEntry) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            // Evict the oldest entry to stay within capacity.
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(key, value);
    }

    fn remove(&self, key: &String) -> Option<CacheEntry> {
        self.entries.lock().remove(key)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn entry(key: &str, ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(key, json!({"v": key}), ttl_ms, Vec::new())
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = LocalCache::new(2);
        let mut old = entry("a", 60_000);
        old.created_at = Utc::now() - Duration::seconds(30);
        cache.put("a".to_string(), old);
        cache.put("b".to_string(), entry("b", 60_000));
        cache.put("c".to_string(), entry("c", 60_000));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
        assert!(cache.get(&"a".to_string()).is_none());
        assert!(cache.get(&"b".to_string()).is_some());
    }

    #[test]
    fn expired_entries_vanish_on_access() {
        let cache = LocalCache::new(10);
        let mut stale = entry("k", 1);
        stale.created_at = Utc::now() - Duration::seconds(5);
        cache.put("k".to_string(), stale);

        assert!(cache.get(&"k".to_string()).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = LocalCache::new(10);
        let mut stale = entry("old", 1);
        stale.created_at = Utc::now() - Duration::seconds(5);
        cache.put("old".to_string(), stale);
        cache.put("fresh".to_string(), entry("fresh", 60_000));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn hit_rate_tracks_accesses() {
        let cache = LocalCache::new(10);
        cache.put("k".to_string(), entry("k", 60_000));
        cache.get(&"k".to_string());
        cache.get(&"missing".to_string());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
