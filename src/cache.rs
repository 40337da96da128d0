// TTL cache used for batch summaries and per-listing calendar detail.
// Entries expire purely by a check on read; nothing sweeps in the background.

use dashmap::DashMap;
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub expired_count: AtomicUsize,
    pub insert_count: AtomicUsize,
    pub invalidated_count: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatsReport {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub insert_count: usize,
    pub invalidated_count: usize,
}

struct CacheEntry<V> {
    payload: Arc<V>,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
                return Some(Arc::clone(&entry.payload));
            }
        } else {
            self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
            return None;
        }

        // Shard lock from the read above is released before removing
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.stats.expired_count.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
        None
    }

    pub fn insert(&self, key: K, payload: V) -> Arc<V> {
        self.insert_with_ttl(key, payload, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: K, payload: V, ttl: Duration) -> Arc<V> {
        let payload = Arc::new(payload);
        let entry = CacheEntry {
            payload: Arc::clone(&payload),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
        self.stats.insert_count.fetch_add(1, Ordering::SeqCst);
        payload
    }

    // Remove every entry whose key matches; returns how many were dropped
    pub fn invalidate<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let keys_to_remove: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let count = keys_to_remove
            .into_iter()
            .filter(|key| self.entries.remove(key).is_some())
            .count();
        self.stats
            .invalidated_count
            .fetch_add(count, Ordering::SeqCst);
        count
    }

    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        self.stats
            .invalidated_count
            .fetch_add(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            items_count: self.entries.len(),
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            expired_count: self.stats.expired_count.load(Ordering::SeqCst),
            insert_count: self.stats.insert_count.load(Ordering::SeqCst),
            invalidated_count: self.stats.invalidated_count.load(Ordering::SeqCst),
        }
    }
}
