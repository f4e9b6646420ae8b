//! Duplicate suppression for certified messages
//!
//! A retransmitted certified message carries the unique id of the original.
//! When the first copy arrived but its acknowledgement was lost, the copy must
//! be acknowledged again without being delivered twice. Each connection keeps a
//! [`DedupCache`] of the unique ids it has delivered.
//!
//! Entries expire after a TTL and the oldest entries are evicted once the cache
//! reaches capacity, so the cache never grows without bound.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// TTL-based cache of received unique ids with FIFO eviction
#[derive(Debug)]
pub struct DedupCache {
    /// Unique id to the instant it was first seen
    entries: HashMap<u32, Instant>,
    /// Insertion order for FIFO eviction
    insertion_order: VecDeque<u32>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    /// Create a cache with default settings (60 s TTL, 4096 entries)
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(60), 4096)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Records `unique_id` and reports whether it was already seen
    pub fn is_duplicate(&mut self, unique_id: u32) -> bool {
        self.is_duplicate_at(unique_id, Instant::now())
    }

    pub fn is_duplicate_at(&mut self, unique_id: u32, now: Instant) -> bool {
        if self.contains_at(unique_id, now) {
            debug!(unique_id, "Duplicate certified message");
            return true;
        }
        self.insert_at(unique_id, now);
        false
    }

    /// Whether `unique_id` was recorded and has not expired yet
    pub fn contains(&mut self, unique_id: u32) -> bool {
        self.contains_at(unique_id, Instant::now())
    }

    pub fn contains_at(&mut self, unique_id: u32, now: Instant) -> bool {
        self.cleanup_expired(now);
        self.entries.contains_key(&unique_id)
    }

    /// Records a delivered unique id
    pub fn insert(&mut self, unique_id: u32) {
        self.insert_at(unique_id, Instant::now());
    }

    pub fn insert_at(&mut self, unique_id: u32, now: Instant) {
        self.cleanup_expired(now);
        if self.entries.contains_key(&unique_id) {
            return;
        }

        if self.entries.len() >= self.max_entries {
            let to_remove = self.entries.len() - self.max_entries + 1;
            self.remove_oldest_entries(to_remove);
        }

        self.entries.insert(unique_id, now);
        self.insertion_order.push_back(unique_id);
    }

    fn cleanup_expired(&mut self, now: Instant) {
        while let Some(id) = self.insertion_order.front() {
            let expired = self
                .entries
                .get(id)
                .map_or(true, |seen| now.saturating_duration_since(*seen) >= self.ttl);
            if !expired {
                break;
            }
            self.entries.remove(id);
            self.insertion_order.pop_front();
        }
    }

    fn remove_oldest_entries(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(id) = self.insertion_order.pop_front() {
                self.entries.remove(&id);
            }
        }
        trace!(count, "Evicted oldest dedup entries");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut cache = DedupCache::with_settings(Duration::from_secs(60), 100);

        assert!(!cache.is_duplicate(7));
        assert!(cache.is_duplicate(7));
        assert!(!cache.is_duplicate(8));
    }

    #[test]
    fn test_expiration() {
        let mut cache = DedupCache::with_settings(Duration::from_millis(10), 100);
        let start = Instant::now();

        assert!(!cache.is_duplicate_at(1, start));
        assert!(cache.is_duplicate_at(1, start + Duration::from_millis(5)));
        assert!(!cache.is_duplicate_at(1, start + Duration::from_millis(20)));
    }

    #[test]
    fn test_max_entries_limit() {
        let mut cache = DedupCache::with_settings(Duration::from_secs(60), 5);

        for id in 0..10 {
            assert!(!cache.is_duplicate(id));
        }

        assert_eq!(cache.len(), 5);
        // Oldest ids were evicted, newest are still known
        assert!(cache.is_duplicate(9));
        assert!(!cache.is_duplicate(0));
    }

    #[test]
    fn test_contains_does_not_record() {
        let mut cache = DedupCache::with_settings(Duration::from_secs(60), 10);
        assert!(!cache.contains(3));
        assert!(!cache.contains(3));
        cache.insert(3);
        assert!(cache.contains(3));
        assert_eq!(cache.len(), 1);
    }
}
