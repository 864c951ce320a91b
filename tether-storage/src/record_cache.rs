//! Versioned second-level record cache.
//!
//! Sits between the engine's `fetch` path and the backing store. Entries
//! carry the record version they were cached at; the staleness propagator
//! evicts an entry as soon as it observes a newer version in the store, so
//! a subsequent fetch can never return data staler than what the poller
//! has already seen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tether_core::{Record, RecordId, RecordVersion};

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted by version comparison.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Second-level cache of committed records, keyed by id.
///
/// None of its operations fail; a poisoned inner lock degrades every
/// operation to a miss/no-op rather than surfacing an error, since the
/// cache is an optimization layer only.
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: RwLock<HashMap<RecordId, Record>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RecordCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached record.
    pub fn get(&self, record_id: RecordId) -> Option<Record> {
        let found = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&record_id).cloned());
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Cache a committed record. If a racing put already cached a newer
    /// version, the newer version wins.
    pub fn put(&self, record: Record) {
        if let Ok(mut entries) = self.entries.write() {
            match entries.get(&record.record_id) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    entries.insert(record.record_id, record);
                }
            }
        }
    }

    /// Evict the entry for `record_id` if its cached version is older than
    /// `version`. Returns true if an entry was evicted.
    pub fn evict_older_than(&self, record_id: RecordId, version: RecordVersion) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.get(&record_id) {
            Some(existing) if existing.version < version => {
                entries.remove(&record_id);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Number of cached entries.
    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Snapshot of hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tether_core::new_record_id;

    fn record_at_version(record_id: RecordId, version: RecordVersion) -> Record {
        Record {
            record_id,
            name: "cached".to_string(),
            created_by: "tester".to_string(),
            version,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            model_state: None,
            references: vec![],
            view_states: vec![],
        }
    }

    #[test]
    fn test_get_put_round_trip() {
        let cache = RecordCache::new();
        let record_id = new_record_id();

        assert!(cache.get(record_id).is_none());
        cache.put(record_at_version(record_id, 1));
        assert_eq!(cache.get(record_id).expect("cached").version, 1);
    }

    #[test]
    fn test_put_keeps_newer_version_on_race() {
        let cache = RecordCache::new();
        let record_id = new_record_id();

        cache.put(record_at_version(record_id, 3));
        cache.put(record_at_version(record_id, 2));
        assert_eq!(cache.get(record_id).expect("cached").version, 3);

        cache.put(record_at_version(record_id, 4));
        assert_eq!(cache.get(record_id).expect("cached").version, 4);
    }

    #[test]
    fn test_evict_only_when_older() {
        let cache = RecordCache::new();
        let record_id = new_record_id();
        cache.put(record_at_version(record_id, 2));

        // Same or older observed version leaves the entry alone.
        assert!(!cache.evict_older_than(record_id, 2));
        assert!(!cache.evict_older_than(record_id, 1));
        assert!(cache.get(record_id).is_some());

        assert!(cache.evict_older_than(record_id, 3));
        assert!(cache.get(record_id).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_evict_unknown_id_is_noop() {
        let cache = RecordCache::new();
        assert!(!cache.evict_older_than(new_record_id(), 10));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = RecordCache::new();
        let record_id = new_record_id();
        cache.put(record_at_version(record_id, 1));

        cache.get(record_id);
        cache.get(record_id);
        cache.get(new_record_id());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 0.001);
    }
}
