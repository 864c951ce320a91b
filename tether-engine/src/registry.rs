//! Weak-keyed registry of live instances by record id.
//!
//! The registry never owns an instance: each entry holds weak references,
//! so registration does not prevent collection of instances whose owners
//! have dropped them. Dead references are pruned lazily, during lookups on
//! the touched entry and during the periodic [`sweep`](LiveRegistry::sweep).
//!
//! The map is sharded: mutations to one id's entry are mutually exclusive,
//! while operations on different ids do not contend.

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use tether_core::RecordId;

use crate::live::LiveRecord;

/// Process-wide registry of live instances.
#[derive(Debug, Default)]
pub struct LiveRegistry {
    entries: DashMap<RecordId, Vec<Weak<LiveRecord>>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live instance under its record id. Insertion order within
    /// an entry carries no semantic meaning.
    pub fn register(&self, instance: &Arc<LiveRecord>) {
        self.entries
            .entry(instance.record_id())
            .or_default()
            .push(Arc::downgrade(instance));
    }

    /// Return the strongly-reachable instances for `record_id`, pruning
    /// dead weak references from the entry as a side effect. Unknown ids
    /// yield an empty list.
    pub fn lookup_live(&self, record_id: RecordId) -> Vec<Arc<LiveRecord>> {
        let Some(mut entry) = self.entries.get_mut(&record_id) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(entry.len());
        entry.retain(|weak| match weak.upgrade() {
            Some(instance) => {
                live.push(instance);
                true
            }
            None => false,
        });
        live
    }

    /// Remove every entry whose weak references are all dead. O(entries ×
    /// refs), so the poller runs it only every Nth cycle. Returns the
    /// number of entries removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, refs| refs.iter().any(|weak| weak.strong_count() > 0));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently in the registry, including entries whose
    /// references have expired but have not been swept yet.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
