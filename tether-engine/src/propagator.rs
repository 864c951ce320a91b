//! Staleness propagation from store changes to live instances.
//!
//! Invoked by the change poller once per observed record. The window-based
//! re-scan means the same record can be delivered more than once, so every
//! step here is idempotent: marking repeats harmlessly, eviction compares
//! versions, and notifications fire only for marks that actually took
//! effect.

use std::sync::Arc;
use tracing::trace;

use tether_core::{Record, Staleness};
use tether_storage::RecordCache;

use crate::registry::LiveRegistry;

/// Propagates observed record changes to live instances and the
/// second-level cache.
#[derive(Debug, Clone)]
pub struct StalenessPropagator {
    registry: Arc<LiveRegistry>,
    record_cache: Arc<RecordCache>,
}

impl StalenessPropagator {
    pub fn new(registry: Arc<LiveRegistry>, record_cache: Arc<RecordCache>) -> Self {
        Self {
            registry,
            record_cache,
        }
    }

    /// React to a record observed in the store's change stream. Returns
    /// the number of instances newly marked stale.
    ///
    /// Never fails: an id with no live instances is a no-op.
    pub fn on_record_changed(&self, record: &Record) -> usize {
        let live = self.registry.lookup_live(record.record_id);
        if live.is_empty() {
            return 0;
        }

        // Evict a second-level entry that is now known stale, so the next
        // fetch cannot return data older than what was just observed.
        self.record_cache
            .evict_older_than(record.record_id, record.version);

        let mut newly_stale = 0;
        for instance in live {
            if instance.known_version() >= record.version {
                continue;
            }
            if instance.mark_stale(Staleness::behind(record.version)) {
                newly_stale += 1;
                trace!(
                    record_id = %record.record_id,
                    version = record.version,
                    "live instance marked stale"
                );
            }
            // The delegate's own version is not comparable at this layer;
            // once any member changes it is always considered stale. An
            // absent or already-dropped delegate is tolerated.
            if let Some(delegate) = instance.delegate() {
                delegate.mark_stale(Staleness::Always);
            }
        }
        newly_stale
    }
}

// =============================================================================
// TESTS
// =============================================================================
