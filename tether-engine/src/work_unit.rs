//! Caller-scoped batched persistence.
//!
//! A [`WorkUnit`] is an explicit handle owned by the calling flow, replacing
//! hidden per-thread state: one open batch per handle, enforced by the
//! handle itself. Instances accumulate between `begin` and `complete`,
//! ordered by record id so persistence order is deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_core::{RecordId, WorkUnitError};
use tether_storage::BackingStore;

use crate::engine::SyncEngine;
use crate::live::LiveRecord;

/// An explicit unit-of-work handle.
///
/// The handle is cleared by [`complete`](WorkUnit::complete) whether or not
/// the persist succeeds, so a failed save never leaves a half-open batch
/// behind.
#[derive(Debug, Default)]
pub struct WorkUnit {
    open: Option<BTreeMap<RecordId, Arc<LiveRecord>>>,
}

impl WorkUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the unit of work. Fails fast if one is already open on this
    /// handle.
    pub fn begin(&mut self) -> Result<(), WorkUnitError> {
        if self.open.is_some() {
            return Err(WorkUnitError::AlreadyOpen);
        }
        self.open = Some(BTreeMap::new());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Add an instance to the open batch. A no-op if no unit of work is
    /// open; duplicate-safe while one is.
    pub fn add(&mut self, instance: &Arc<LiveRecord>) {
        if let Some(batch) = &mut self.open {
            batch.insert(instance.record_id(), Arc::clone(instance));
        }
    }

    /// Number of instances in the open batch; zero when closed.
    pub fn len(&self) -> usize {
        self.open.as_ref().map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete the unit of work, optionally persisting the batch. The
    /// handle is cleared first, so state is gone even if the persist
    /// fails.
    pub async fn complete<S: BackingStore>(
        &mut self,
        engine: &SyncEngine<S>,
        should_save: bool,
    ) -> Result<(), WorkUnitError> {
        let Some(batch) = self.open.take() else {
            return Ok(());
        };
        if should_save {
            let instances: Vec<Arc<LiveRecord>> = batch.into_values().collect();
            engine.persist(&instances).await?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_storage::MemoryStore;

    fn make_engine() -> SyncEngine<MemoryStore> {
        SyncEngine::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_begin_twice_fails_fast() {
        let mut unit = WorkUnit::new();
        unit.begin().expect("first begin");
        assert!(matches!(unit.begin(), Err(WorkUnitError::AlreadyOpen)));
        assert!(unit.is_open());
    }

    #[test]
    fn test_add_without_open_unit_is_noop() {
        let mut unit = WorkUnit::new();
        let instance = LiveRecord::new("orphan", "tester");
        unit.add(&instance);
        assert_eq!(unit.len(), 0);
        assert!(!unit.is_open());
    }

    #[test]
    fn test_add_is_duplicate_safe() {
        let mut unit = WorkUnit::new();
        unit.begin().expect("begin");
        let instance = LiveRecord::new("widget", "tester");
        unit.add(&instance);
        unit.add(&instance);
        assert_eq!(unit.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_without_save_discards_batch() {
        let engine = make_engine();
        let mut unit = WorkUnit::new();
        unit.begin().expect("begin");
        let instance = LiveRecord::new("discarded", "tester");
        unit.add(&instance);

        unit.complete(&engine, false).await.expect("complete");
        assert!(!unit.is_open());
        assert!(!instance.is_persisted());
        assert_eq!(engine.store().record_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_with_save_persists_batch() {
        let engine = make_engine();
        let mut unit = WorkUnit::new();
        unit.begin().expect("begin");
        let instance = LiveRecord::new("saved", "tester");
        unit.add(&instance);

        unit.complete(&engine, true).await.expect("complete");
        assert!(!unit.is_open());
        assert!(instance.is_persisted());
        assert_eq!(instance.known_version(), 1);
    }

    #[tokio::test]
    async fn test_complete_clears_state_even_when_persist_fails() {
        let engine = make_engine();

        // First writer commits version 1, then another writer moves the
        // store to version 2 behind this instance's back.
        let instance = LiveRecord::new("contended", "tester");
        engine.persist(&[Arc::clone(&instance)]).await.expect("persist");
        engine
            .store()
            .mutate(instance.record_id(), |_| {})
            .expect("mutate");
        instance.set_model_state(serde_json::json!({"mine": true}));

        let mut unit = WorkUnit::new();
        unit.begin().expect("begin");
        unit.add(&instance);

        let err = unit
            .complete(&engine, true)
            .await
            .expect_err("stale version must conflict");
        assert!(matches!(err, WorkUnitError::Conflict { .. }));

        // The handle is reusable immediately.
        assert!(!unit.is_open());
        unit.begin().expect("begin again");
    }
}
