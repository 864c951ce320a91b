//! In-memory reference implementation of the backing store.
//!
//! Backed by a `RwLock<HashMap>`; every commit takes the write lock once,
//! validates all optimistic version checks, and only then applies the
//! staged work, so a conflicting commit leaves the store untouched.
//!
//! This is the store used by the test suites and by single-process
//! deployments that do not need durability.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tether_core::{
    Record, RecordId, RecordVersion, StoreError, TetherResult, Timestamp, ViewState,
    UNCOMMITTED_VERSION,
};

use crate::store::{
    BackingStore, ChangedPage, CommitReceipt, CommittedRecord, RecordUpdate, SkeletonInsert,
    StoreTransaction, ViewStateUpsert,
};

/// In-memory backing store.
#[derive(Debug)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<RecordId, Record>>>,
    /// Store time is scoped to the current caller; until a caller context
    /// exists the store cannot answer `current_time`.
    caller_ready: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a store with an established caller context.
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            caller_ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a store whose caller context is not yet established, so
    /// `current_time` answers `None` until [`set_caller_context`] is
    /// called. Pollers against such a store stay uninitialized.
    ///
    /// [`set_caller_context`]: MemoryStore::set_caller_context
    pub fn without_caller_context() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            caller_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Establish or drop the caller context.
    pub fn set_caller_context(&self, ready: bool) {
        self.caller_ready.store(ready, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Apply a store-side mutation as another process would: run the
    /// closure, then bump the version and modification timestamp. Returns
    /// the new version.
    pub fn mutate(
        &self,
        record_id: RecordId,
        f: impl FnOnce(&mut Record),
    ) -> TetherResult<RecordVersion> {
        let mut records = self.write_records()?;
        let record = records
            .get_mut(&record_id)
            .ok_or(StoreError::NotFound { record_id })?;
        f(record);
        record.version += 1;
        record.modified_at = Utc::now();
        Ok(record.version)
    }

    fn read_records(&self) -> TetherResult<RwLockReadGuard<'_, HashMap<RecordId, Record>>> {
        self.records
            .read()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    fn write_records(&self) -> TetherResult<RwLockWriteGuard<'_, HashMap<RecordId, Record>>> {
        self.records
            .write()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn find_by_id(&self, record_id: RecordId) -> TetherResult<Option<Record>> {
        let records = self.read_records()?;
        Ok(records.get(&record_id).cloned())
    }

    async fn changed_since(
        &self,
        since: Timestamp,
        offset: usize,
        limit: usize,
    ) -> TetherResult<ChangedPage> {
        let records = self.read_records()?;
        let store_now = Utc::now();

        // Inclusive window on both ends; the poller re-covers the boundary
        // instant on its next cycle rather than risking a missed change.
        let mut changed: Vec<Record> = records
            .values()
            .filter(|r| r.modified_at >= since && r.modified_at <= store_now)
            .cloned()
            .collect();
        changed.sort_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then(a.record_id.cmp(&b.record_id))
        });

        let page = changed.into_iter().skip(offset).take(limit).collect();
        Ok(ChangedPage {
            records: page,
            store_now,
        })
    }

    async fn current_time(&self) -> TetherResult<Option<Timestamp>> {
        if self.caller_ready.load(Ordering::SeqCst) {
            Ok(Some(Utc::now()))
        } else {
            Ok(None)
        }
    }

    async fn begin(&self) -> TetherResult<MemoryTransaction> {
        Ok(MemoryTransaction {
            records: Arc::clone(&self.records),
            skeletons: Vec::new(),
            updates: Vec::new(),
            view_states: Vec::new(),
        })
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// Staged transaction over a [`MemoryStore`].
///
/// Reads observe skeletons staged earlier in the same transaction, which is
/// what the two-phase persist protocol relies on for intra-batch forward
/// references.
#[derive(Debug)]
pub struct MemoryTransaction {
    records: Arc<RwLock<HashMap<RecordId, Record>>>,
    skeletons: Vec<SkeletonInsert>,
    updates: Vec<RecordUpdate>,
    view_states: Vec<ViewStateUpsert>,
}

impl MemoryTransaction {
    fn read_records(&self) -> TetherResult<RwLockReadGuard<'_, HashMap<RecordId, Record>>> {
        self.records
            .read()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    /// Transaction-visible view of one record: committed state overlaid
    /// with staged skeletons.
    fn visible(
        &self,
        committed: &HashMap<RecordId, Record>,
        record_id: RecordId,
    ) -> Option<Record> {
        if let Some(record) = committed.get(&record_id) {
            return Some(record.clone());
        }
        self.skeletons
            .iter()
            .find(|s| s.record_id == record_id)
            .map(|s| skeleton_record(s, Utc::now()))
    }
}

fn skeleton_record(insert: &SkeletonInsert, now: Timestamp) -> Record {
    Record {
        record_id: insert.record_id,
        name: insert.name.clone(),
        created_by: insert.created_by.clone(),
        version: UNCOMMITTED_VERSION,
        created_at: now,
        modified_at: now,
        model_state: None,
        references: Vec::new(),
        view_states: Vec::new(),
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_skeleton(&mut self, insert: SkeletonInsert) -> TetherResult<()> {
        self.skeletons.push(insert);
        Ok(())
    }

    async fn fetch(&self, record_id: RecordId) -> TetherResult<Option<Record>> {
        let committed = self.read_records()?;
        Ok(self.visible(&committed, record_id))
    }

    async fn resolve_references(
        &self,
        record_ids: &[RecordId],
    ) -> TetherResult<Vec<Option<Record>>> {
        let committed = self.read_records()?;
        Ok(record_ids
            .iter()
            .map(|id| self.visible(&committed, *id))
            .collect())
    }

    async fn stage_update(&mut self, update: RecordUpdate) -> TetherResult<()> {
        self.updates.push(update);
        Ok(())
    }

    async fn stage_view_state(&mut self, upsert: ViewStateUpsert) -> TetherResult<()> {
        self.view_states.push(upsert);
        Ok(())
    }

    async fn commit(self) -> TetherResult<CommitReceipt> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        // Validate every optimistic check before applying anything, so a
        // conflicting commit leaves the store untouched.
        for update in &self.updates {
            let current = match records.get(&update.record_id) {
                Some(record) => record.version,
                None if self
                    .skeletons
                    .iter()
                    .any(|s| s.record_id == update.record_id) =>
                {
                    UNCOMMITTED_VERSION
                }
                None => {
                    return Err(StoreError::NotFound {
                        record_id: update.record_id,
                    }
                    .into())
                }
            };
            if current != update.expected_version {
                return Err(StoreError::VersionConflict {
                    record_id: update.record_id,
                    expected: update.expected_version,
                    actual: current,
                }
                .into());
            }
        }

        let now = Utc::now();
        let mut receipt = CommitReceipt::default();
        let mut touched: Vec<RecordId> = self.skeletons.iter().map(|s| s.record_id).collect();
        touched.extend(self.updates.iter().map(|u| u.record_id));

        for skeleton in &self.skeletons {
            records
                .entry(skeleton.record_id)
                .or_insert_with(|| skeleton_record(skeleton, now));
        }

        for update in self.updates {
            // Present by construction: validated above against committed
            // state or a skeleton applied just before.
            if let Some(record) = records.get_mut(&update.record_id) {
                record.name = update.name;
                record.model_state = update.model_state;
                record.references = update.references;
                record.version = update.expected_version + 1;
                record.modified_at = now;
            }
        }

        for upsert in self.view_states {
            // Unknown ids are dropped, matching the dangling-reference
            // tolerance of the persist protocol.
            if let Some(record) = records.get_mut(&upsert.record_id) {
                match record
                    .view_states
                    .iter_mut()
                    .find(|v| v.view_kind == upsert.view_kind)
                {
                    Some(existing) => {
                        existing.payload = upsert.payload;
                        existing.modified_at = now;
                    }
                    None => record.view_states.push(ViewState {
                        view_kind: upsert.view_kind,
                        payload: upsert.payload,
                        modified_at: now,
                    }),
                }
            }
        }

        for record_id in touched {
            if let Some(record) = records.get(&record_id) {
                receipt.insert(
                    record_id,
                    CommittedRecord {
                        version: record.version,
                        created_at: record.created_at,
                        modified_at: record.modified_at,
                    },
                );
            }
        }

        Ok(receipt)
    }

    async fn rollback(self) -> TetherResult<()> {
        // Staged work is dropped with the transaction.
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
