//! Backing-store traits for TETHER.
//!
//! The engine consumes an abstract store exposing identity-keyed lookup,
//! range queries over the modification timestamp, and transactional commit
//! with optimistic version checks. Implementations must ensure that
//! [`ChangedPage::store_now`] is captured in the same snapshot as the page
//! it accompanies, so the poll cursor derived from it is consistent with
//! the records observed.

use async_trait::async_trait;
use std::collections::HashMap;
use tether_core::{Record, RecordId, RecordVersion, TetherResult, Timestamp};

/// One page of a change query, plus the store time observed in the same
/// snapshot.
#[derive(Debug, Clone)]
pub struct ChangedPage {
    /// Records whose `modified_at` falls inside the queried window,
    /// ordered by modification timestamp.
    pub records: Vec<Record>,
    /// The store's current time at the moment the page was produced.
    pub store_now: Timestamp,
}

/// Minimal record shape inserted during phase one of a persist, before
/// relationships and model state exist.
#[derive(Debug, Clone)]
pub struct SkeletonInsert {
    pub record_id: RecordId,
    pub name: String,
    pub created_by: String,
}

/// Full update staged during phase two of a persist.
///
/// `expected_version` is the version the caller last observed; commit fails
/// with a version conflict if the store has moved past it.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub record_id: RecordId,
    pub expected_version: RecordVersion,
    pub name: String,
    pub model_state: Option<serde_json::Value>,
    pub references: Vec<RecordId>,
}

/// View-state upsert, keyed by (record id, view kind).
#[derive(Debug, Clone)]
pub struct ViewStateUpsert {
    pub record_id: RecordId,
    pub view_kind: String,
    pub payload: serde_json::Value,
}

/// Outcome of a committed transaction: per-record committed state, used by
/// the work-unit manager to backfill live instances.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    committed: HashMap<RecordId, CommittedRecord>,
}

/// Committed version and timestamps for one record.
#[derive(Debug, Clone, Copy)]
pub struct CommittedRecord {
    pub version: RecordVersion,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
}

impl CommitReceipt {
    /// Record the committed state of one record.
    pub fn insert(&mut self, record_id: RecordId, committed: CommittedRecord) {
        self.committed.insert(record_id, committed);
    }

    /// Look up the committed state of one record.
    pub fn get(&self, record_id: RecordId) -> Option<&CommittedRecord> {
        self.committed.get(&record_id)
    }

    /// Number of records touched by the commit.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// True when the commit touched no records.
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

// ============================================================================
// BACKING STORE
// ============================================================================

/// The store abstraction consumed by the synchronization engine.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Transaction type produced by [`begin`](Self::begin).
    type Tx: StoreTransaction;

    /// Fetch a record by identity. Unknown ids yield `None`, not an error.
    async fn find_by_id(&self, record_id: RecordId) -> TetherResult<Option<Record>>;

    /// Query records whose `modified_at` lies in the inclusive window
    /// `[since, store-now]`, paged by `offset`/`limit`. The page carries
    /// the store time captured in the same snapshot.
    async fn changed_since(
        &self,
        since: Timestamp,
        offset: usize,
        limit: usize,
    ) -> TetherResult<ChangedPage>;

    /// The store's current time, scoped to the current caller. Returns
    /// `None` while no caller context has been established yet; the poller
    /// stays uninitialized until this answers.
    async fn current_time(&self) -> TetherResult<Option<Timestamp>>;

    /// Open a transaction for a batched persist.
    async fn begin(&self) -> TetherResult<Self::Tx>;
}

/// A store transaction accumulating staged work, applied atomically at
/// commit.
///
/// Reads within the transaction (`fetch`, `resolve_references`) observe
/// skeletons inserted earlier in the same transaction. This is what lets
/// phase two of a persist resolve references to records created in phase
/// one of the same batch.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert a minimal skeleton record. Inserting an id that already
    /// exists in the store is a no-op at commit.
    async fn insert_skeleton(&mut self, insert: SkeletonInsert) -> TetherResult<()>;

    /// Fetch a record as visible to this transaction.
    async fn fetch(&self, record_id: RecordId) -> TetherResult<Option<Record>>;

    /// Resolve a batch of referenced ids. Missing ids map to `None`, never
    /// an error; the caller drops them.
    async fn resolve_references(
        &self,
        record_ids: &[RecordId],
    ) -> TetherResult<Vec<Option<Record>>>;

    /// Stage a full update for commit.
    async fn stage_update(&mut self, update: RecordUpdate) -> TetherResult<()>;

    /// Stage a view-state upsert for commit.
    async fn stage_view_state(&mut self, upsert: ViewStateUpsert) -> TetherResult<()>;

    /// Atomically apply the staged work. Fails with
    /// [`StoreError::VersionConflict`](tether_core::StoreError) if any
    /// staged update's expected version no longer matches the store, in
    /// which case nothing is applied.
    async fn commit(self) -> TetherResult<CommitReceipt>;

    /// Discard the staged work.
    async fn rollback(self) -> TetherResult<()>;
}
