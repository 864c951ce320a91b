//! Live instances of persisted records.
//!
//! A [`LiveRecord`] is the in-memory materialization of a store record,
//! owned by whatever application code holds the `Arc`. The registry keeps
//! only weak references, so an instance is collectable as soon as its last
//! owner drops it.
//!
//! Staleness marking and the became-stale notification happen under the
//! instance's state lock: a concurrent reader of the instance either sees
//! the state from before the mark or the fully marked state, never a
//! partial update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::watch;

use tether_core::{
    new_record_id, Record, RecordId, RecordVersion, Staleness, Timestamp, UNCOMMITTED_VERSION,
};
use tether_storage::CommittedRecord;

/// Snapshot of a live instance's draft state, taken under the state lock
/// at persist time.
#[derive(Debug, Clone)]
pub struct PersistSnapshot {
    pub name: String,
    pub created_by: String,
    pub expected_version: RecordVersion,
    pub model_state: Option<serde_json::Value>,
    pub references: Vec<RecordId>,
    pub view_states: Vec<(String, serde_json::Value)>,
    pub is_persisted: bool,
}

#[derive(Debug)]
struct LiveState {
    name: String,
    created_by: String,
    version: RecordVersion,
    created_at: Option<Timestamp>,
    staleness: Staleness,
    model_state: Option<serde_json::Value>,
    references: Vec<RecordId>,
    view_states: BTreeMap<String, serde_json::Value>,
}

/// An in-memory instance of a record.
///
/// Multiple live instances may exist for the same record id (for example,
/// one per open view); each carries its own staleness mark and its own
/// notification channel.
#[derive(Debug)]
pub struct LiveRecord {
    record_id: RecordId,
    state: Mutex<LiveState>,
    stale_tx: watch::Sender<Staleness>,
    /// One-level, non-owning work-unit delegate. Marked `Always` stale
    /// whenever this instance changes under it.
    delegate: RwLock<Option<Weak<LiveRecord>>>,
}

impl LiveRecord {
    /// Create a brand-new instance that has never been persisted.
    pub fn new(name: impl Into<String>, created_by: impl Into<String>) -> Arc<Self> {
        let (stale_tx, _) = watch::channel(Staleness::Fresh);
        Arc::new(Self {
            record_id: new_record_id(),
            state: Mutex::new(LiveState {
                name: name.into(),
                created_by: created_by.into(),
                version: UNCOMMITTED_VERSION,
                created_at: None,
                staleness: Staleness::Fresh,
                model_state: None,
                references: Vec::new(),
                view_states: BTreeMap::new(),
            }),
            stale_tx,
            delegate: RwLock::new(None),
        })
    }

    /// Materialize an instance from a fetched record.
    pub fn from_record(record: &Record) -> Arc<Self> {
        let (stale_tx, _) = watch::channel(Staleness::Fresh);
        Arc::new(Self {
            record_id: record.record_id,
            state: Mutex::new(LiveState {
                name: record.name.clone(),
                created_by: record.created_by.clone(),
                version: record.version,
                created_at: Some(record.created_at),
                staleness: Staleness::Fresh,
                model_state: record.model_state.clone(),
                references: record.references.clone(),
                view_states: record
                    .view_states
                    .iter()
                    .map(|v| (v.view_kind.clone(), v.payload.clone()))
                    .collect(),
            }),
            stale_tx,
            delegate: RwLock::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state().name = name.into();
    }

    pub fn created_by(&self) -> String {
        self.state().created_by.clone()
    }

    /// The version this instance last observed from the store.
    pub fn known_version(&self) -> RecordVersion {
        self.state().version
    }

    /// Commit timestamp backfilled after the first successful persist;
    /// `None` means the instance has never been persisted.
    pub fn created_at(&self) -> Option<Timestamp> {
        self.state().created_at
    }

    pub fn is_persisted(&self) -> bool {
        self.state().created_at.is_some()
    }

    pub fn staleness(&self) -> Staleness {
        self.state().staleness
    }

    pub fn is_stale(&self) -> bool {
        self.state().staleness.is_stale()
    }

    /// Subscribe to staleness transitions. The receiver observes the
    /// current mark immediately and every change after it, including the
    /// reset to `Fresh` on a successful save.
    pub fn subscribe(&self) -> watch::Receiver<Staleness> {
        self.stale_tx.subscribe()
    }

    // ========================================================================
    // DRAFT STATE
    // ========================================================================

    pub fn model_state(&self) -> Option<serde_json::Value> {
        self.state().model_state.clone()
    }

    pub fn set_model_state(&self, model_state: serde_json::Value) {
        self.state().model_state = Some(model_state);
    }

    pub fn references(&self) -> Vec<RecordId> {
        self.state().references.clone()
    }

    /// Add a reference to another record. Duplicate-safe.
    pub fn add_reference(&self, record_id: RecordId) {
        let mut state = self.state();
        if !state.references.contains(&record_id) {
            state.references.push(record_id);
        }
    }

    pub fn set_references(&self, references: Vec<RecordId>) {
        self.state().references = references;
    }

    /// Set the draft view state for one view kind.
    pub fn set_view_state(&self, view_kind: impl Into<String>, payload: serde_json::Value) {
        self.state().view_states.insert(view_kind.into(), payload);
    }

    // ========================================================================
    // DELEGATE
    // ========================================================================

    /// Attach a work-unit delegate. The association is non-owning.
    pub fn set_delegate(&self, delegate: &Arc<LiveRecord>) {
        if let Ok(mut slot) = self.delegate.write() {
            *slot = Some(Arc::downgrade(delegate));
        }
    }

    pub fn clear_delegate(&self) {
        if let Ok(mut slot) = self.delegate.write() {
            *slot = None;
        }
    }

    /// The delegate, if one is attached and still alive. A delegate that
    /// died since attachment reads as `None`.
    pub fn delegate(&self) -> Option<Arc<LiveRecord>> {
        self.delegate
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }

    // ========================================================================
    // STALENESS / SAVE TRANSITIONS
    // ========================================================================

    /// Merge a staleness mark into this instance. Returns true if the mark
    /// changed the instance's state; repeating the same or a weaker mark is
    /// a no-op and does not notify subscribers.
    pub fn mark_stale(&self, incoming: Staleness) -> bool {
        let mut state = self.state();
        let merged = state.staleness.merged(incoming);
        if merged == state.staleness {
            return false;
        }
        state.staleness = merged;
        // Notify while the state lock is held so mark and notification are
        // one scoped transition for concurrent readers of this instance.
        let _ = self.stale_tx.send(merged);
        true
    }

    /// Backfill committed state after a successful persist and reset the
    /// staleness mark.
    pub fn mark_saved(&self, committed: &CommittedRecord) {
        let mut state = self.state();
        state.version = committed.version;
        state.created_at.get_or_insert(committed.created_at);
        state.staleness = Staleness::Fresh;
        let _ = self.stale_tx.send(Staleness::Fresh);
    }

    /// Snapshot the draft state for the persist protocol.
    pub fn persist_snapshot(&self) -> PersistSnapshot {
        let state = self.state();
        PersistSnapshot {
            name: state.name.clone(),
            created_by: state.created_by.clone(),
            expected_version: state.version,
            model_state: state.model_state.clone(),
            references: state.references.clone(),
            view_states: state
                .view_states
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            is_persisted: state.created_at.is_some(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
