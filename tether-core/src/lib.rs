//! TETHER Core - Record Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! A `Record` is the store-resident shape of a domain object: identity,
//! monotonically increasing version, modification timestamp, and the
//! relationship/view-state payloads the persistence layer round-trips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod staleness;

pub use error::{StoreError, TetherError, TetherResult, WorkUnitError};
pub use staleness::Staleness;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Record identifier using UUIDv7 for timestamp-sortable IDs.
pub type RecordId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Optimistic-lock version counter. Incremented by the store on every
/// successful commit that touches the record; never decremented.
pub type RecordVersion = i64;

/// Version assigned to a record that has never been committed.
pub const UNCOMMITTED_VERSION: RecordVersion = 0;

/// Generate a new UUIDv7 RecordId (timestamp-sortable).
pub fn new_record_id() -> RecordId {
    Uuid::now_v7()
}

// ============================================================================
// RECORD
// ============================================================================

/// A store-resident row: the persisted shape of a live object.
///
/// `version` and `modified_at` are owned by the store; callers never set
/// them directly. `references` holds the ids of related records, resolved
/// at persist time. `view_states` are sub-records keyed by `view_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    /// Display name shown in listings.
    pub name: String,
    /// Identity of the creator/owner.
    pub created_by: String,
    pub version: RecordVersion,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    /// Serialized model state. Absent on skeleton records that have been
    /// inserted but not yet fully updated.
    pub model_state: Option<serde_json::Value>,
    /// Ids of related records.
    pub references: Vec<RecordId>,
    /// Per-view sub-records, unique by `view_kind`.
    pub view_states: Vec<ViewState>,
}

impl Record {
    /// Look up a view state by kind.
    pub fn view_state(&self, view_kind: &str) -> Option<&ViewState> {
        self.view_states.iter().find(|v| v.view_kind == view_kind)
    }

    /// True if the record has never been through a full commit.
    pub fn is_skeleton(&self) -> bool {
        self.model_state.is_none() && self.version == UNCOMMITTED_VERSION
    }
}

/// A view-state sub-record, keyed by (record id, view kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub view_kind: String,
    pub payload: serde_json::Value,
    pub modified_at: Timestamp,
}

// =============================================================================
// TESTS
// =============================================================================
