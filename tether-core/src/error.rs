//! Error types for TETHER operations

use thiserror::Error;

use crate::{RecordId, RecordVersion};

/// Backing-store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {record_id}")]
    NotFound { record_id: RecordId },

    #[error("Version conflict on {record_id}: expected {expected}, store has {actual}")]
    VersionConflict {
        record_id: RecordId,
        expected: RecordVersion,
        actual: RecordVersion,
    },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Work-unit and persistence errors, surfaced at the unit-of-work boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkUnitError {
    /// Programmer error: a second work unit was opened on a context before
    /// the first completed. Fails fast rather than silently queuing.
    #[error("A work unit is already open on this context")]
    AlreadyOpen,

    /// Someone else committed a newer version of this record. The caller
    /// should reload and retry; the engine never retries on its own.
    #[error("Record {record_id} was changed by someone else (expected version {expected}, store has {actual})")]
    Conflict {
        record_id: RecordId,
        expected: RecordVersion,
        actual: RecordVersion,
    },

    #[error("Store error during persist: {0}")]
    Store(#[from] StoreError),
}

/// Master error type for all TETHER errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TetherError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Work unit error: {0}")]
    WorkUnit(#[from] WorkUnitError),
}

/// Result type alias for TETHER operations.
pub type TetherResult<T> = Result<T, TetherError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_error_display_not_found() {
        let err = StoreError::NotFound {
            record_id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Record not found"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_store_error_display_version_conflict() {
        let err = StoreError::VersionConflict {
            record_id: Uuid::nil(),
            expected: 3,
            actual: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Version conflict"));
        assert!(msg.contains('3'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_work_unit_conflict_names_the_other_writer() {
        let err = WorkUnitError::Conflict {
            record_id: Uuid::nil(),
            expected: 1,
            actual: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("changed by someone else"));
    }

    #[test]
    fn test_tether_error_from_variants() {
        let store = TetherError::from(StoreError::LockPoisoned);
        assert!(matches!(store, TetherError::Store(_)));

        let work_unit = TetherError::from(WorkUnitError::AlreadyOpen);
        assert!(matches!(work_unit, TetherError::WorkUnit(_)));
    }

    #[test]
    fn test_work_unit_error_wraps_store_error() {
        let err = WorkUnitError::from(StoreError::Unavailable {
            reason: "connection dropped".to_string(),
        });
        assert!(matches!(err, WorkUnitError::Store(_)));
        assert!(format!("{}", err).contains("connection dropped"));
    }
}
