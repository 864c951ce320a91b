//! TETHER Storage - Backing Store Abstraction
//!
//! Defines the store abstraction the synchronization engine runs against:
//! identity-keyed lookup, timestamp-window change queries, and transactional
//! commit with optimistic version checks. The in-memory reference
//! implementation lives in [`memory`]; relational backends implement the
//! same traits out of tree.
//!
//! No SQL dialect is assumed anywhere in this crate. The engine needs only
//! the contract captured by [`BackingStore`] and [`StoreTransaction`].

pub mod memory;
pub mod record_cache;
pub mod store;

pub use memory::{MemoryStore, MemoryTransaction};
pub use record_cache::{CacheStats, RecordCache};
pub use store::{
    BackingStore, ChangedPage, CommitReceipt, CommittedRecord, RecordUpdate, SkeletonInsert,
    StoreTransaction, ViewStateUpsert,
};
