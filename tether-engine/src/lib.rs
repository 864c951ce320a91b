//! TETHER Engine - Live-Object Synchronization
//!
//! Keeps in-memory instances of persisted records consistent with a backing
//! store that other processes mutate concurrently, without requiring every
//! read to hit the store:
//!
//! - [`LiveRegistry`]: weak-keyed registry of live instances by record id
//! - [`ChangePoller`]: periodic scan of the store for records changed since
//!   the last poll
//! - [`StalenessPropagator`]: marks live instances stale, cascades to
//!   work-unit delegates, evicts the second-level record cache
//! - [`WorkUnit`] + [`SyncEngine::persist`]: batched two-phase persistence
//!   with optimistic locking
//! - [`StepBehindCache`]: generic immediate-read, async-refresh value cache
//!
//! The engine talks to storage only through the
//! [`BackingStore`](tether_storage::BackingStore) abstraction.

pub mod engine;
pub mod live;
pub mod poller;
pub mod propagator;
pub mod registry;
pub mod step_behind;
pub mod work_unit;

pub use engine::{PollerHandle, SyncEngine};
pub use live::LiveRecord;
pub use poller::{poller_task, ChangePoller, PollerConfig, PollerMetrics, PollerSnapshot};
pub use propagator::StalenessPropagator;
pub use registry::LiveRegistry;
pub use step_behind::{StepBehindCache, ValueSource};
pub use work_unit::WorkUnit;
