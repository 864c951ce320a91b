//! Engine facade wiring the registry, second-level cache, and persistence
//! protocol over one backing store.
//!
//! `persist` implements the two-phase batched protocol: phase one inserts
//! minimal skeleton records for instances that have never been persisted,
//! so that phase two's reference resolution can find every participant by
//! id, including records created within the same batch. Relationships are
//! only resolvable once every participant has an identity in the store;
//! the skeleton pass avoids having to order the batch by dependency graph.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tether_core::{RecordId, StoreError, TetherError, TetherResult, WorkUnitError};
use tether_storage::{
    BackingStore, RecordCache, RecordUpdate, SkeletonInsert, StoreTransaction, ViewStateUpsert,
};

use crate::live::LiveRecord;
use crate::poller::{poller_task, ChangePoller, PollerConfig, PollerMetrics};
use crate::propagator::StalenessPropagator;
use crate::registry::LiveRegistry;

/// The synchronization engine for one backing store.
pub struct SyncEngine<S: BackingStore> {
    store: Arc<S>,
    registry: Arc<LiveRegistry>,
    record_cache: Arc<RecordCache>,
}

impl<S: BackingStore> SyncEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: Arc::new(LiveRegistry::new()),
            record_cache: Arc::new(RecordCache::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }

    pub fn record_cache(&self) -> &Arc<RecordCache> {
        &self.record_cache
    }

    /// Create a brand-new instance. It is registered into the live
    /// registry when it is first persisted, not before.
    pub fn create(&self, name: impl Into<String>, created_by: impl Into<String>) -> Arc<LiveRecord> {
        LiveRecord::new(name, created_by)
    }

    /// Fetch a record by id and materialize a fresh live instance for it,
    /// registering the instance into the live registry. Served from the
    /// second-level cache when possible. Unknown ids yield `None`.
    pub async fn fetch(&self, record_id: RecordId) -> TetherResult<Option<Arc<LiveRecord>>> {
        let record = match self.record_cache.get(record_id) {
            Some(record) => record,
            None => match self.store.find_by_id(record_id).await? {
                Some(record) => {
                    self.record_cache.put(record.clone());
                    record
                }
                None => return Ok(None),
            },
        };

        let instance = LiveRecord::from_record(&record);
        self.registry.register(&instance);
        Ok(Some(instance))
    }

    /// Persist a batch of instances in one store transaction using the
    /// two-phase protocol. Duplicates collapse; the batch is processed in
    /// record-id order.
    ///
    /// On success every instance is notified of the save, backfilled with
    /// its committed version and creation timestamp, and registered into
    /// the live registry. On an optimistic-lock conflict the store-level
    /// error is translated to [`WorkUnitError::Conflict`], the transaction
    /// is rolled back, and no instance state is mutated. The engine never
    /// retries; that choice belongs to the caller.
    pub async fn persist(&self, instances: &[Arc<LiveRecord>]) -> Result<(), WorkUnitError> {
        if instances.is_empty() {
            return Ok(());
        }

        let mut ordered: BTreeMap<RecordId, Arc<LiveRecord>> = BTreeMap::new();
        for instance in instances {
            ordered.insert(instance.record_id(), Arc::clone(instance));
        }

        let mut tx = self.store.begin().await.map_err(translate)?;
        if let Err(e) = stage_batch(&mut tx, &ordered).await {
            let _ = tx.rollback().await;
            return Err(translate(e));
        }

        let receipt = tx.commit().await.map_err(translate)?;

        for (record_id, instance) in &ordered {
            if let Some(committed) = receipt.get(*record_id) {
                instance.mark_saved(committed);
                self.registry.register(instance);
            }
        }
        Ok(())
    }

    /// Spawn the recurring change poller for this engine.
    pub fn spawn_poller(&self, config: PollerConfig) -> PollerHandle<S> {
        let propagator = StalenessPropagator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.record_cache),
        );
        let poller = Arc::new(ChangePoller::new(
            Arc::clone(&self.store),
            propagator,
            Arc::clone(&self.registry),
            config,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(poller_task(Arc::clone(&poller), shutdown_rx));
        PollerHandle {
            poller,
            shutdown_tx,
            join,
        }
    }
}

/// Phase one and two of the persist protocol, staged on one transaction.
async fn stage_batch<Tx: StoreTransaction>(
    tx: &mut Tx,
    ordered: &BTreeMap<RecordId, Arc<LiveRecord>>,
) -> TetherResult<()> {
    // Phase 1: skeletons for instances that have never been persisted, so
    // phase 2 can resolve intra-batch forward references by id.
    for (record_id, instance) in ordered {
        if !instance.is_persisted() {
            tx.insert_skeleton(SkeletonInsert {
                record_id: *record_id,
                name: instance.name(),
                created_by: instance.created_by(),
            })
            .await?;
        }
    }

    // Phase 2: full updates. A reference whose record cannot be found
    // (deleted concurrently) is dropped, not an error.
    for (record_id, instance) in ordered {
        let snapshot = instance.persist_snapshot();
        let resolved = tx.resolve_references(&snapshot.references).await?;
        let references: Vec<RecordId> = snapshot
            .references
            .iter()
            .zip(resolved)
            .filter_map(|(id, record)| record.map(|_| *id))
            .collect();

        tx.stage_update(RecordUpdate {
            record_id: *record_id,
            expected_version: snapshot.expected_version,
            name: snapshot.name,
            model_state: snapshot.model_state,
            references,
        })
        .await?;

        for (view_kind, payload) in snapshot.view_states {
            tx.stage_view_state(ViewStateUpsert {
                record_id: *record_id,
                view_kind,
                payload,
            })
            .await?;
        }
    }
    Ok(())
}

/// Translate store-level errors into the work-unit taxonomy at the persist
/// boundary.
fn translate(err: TetherError) -> WorkUnitError {
    match err {
        TetherError::Store(StoreError::VersionConflict {
            record_id,
            expected,
            actual,
        }) => WorkUnitError::Conflict {
            record_id,
            expected,
            actual,
        },
        TetherError::Store(e) => WorkUnitError::Store(e),
        TetherError::WorkUnit(e) => e,
    }
}

/// Handle to a spawned poller: access to its metrics and cursor, plus
/// graceful shutdown.
pub struct PollerHandle<S: BackingStore> {
    poller: Arc<ChangePoller<S>>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Arc<PollerMetrics>>,
}

impl<S: BackingStore> PollerHandle<S> {
    pub fn poller(&self) -> &Arc<ChangePoller<S>> {
        &self.poller
    }

    /// Signal shutdown and wait for the loop to stop, returning its
    /// metrics.
    pub async fn shutdown(self) -> Arc<PollerMetrics> {
        let _ = self.shutdown_tx.send(true);
        match self.join.await {
            Ok(metrics) => metrics,
            Err(_) => self.poller.metrics(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
