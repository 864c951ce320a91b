//! Change Poller Background Task
//!
//! Periodically scans the backing store for records modified since the
//! last successful poll and hands each one to the staleness propagator.
//!
//! The cursor is advanced only on a cycle that completes without error, to
//! the store time captured in the same snapshot as the final page. A failed
//! cycle leaves the cursor where it was, so the next cycle re-covers the
//! same window: duplicate staleness notifications are possible (and the
//! propagator is idempotent for exactly this reason), missed changes are
//! not.
//!
//! # Usage
//!
//! The poller is typically spawned during startup:
//!
//! ```ignore
//! use tether_engine::{poller_task, ChangePoller, PollerConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let poller = Arc::new(ChangePoller::new(store, propagator, registry, config));
//! tokio::spawn(poller_task(poller, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use tether_core::Timestamp;
use tether_storage::BackingStore;

use crate::propagator::StalenessPropagator;
use crate::registry::LiveRegistry;

const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
const DEFAULT_PAGE_SIZE: usize = 500;
const DEFAULT_SWEEP_EVERY: u64 = 1000;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the change poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often to poll the store for changes (default: 3 seconds).
    pub poll_interval: Duration,

    /// Page size for the change query; cycles page until a short page is
    /// returned (default: 500).
    pub page_size: usize,

    /// Run a registry sweep every this many successful cycles
    /// (default: 1000). The sweep is O(entries × refs), which is why it
    /// does not run every cycle.
    pub sweep_every: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            page_size: DEFAULT_PAGE_SIZE,
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PollerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TETHER_POLL_INTERVAL_MS`: poll period in milliseconds (default: 3000)
    /// - `TETHER_POLL_PAGE_SIZE`: change-query page size (default: 500)
    /// - `TETHER_POLL_SWEEP_EVERY`: cycles between registry sweeps (default: 1000)
    pub fn from_env() -> Self {
        let poll_interval = Duration::from_millis(
            std::env::var("TETHER_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );

        let page_size = std::env::var("TETHER_POLL_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let sweep_every = std::env::var("TETHER_POLL_SWEEP_EVERY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SWEEP_EVERY);

        Self {
            poll_interval,
            page_size,
            sweep_every,
        }
    }

    /// Configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            page_size: 10,
            sweep_every: 4,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_sweep_every(mut self, sweep_every: u64) -> Self {
        self.sweep_every = sweep_every;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters tracking poller activity.
#[derive(Debug, Default)]
pub struct PollerMetrics {
    /// Cycles that completed and advanced the cursor.
    pub cycles_completed: AtomicU64,
    /// Cycles skipped because the store could not answer `current_time`.
    pub cycles_skipped: AtomicU64,
    /// Cycles aborted by a store error, cursor unchanged.
    pub cycles_failed: AtomicU64,
    /// Records observed in the change stream (re-deliveries included).
    pub records_observed: AtomicU64,
    /// Instances newly marked stale.
    pub instances_marked_stale: AtomicU64,
    /// Registry sweeps run.
    pub sweeps: AtomicU64,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            records_observed: self.records_observed.load(Ordering::Relaxed),
            instances_marked_stale: self.instances_marked_stale.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of poller metrics at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct PollerSnapshot {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub cycles_failed: u64,
    pub records_observed: u64,
    pub instances_marked_stale: u64,
    pub sweeps: u64,
}

// ============================================================================
// POLLER
// ============================================================================

/// Scans the store for changes and drives the staleness propagator.
///
/// State machine: `UNINITIALIZED -> ACTIVE`. The cursor is initialized on
/// the first cycle that can observe the store's current time; until then
/// cycles are skipped entirely.
#[derive(Debug)]
pub struct ChangePoller<S: BackingStore> {
    store: Arc<S>,
    propagator: StalenessPropagator,
    registry: Arc<LiveRegistry>,
    config: PollerConfig,
    /// `None` while uninitialized. Written only by poll cycles; advanced
    /// only on success, monotonically non-decreasing.
    cursor: Mutex<Option<Timestamp>>,
    metrics: Arc<PollerMetrics>,
}

impl<S: BackingStore> ChangePoller<S> {
    pub fn new(
        store: Arc<S>,
        propagator: StalenessPropagator,
        registry: Arc<LiveRegistry>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            propagator,
            registry,
            config,
            cursor: Mutex::new(None),
            metrics: Arc::new(PollerMetrics::new()),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PollerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The last successfully observed poll time; `None` while the poller
    /// is uninitialized.
    pub fn last_poll_time(&self) -> Option<Timestamp> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_cursor(&self, value: Timestamp) {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        *cursor = Some(cursor.map_or(value, |current| current.max(value)));
    }

    /// Run one poll cycle. Never returns an error: failures are logged,
    /// counted, and leave the cursor unchanged so the next cycle re-covers
    /// the same window.
    pub async fn run_cycle(&self) {
        let since = match self.last_poll_time() {
            Some(cursor) => cursor,
            None => match self.store.current_time().await {
                Ok(Some(store_now)) => {
                    self.set_cursor(store_now);
                    store_now
                }
                Ok(None) => {
                    // No caller context yet; stay uninitialized.
                    tracing::trace!("store time unavailable, polling skipped");
                    self.metrics.cycles_skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to initialize poll cursor");
                    self.metrics.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

        let mut latest = since;
        let mut offset = 0usize;
        loop {
            let page = match self
                .store
                .changed_since(since, offset, self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    // Abort without advancing the cursor; the next cycle
                    // re-scans the same window.
                    tracing::warn!(error = %e, offset, "change query failed, cycle aborted");
                    self.metrics.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            latest = latest.max(page.store_now);
            let page_len = page.records.len();
            for record in &page.records {
                let marked = self.propagator.on_record_changed(record);
                self.metrics.records_observed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .instances_marked_stale
                    .fetch_add(marked as u64, Ordering::Relaxed);
            }

            if page_len < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
        }

        self.set_cursor(latest);
        let completed = self
            .metrics
            .cycles_completed
            .fetch_add(1, Ordering::Relaxed)
            + 1;

        if completed % self.config.sweep_every == 0 {
            let removed = self.registry.sweep();
            self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(removed, "registry sweep completed");
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Recurring poll loop. Runs until the shutdown signal is received, then
/// returns the poller's metrics handle.
///
/// The first tick fires immediately; ticks missed while a cycle is running
/// are skipped rather than bursted.
pub async fn poller_task<S: BackingStore>(
    poller: Arc<ChangePoller<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<PollerMetrics> {
    let mut tick = interval(poller.config().poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        poll_interval_ms = poller.config().poll_interval.as_millis() as u64,
        page_size = poller.config().page_size,
        sweep_every = poller.config().sweep_every,
        "Change poller started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Change poller shutting down");
                    break;
                }
            }
            _ = tick.tick() => {
                poller.run_cycle().await;
            }
        }
    }

    let snapshot = poller.metrics().snapshot();
    tracing::info!(
        cycles_completed = snapshot.cycles_completed,
        cycles_failed = snapshot.cycles_failed,
        records_observed = snapshot.records_observed,
        instances_marked_stale = snapshot.instances_marked_stale,
        sweeps = snapshot.sweeps,
        "Change poller stopped"
    );

    poller.metrics()
}

// =============================================================================
// TESTS
// =============================================================================
