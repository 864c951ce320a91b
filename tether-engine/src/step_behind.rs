//! Step-behind value cache.
//!
//! A single-slot cache for one computed value, used wherever a cheap,
//! slightly-stale read is preferable to blocking on a remote lookup. The
//! first `get` loads synchronously; every later `get` returns the cached
//! value immediately and, if the refresh period has elapsed since the last
//! refresh was *initiated*, kicks off a fire-and-forget background refresh.
//!
//! Staleness is bounded only probabilistically: a value can be up to one
//! extra call interval stale when the background refresh is slow. That is
//! the documented trade-off, as is swallowing background refresh failures
//! and keeping the previous value.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use tether_core::TetherResult;

/// Default refresh period.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_millis(1000);

/// Source of the cached value.
#[async_trait]
pub trait ValueSource<T>: Send + Sync {
    /// Compute or fetch the current value.
    async fn load(&self) -> TetherResult<T>;
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    /// When the last refresh was initiated (not completed). Recording the
    /// initiation time up front prevents overlapping refreshes from rapid
    /// repeated calls.
    refresh_initiated: Option<Instant>,
}

/// Single-slot cache with immediate stale reads and asynchronous refresh.
///
/// Each instance throttles its own refreshes independently; there is no
/// shared pool or cap across instances.
pub struct StepBehindCache<T, S> {
    source: Arc<S>,
    period: Duration,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T, S> StepBehindCache<T, S>
where
    T: Clone + Send + 'static,
    S: ValueSource<T> + 'static,
{
    /// Create a cache with the default refresh period.
    pub fn new(source: S) -> Self {
        Self::with_period(source, DEFAULT_REFRESH_PERIOD)
    }

    /// Create a cache with an explicit refresh period.
    pub fn with_period(source: S, period: Duration) -> Self {
        Self {
            source: Arc::new(source),
            period,
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                refresh_initiated: None,
            })),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Get the cached value.
    ///
    /// The very first call loads synchronously and propagates the source's
    /// error. Once a value has been cached, `get` never blocks on the
    /// source again: it returns the cached value and at most spawns a
    /// background refresh whose failure keeps the previous value.
    pub async fn get(&self) -> TetherResult<T> {
        let mut slot = self.slot.lock().await;
        match slot.value.clone() {
            Some(value) => {
                let refresh_due = slot
                    .refresh_initiated
                    .map_or(true, |initiated| initiated.elapsed() >= self.period);
                if refresh_due {
                    slot.refresh_initiated = Some(Instant::now());
                    let source = Arc::clone(&self.source);
                    let slot_handle = Arc::clone(&self.slot);
                    tokio::spawn(async move {
                        match source.load().await {
                            Ok(fresh) => {
                                slot_handle.lock().await.value = Some(fresh);
                            }
                            Err(e) => {
                                // Contract: keep the previous value, never
                                // surface the failure to readers.
                                tracing::debug!(error = %e, "step-behind refresh failed");
                            }
                        }
                    });
                }
                Ok(value)
            }
            None => {
                let value = self.source.load().await?;
                slot.value = Some(value.clone());
                slot.refresh_initiated = Some(Instant::now());
                Ok(value)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tether_core::{StoreError, TetherError};

    /// Source that returns an incrementing value and counts loads.
    struct CountingSource {
        loads: AtomicU64,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                loads: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ValueSource<u64> for Arc<CountingSource> {
        async fn load(&self) -> TetherResult<u64> {
            Ok(self.loads.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    /// Source that succeeds once, then fails forever.
    struct FailsAfterFirst {
        loads: AtomicU64,
    }

    #[async_trait]
    impl ValueSource<u64> for FailsAfterFirst {
        async fn load(&self) -> TetherResult<u64> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(1)
            } else {
                Err(TetherError::Store(StoreError::Unavailable {
                    reason: "lookup died".to_string(),
                }))
            }
        }
    }

    async fn drain_background_tasks() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_bound() {
        let source = Arc::new(CountingSource::new());
        let cache = StepBehindCache::with_period(Arc::clone(&source), Duration::from_secs(1));

        // Synchronous first read.
        assert_eq!(cache.get().await.expect("first get"), 1);

        // Within the period: cached value, no refresh.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(cache.get().await.expect("second get"), 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        // Past the period: still the stale value, but a refresh starts.
        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(cache.get().await.expect("stale read"), 1);
        drain_background_tasks().await;

        // Sufficiently later the refreshed value is visible.
        assert_eq!(cache.get().await.expect("fresh read"), 2);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_calls_launch_one_refresh() {
        let source = Arc::new(CountingSource::new());
        let cache = StepBehindCache::with_period(Arc::clone(&source), Duration::from_secs(1));

        cache.get().await.expect("populate");
        tokio::time::advance(Duration::from_millis(1100)).await;

        // Several calls in quick succession after the period elapsed: the
        // initiation timestamp was recorded on the first, so only one
        // refresh launches.
        for _ in 0..5 {
            cache.get().await.expect("stale read");
        }
        drain_background_tasks().await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_previous_value() {
        let source = FailsAfterFirst {
            loads: AtomicU64::new(0),
        };
        let cache = StepBehindCache::with_period(source, Duration::from_millis(100));

        assert_eq!(cache.get().await.expect("first get"), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get().await.expect("triggers failing refresh"), 1);
        drain_background_tasks().await;

        // The failure was swallowed; readers still get the old value.
        assert_eq!(cache.get().await.expect("still cached"), 1);
    }

    #[tokio::test]
    async fn test_first_load_failure_propagates() {
        struct AlwaysFails;

        #[async_trait]
        impl ValueSource<u64> for AlwaysFails {
            async fn load(&self) -> TetherResult<u64> {
                Err(TetherError::Store(StoreError::Unavailable {
                    reason: "no backend".to_string(),
                }))
            }
        }

        let cache = StepBehindCache::new(AlwaysFails);
        assert!(cache.get().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_load_leaves_slot_empty_for_retry() {
        let source = Arc::new(CountingSource::new());

        struct FailsOnce {
            inner: Arc<CountingSource>,
            failed: AtomicU64,
        }

        #[async_trait]
        impl ValueSource<u64> for FailsOnce {
            async fn load(&self) -> TetherResult<u64> {
                if self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TetherError::Store(StoreError::Unavailable {
                        reason: "cold start".to_string(),
                    }))
                } else {
                    self.inner.load().await
                }
            }
        }

        let cache = StepBehindCache::new(FailsOnce {
            inner: source,
            failed: AtomicU64::new(0),
        });

        assert!(cache.get().await.is_err());
        // The next call retries the synchronous load and succeeds.
        assert_eq!(cache.get().await.expect("retry"), 1);
    }
}
