use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::stats::AggregateReport;

/// Observed load at the time a report is requested; input to the TTL policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadFactor {
    pub worker_count: usize,
    pub total_requests: u64,
}

/// Maps (base TTL, load) to the effective TTL of a freshly stored report.
///
/// A policy must be monotonic non-decreasing in load and must yield the base
/// TTL at zero load, so that an idle system is never served staler data than
/// the caller asked for.
pub type TtlPolicy = Box<dyn Fn(Duration, &LoadFactor) -> Duration + Send + Sync>;

/// Default policy: scale the base TTL with worker count and request volume,
/// capped at 10x so a very busy run still refreshes eventually.
pub fn default_ttl_policy(base: Duration, load: &LoadFactor) -> Duration {
    let scale = 1.0 + load.worker_count as f64 / 10.0 + load.total_requests as f64 / 100_000.0;
    base.mul_f64(scale.min(10.0))
}

/// A stored report together with its freshness metadata.
#[derive(Clone)]
pub struct CachedReport {
    pub report: Arc<AggregateReport>,
    pub computed_at: Instant,
    pub effective_ttl: Duration,
}

impl CachedReport {
    pub fn is_fresh(&self) -> bool {
        self.computed_at.elapsed() < self.effective_ttl
    }
}

/// Memoizes the aggregate report so concurrent dashboard polls do not each
/// trigger a full recomputation.
///
/// The async mutex is held across the recompute, which is what provides the
/// at-most-one-concurrent-recompute guarantee: callers arriving during an
/// in-flight computation queue on the lock and then observe the fresh entry.
pub struct SnapshotCache {
    entry: Mutex<Option<CachedReport>>,
    ttl_policy: TtlPolicy,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::with_policy(Box::new(default_ttl_policy))
    }

    pub fn with_policy(ttl_policy: TtlPolicy) -> Self {
        Self {
            entry: Mutex::new(None),
            ttl_policy,
        }
    }

    /// Return the cached report if still fresh, otherwise recompute and store
    /// it with a TTL derived from the current load.
    ///
    /// A compute failure propagates to the caller and leaves the cache slot
    /// untouched, so the next call retries fresh.
    pub async fn get_or_compute<F>(
        &self,
        base_ttl: Duration,
        load: LoadFactor,
        compute: F,
    ) -> Result<CachedReport>
    where
        F: FnOnce() -> Result<AggregateReport>,
    {
        let mut guard = self.entry.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh() {
                debug!("Serving cached report (age {:?})", cached.computed_at.elapsed());
                return Ok(cached.clone());
            }
        }

        let report = compute()?;
        let cached = CachedReport {
            report: Arc::new(report),
            computed_at: Instant::now(),
            effective_ttl: (self.ttl_policy)(base_ttl, &load),
        };
        debug!(
            "Stored recomputed report, effective ttl {:?}",
            cached.effective_ttl
        );
        *guard = Some(cached.clone());
        Ok(cached)
    }

    /// Drop the cached entry; the next call recomputes unconditionally.
    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}
