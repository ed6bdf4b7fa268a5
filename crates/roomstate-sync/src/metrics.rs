//! Sync round instrumentation
//!
//! Counters are atomics shared between the session actor and its handles, so
//! reading metrics never goes through the command queue.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Latency bucket upper bounds in milliseconds; the last bucket is unbounded.
const LATENCY_BUCKETS_MS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Bucketed latency distribution
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// Record one observation
    pub fn observe(&self, latency_ms: u64) {
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|&upper| latency_ms <= upper)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean latency, 0 when empty
    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    /// `(upper_bound_ms, count)` pairs; `None` marks the unbounded bucket
    pub fn buckets(&self) -> Vec<(Option<u64>, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, c)| (LATENCY_BUCKETS_MS.get(i).copied(), c.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Live synchronizer metrics
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Round-trip latency distribution
    pub latency: LatencyHistogram,
    rounds_started: AtomicU64,
    rounds_completed: AtomicU64,
    rounds_failed: AtomicU64,
    conflicts_raised: AtomicU64,
    last_latency_ms: AtomicU64,
    retry_count: AtomicU64,
}

impl SyncMetrics {
    /// Create empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn round_completed(&self, latency_ms: u64) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.latency.observe(latency_ms);
        self.retry_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn round_failed(&self, retry_count: u32) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
        self.retry_count.store(u64::from(retry_count), Ordering::Relaxed);
    }

    pub(crate) fn conflict_raised(&self) {
        self.conflicts_raised.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            conflicts_raised: self.conflicts_raised.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            mean_latency_ms: self.latency.mean_ms(),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            latency_buckets: self.latency.buckets(),
        }
    }
}

/// Serializable copy of [`SyncMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetricsSnapshot {
    /// Rounds begun
    pub rounds_started: u64,
    /// Rounds that received a response
    pub rounds_completed: u64,
    /// Rounds that failed at the transport
    pub rounds_failed: u64,
    /// Conflicts detected
    pub conflicts_raised: u64,
    /// Latency of the last completed round
    pub last_latency_ms: u64,
    /// Mean round latency
    pub mean_latency_ms: f64,
    /// Consecutive failed rounds
    pub retry_count: u64,
    /// Latency distribution
    pub latency_buckets: Vec<(Option<u64>, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_observations() {
        let histogram = LatencyHistogram::default();
        histogram.observe(3);
        histogram.observe(150);
        histogram.observe(9_000);

        let buckets = histogram.buckets();
        assert_eq!(buckets[1], (Some(5), 1));
        assert_eq!(buckets[6], (Some(250), 1));
        assert_eq!(buckets[11], (None, 1));
        assert_eq!(histogram.count(), 3);
        assert!((histogram.mean_ms() - 3051.0).abs() < f64::EPSILON);
    }

    #[test]
    fn completed_round_resets_retry_count() {
        let metrics = SyncMetrics::new();
        metrics.round_started();
        metrics.round_failed(1);
        assert_eq!(metrics.snapshot().retry_count, 1);

        metrics.round_started();
        metrics.round_completed(40);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rounds_started, 2);
        assert_eq!(snapshot.rounds_failed, 1);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.last_latency_ms, 40);
    }
}
