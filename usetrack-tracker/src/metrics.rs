//! # Reporter Metrics
//!
//! Counters and a merge-latency histogram describing how well the background
//! reporter keeps up: cycles run, merges that failed or timed out, and how much
//! data was lost or re-queued.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Plain Snapshots**: Readers get a serializable struct, never the atomics.
//!
//! ## Notes
//! - Bucket boundaries are in milliseconds; a merge is a network round trip,
//!   not an in-process call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Default merge latency bucket boundaries in milliseconds.
pub const DEFAULT_LATENCY_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 1_000, 5_000];

/// Point-in-time view of [`ReporterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReporterMetricsSnapshot {
    /// Flush cycles started, scheduled or on demand.
    pub cycles: u64,
    /// Per-tracker merges that completed.
    pub merges: u64,
    /// Per-tracker merges that returned an error.
    pub merge_errors: u64,
    /// Per-tracker merges abandoned after the merge timeout.
    pub timeouts: u64,
    /// Units written across all successful merges.
    pub units_merged: u64,
    /// Hits written across all successful merges.
    pub hits_merged: u64,
    /// Observations refused by a full accumulator.
    pub observations_dropped: u64,
    /// Snapshots discarded after a failed merge.
    pub snapshots_dropped: u64,
    /// Snapshots put back into the accumulator after a failed merge.
    pub snapshots_requeued: u64,
    /// Unix seconds of the last cycle in which every merge succeeded; 0 if none.
    pub last_flush_unix: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    /// Bucket boundaries in milliseconds.
    pub bounds_ms: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_ms: u64,
}

/// Thread-safe reporter metrics. `Relaxed` ordering throughout; fields are
/// independent and only need to be eventually consistent.
pub struct ReporterMetrics {
    cycles: AtomicU64,
    merges: AtomicU64,
    merge_errors: AtomicU64,
    timeouts: AtomicU64,
    units_merged: AtomicU64,
    hits_merged: AtomicU64,
    observations_dropped: AtomicU64,
    snapshots_dropped: AtomicU64,
    snapshots_requeued: AtomicU64,
    last_flush_unix: AtomicU64,
    latency: LatencyHistogram,
}

impl ReporterMetrics {
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_MS.to_vec())
    }

    /// Uses custom bucket boundaries (ascending milliseconds).
    pub fn with_latency_buckets(bounds_ms: Vec<u64>) -> Self {
        ReporterMetrics {
            cycles: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            merge_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            units_merged: AtomicU64::new(0),
            hits_merged: AtomicU64::new(0),
            observations_dropped: AtomicU64::new(0),
            snapshots_dropped: AtomicU64::new(0),
            snapshots_requeued: AtomicU64::new(0),
            last_flush_unix: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_ms),
        }
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self, units: usize, hits: u64, latency: Duration) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.units_merged.fetch_add(units as u64, Ordering::Relaxed);
        self.hits_merged.fetch_add(hits, Ordering::Relaxed);
        self.latency.record(latency);
    }

    pub fn record_merge_error(&self) {
        self.merge_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_observations_dropped(&self, count: u64) {
        if count > 0 {
            self.observations_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_snapshot_dropped(&self) {
        self.snapshots_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_requeued(&self) {
        self.snapshots_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed_at(&self, unix: u64) {
        self.last_flush_unix.fetch_max(unix, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReporterMetricsSnapshot {
        ReporterMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            merge_errors: self.merge_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            units_merged: self.units_merged.load(Ordering::Relaxed),
            hits_merged: self.hits_merged.load(Ordering::Relaxed),
            observations_dropped: self.observations_dropped.load(Ordering::Relaxed),
            snapshots_dropped: self.snapshots_dropped.load(Ordering::Relaxed),
            snapshots_requeued: self.snapshots_requeued.load(Ordering::Relaxed),
            last_flush_unix: self.last_flush_unix.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl Default for ReporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram with a linear bucket scan.
pub struct LatencyHistogram {
    bounds_ms: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(bounds_ms: Vec<u64>) -> Self {
        let buckets = (0..=bounds_ms.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_ms,
            buckets,
            sum_ms: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let millis = latency.as_millis() as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(millis, Ordering::Relaxed);

        let idx = self
            .bounds_ms
            .iter()
            .position(|&bound| millis <= bound)
            .unwrap_or(self.bounds_ms.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_ms: self.bounds_ms.clone(),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_land_in_latency_buckets() {
        let metrics = ReporterMetrics::with_latency_buckets(vec![10, 100]);
        metrics.record_merge(3, 7, Duration::from_millis(4));
        metrics.record_merge(1, 1, Duration::from_millis(50));
        metrics.record_merge(2, 2, Duration::from_secs(1));

        let snap = metrics.snapshot();
        assert_eq!(snap.merges, 3);
        assert_eq!(snap.units_merged, 6);
        assert_eq!(snap.hits_merged, 10);
        assert_eq!(snap.latency.buckets, vec![1, 1, 1]);
        assert_eq!(snap.latency.sum_ms, 1_054);
    }

    #[test]
    fn last_flush_never_moves_backwards() {
        let metrics = ReporterMetrics::new();
        metrics.record_flushed_at(200);
        metrics.record_flushed_at(100);
        assert_eq!(metrics.snapshot().last_flush_unix, 200);
    }

    #[test]
    fn dropped_observations_accumulate() {
        let metrics = ReporterMetrics::new();
        metrics.record_cycle();
        metrics.record_observations_dropped(0);
        metrics.record_observations_dropped(4);
        let snap = metrics.snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.observations_dropped, 4);
    }
}
