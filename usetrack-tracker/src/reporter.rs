//! # Background Reporter
//!
//! One task per process that periodically drains every enabled accumulator
//! and merges the snapshots into the shared store.
//!
//! ## Design Principles
//!
//! 1. **Jittered Schedule**: Each cycle sleeps `interval + random(0..=wiggle)`,
//!    re-drawn every cycle, so a fleet of processes spreads its writes.
//! 2. **Bounded Merges**: Every merge runs under `merge_timeout`; a timeout is
//!    handled exactly like a store error.
//! 3. **Explicit Failure Policy**: A failed snapshot is either dropped with a
//!    warning or re-injected into its accumulator, per [`FailurePolicy`].
//! 4. **Contained Cycles**: Each scheduled cycle runs in its own task, so even
//!    a panic inside an adapter costs one cycle and not the reporter.
//! 5. **Graceful Stop**: A stop signal is only observed while sleeping; an
//!    in-flight flush completes, then one final flush runs under
//!    `shutdown_timeout`.
//!
//! ## Notes
//! - Under [`FailurePolicy::Retry`], a merge that timed out after the store had
//!   already applied part of it will be counted again on the next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use usetrack_common::{Config, FailurePolicy, Snapshot, TrackerKind, unix_now};
use usetrack_store::StorageAdapter;

use crate::accumulator::LocalAccumulator;
use crate::metrics::ReporterMetrics;
use crate::tracker::Trackers;

/// Lifecycle of the reporter task.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReporterState {
    /// Built, not sleeping yet (not spawned, or inside the startup delay).
    Idle = 0,
    Sleeping = 1,
    Flushing = 2,
    /// Final flush done; the task has exited.
    Stopped = 3,
}

impl ReporterState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Sleeping,
            2 => Self::Flushing,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sleeping => "sleeping",
            Self::Flushing => "flushing",
            Self::Stopped => "stopped",
        }
    }
}

/// Per-cycle delay generator.
pub struct Jitter {
    base: Duration,
    wiggle_ms: u64,
    rng: StdRng,
}

impl Jitter {
    pub fn new(base: Duration, wiggle: Duration) -> Self {
        Self::with_rng(base, wiggle, StdRng::from_entropy())
    }

    /// Deterministic sequence, for tests.
    pub fn seeded(base: Duration, wiggle: Duration, seed: u64) -> Self {
        Self::with_rng(base, wiggle, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: Duration, wiggle: Duration, rng: StdRng) -> Self {
        Jitter {
            base,
            wiggle_ms: wiggle.as_millis() as u64,
            rng,
        }
    }

    /// A fresh delay in `[base, base + wiggle]`.
    pub fn next_delay(&mut self) -> Duration {
        self.base + Duration::from_millis(self.rng.gen_range(0..=self.wiggle_ms))
    }
}

/// What happened to one tracker's snapshot during a flush.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was recorded since the last drain.
    Empty,
    Merged { units: usize, hits: u64 },
    Failed {
        units: usize,
        hits: u64,
        error: String,
        /// `true` when the snapshot went back into the accumulator.
        requeued: bool,
    },
}

/// Result of one flush cycle.
#[derive(Clone, Debug, Default)]
pub struct FlushReport {
    pub outcomes: Vec<(TrackerKind, FlushOutcome)>,
    /// Observations refused by full accumulators since the previous flush.
    pub dropped_observations: u64,
}

impl FlushReport {
    pub fn outcome(&self, kind: TrackerKind) -> Option<&FlushOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }

    pub fn is_success(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|(_, o)| matches!(o, FlushOutcome::Failed { .. }))
    }

    pub fn merged_hits(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                FlushOutcome::Merged { hits, .. } => *hits,
                _ => 0,
            })
            .sum()
    }
}

/// Drains accumulators into storage adapters on a jittered schedule.
pub struct BackgroundReporter {
    trackers: Trackers,
    adapters: Vec<Arc<dyn StorageAdapter>>,
    ignore: Vec<String>,
    policy: FailurePolicy,
    interval: Duration,
    wiggle: Duration,
    startup_delay: Duration,
    merge_timeout: Duration,
    shutdown_timeout: Duration,
    verbose: bool,
    state: AtomicU8,
    metrics: ReporterMetrics,
    flush_lock: Mutex<()>,
}

impl BackgroundReporter {
    /// Pairs each enabled tracker with the adapter of the same kind; adapters
    /// for disabled trackers are ignored.
    pub fn new(
        config: &Config,
        trackers: Trackers,
        adapters: impl IntoIterator<Item = Arc<dyn StorageAdapter>>,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .filter(|adapter| trackers.get(adapter.namespace().kind()).is_enabled())
            .collect();
        BackgroundReporter {
            trackers,
            adapters,
            ignore: config.trackers.ignore.clone(),
            policy: config.reporting.on_failure,
            interval: config.interval(),
            wiggle: config.wiggle(),
            startup_delay: config.startup_delay(),
            merge_timeout: config.merge_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            verbose: config.verbose,
            state: AtomicU8::new(ReporterState::Idle as u8),
            metrics: ReporterMetrics::new(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ReporterState {
        ReporterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &ReporterMetrics {
        &self.metrics
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn wiggle(&self) -> Duration {
        self.wiggle
    }

    fn set_state(&self, state: ReporterState) -> ReporterState {
        ReporterState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Runs one flush cycle immediately. Concurrent calls are serialized.
    pub async fn flush_now(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let previous = self.set_state(ReporterState::Flushing);
        self.metrics.record_cycle();

        let mut report = FlushReport::default();
        for adapter in &self.adapters {
            let kind = adapter.namespace().kind();
            let Some(accumulator) = self.trackers.get(kind).accumulator() else {
                continue;
            };

            let dropped = accumulator.take_dropped();
            if dropped > 0 {
                self.metrics.record_observations_dropped(dropped);
                report.dropped_observations += dropped;
                if self.verbose {
                    warn!(%kind, dropped, "accumulator full; observations dropped");
                } else {
                    debug!(%kind, dropped, "accumulator full; observations dropped");
                }
            }

            let outcome = self.flush_one(adapter.as_ref(), accumulator).await;
            report.outcomes.push((kind, outcome));
        }

        if report.is_success() {
            self.metrics.record_flushed_at(unix_now());
        }
        self.log_report(&report);
        self.set_state(previous);
        report
    }

    async fn flush_one(
        &self,
        adapter: &dyn StorageAdapter,
        accumulator: &LocalAccumulator,
    ) -> FlushOutcome {
        let mut snapshot = accumulator.drain();
        if !self.ignore.is_empty() {
            snapshot.retain(|name| !self.ignore.iter().any(|pattern| name.contains(pattern)));
        }
        if snapshot.is_empty() {
            return FlushOutcome::Empty;
        }

        let units = snapshot.len();
        let hits = snapshot.total_hits();
        let started = Instant::now();
        let error = match tokio::time::timeout(self.merge_timeout, adapter.merge(&snapshot)).await
        {
            Ok(Ok(())) => {
                self.metrics.record_merge(units, hits, started.elapsed());
                return FlushOutcome::Merged { units, hits };
            }
            Ok(Err(err)) => {
                self.metrics.record_merge_error();
                err.to_string()
            }
            Err(_) => {
                self.metrics.record_timeout();
                format!("merge timed out after {:?}", self.merge_timeout)
            }
        };

        let requeued = self.apply_policy(accumulator, snapshot, &error);
        FlushOutcome::Failed {
            units,
            hits,
            error,
            requeued,
        }
    }

    fn apply_policy(&self, accumulator: &LocalAccumulator, snapshot: Snapshot, error: &str) -> bool {
        let kind = accumulator.kind();
        let (units, hits) = (snapshot.len(), snapshot.total_hits());
        match self.policy {
            FailurePolicy::Drop => {
                self.metrics.record_snapshot_dropped();
                warn!(%kind, units, hits, error, "merge failed; snapshot dropped");
                false
            }
            FailurePolicy::Retry => {
                let lost = accumulator.restore(snapshot);
                self.metrics.record_snapshot_requeued();
                warn!(%kind, units, hits, lost, error, "merge failed; snapshot re-queued");
                true
            }
        }
    }

    fn log_report(&self, report: &FlushReport) {
        let merged = report
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, FlushOutcome::Merged { .. }))
            .count();
        let hits = report.merged_hits();
        if self.verbose {
            info!(merged, hits, success = report.is_success(), "flush cycle complete");
        } else {
            debug!(merged, hits, success = report.is_success(), "flush cycle complete");
        }
    }

    /// Spawns the reporter loop on the current Tokio runtime.
    ///
    /// Dropping the returned handle also stops the loop (after a final flush).
    pub fn spawn(self: &Arc<Self>) -> ReporterHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).run(stop_rx));
        ReporterHandle {
            stop: Some(stop_tx),
            task,
            reporter: Arc::clone(self),
        }
    }

    async fn run(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        info!(
            interval = ?self.interval,
            wiggle = ?self.wiggle,
            trackers = self.adapters.len(),
            "background reporter started"
        );

        let mut stopped = false;
        if !self.startup_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.startup_delay) => {}
                _ = &mut stop => stopped = true,
            }
        }

        let mut jitter = Jitter::new(self.interval, self.wiggle);
        while !stopped {
            self.set_state(ReporterState::Sleeping);
            let delay = jitter.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut stop => break,
            }

            let cycle = Arc::clone(&self);
            if let Err(err) = tokio::spawn(async move { cycle.flush_now().await }).await {
                error!(error = %err, "flush cycle aborted");
            }
        }

        self.shutdown_flush().await;
    }

    async fn shutdown_flush(&self) {
        match tokio::time::timeout(self.shutdown_timeout, self.flush_now()).await {
            Ok(report) if report.is_success() => {
                info!(hits = report.merged_hits(), "final flush complete");
            }
            Ok(report) => warn!(hits = report.merged_hits(), "final flush incomplete"),
            Err(_) => warn!(timeout = ?self.shutdown_timeout, "final flush abandoned"),
        }
        self.set_state(ReporterState::Stopped);
    }
}

/// Owner of a spawned reporter loop.
pub struct ReporterHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    reporter: Arc<BackgroundReporter>,
}

impl ReporterHandle {
    pub fn reporter(&self) -> &Arc<BackgroundReporter> {
        &self.reporter
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop, waits for any in-flight flush and the final flush.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(err) = self.task.await {
            error!(error = %err, "background reporter task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds_and_varies() {
        let base = Duration::from_secs(10);
        let wiggle = Duration::from_secs(2);
        let mut jitter = Jitter::seeded(base, wiggle, 7);

        let delays: Vec<_> = (0..200).map(|_| jitter.next_delay()).collect();
        assert!(delays.iter().all(|d| *d >= base && *d <= base + wiggle));
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first));
    }

    #[test]
    fn zero_wiggle_is_exact() {
        let base = Duration::from_millis(1500);
        let mut jitter = Jitter::seeded(base, Duration::ZERO, 1);
        assert_eq!(jitter.next_delay(), base);
        assert_eq!(jitter.next_delay(), base);
    }

    #[test]
    fn report_summaries() {
        let report = FlushReport {
            outcomes: vec![
                (TrackerKind::Code, FlushOutcome::Merged { units: 2, hits: 5 }),
                (TrackerKind::View, FlushOutcome::Empty),
                (
                    TrackerKind::Route,
                    FlushOutcome::Failed {
                        units: 1,
                        hits: 3,
                        error: "down".into(),
                        requeued: false,
                    },
                ),
            ],
            dropped_observations: 0,
        };
        assert!(!report.is_success());
        assert_eq!(report.merged_hits(), 5);
        assert_eq!(report.outcome(TrackerKind::View), Some(&FlushOutcome::Empty));
        assert_eq!(report.outcome(TrackerKind::Translation), None);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ReporterState::Idle,
            ReporterState::Sleeping,
            ReporterState::Flushing,
            ReporterState::Stopped,
        ] {
            assert_eq!(ReporterState::from_u8(state as u8), state);
        }
    }
}
