//! # Unit Trackers
//!
//! The request-path entry point: `record` a unit and move on.
//!
//! ## Design Principles
//!
//! 1. **Never Propagates**: `record` returns `()`; accumulator faults are
//!    swallowed here and only logged at debug when verbose.
//! 2. **Switched Once**: A disabled tracker carries no accumulator, so its
//!    `record` is a single `None` check and hot loops can hoist
//!    [`UnitTracker::is_enabled`].
//! 3. **Every Call Counts**: Recording the same unit twice in one request adds
//!    two hits; consumers read counts as usage volume.
//! 4. **Cheap Clones**: Handles are `Arc`-backed and meant to be cloned into
//!    every handler.

use std::sync::Arc;

use tracing::debug;
use usetrack_common::{Config, TrackerKind, Unit, route_name, unix_now};

use crate::accumulator::LocalAccumulator;

/// Handle for one tracker kind.
#[derive(Clone)]
pub struct UnitTracker {
    kind: TrackerKind,
    accumulator: Option<Arc<LocalAccumulator>>,
    verbose: bool,
}

impl UnitTracker {
    pub fn enabled(kind: TrackerKind, max_units: usize, verbose: bool) -> Self {
        UnitTracker {
            kind,
            accumulator: Some(Arc::new(LocalAccumulator::new(kind, max_units))),
            verbose,
        }
    }

    pub fn disabled(kind: TrackerKind) -> Self {
        UnitTracker {
            kind,
            accumulator: None,
            verbose: false,
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.accumulator.is_some()
    }

    /// Records one use of `unit`. Never blocks on I/O and never fails.
    #[inline]
    pub fn record(&self, unit: &str) {
        let Some(accumulator) = &self.accumulator else {
            return;
        };
        if let Err(err) = accumulator.record(unit, unix_now()) {
            if self.verbose {
                debug!(unit = %Unit::new(self.kind, unit), error = %err, "observation dropped");
            }
        }
    }

    pub(crate) fn accumulator(&self) -> Option<&Arc<LocalAccumulator>> {
        self.accumulator.as_ref()
    }
}

/// The four trackers of one process.
#[derive(Clone)]
pub struct Trackers {
    by_kind: Arc<[UnitTracker; 4]>,
}

impl Trackers {
    /// Builds trackers with the enable switches and capacity from `config`.
    pub fn new(config: &Config) -> Self {
        let build = |kind: TrackerKind| {
            if config.is_enabled(kind) {
                UnitTracker::enabled(kind, config.trackers.max_units, config.verbose)
            } else {
                UnitTracker::disabled(kind)
            }
        };
        Trackers {
            by_kind: Arc::new(TrackerKind::ALL.map(build)),
        }
    }

    pub fn get(&self, kind: TrackerKind) -> &UnitTracker {
        &self.by_kind[kind.index()]
    }

    pub fn code(&self) -> &UnitTracker {
        self.get(TrackerKind::Code)
    }

    pub fn views(&self) -> &UnitTracker {
        self.get(TrackerKind::View)
    }

    pub fn translations(&self) -> &UnitTracker {
        self.get(TrackerKind::Translation)
    }

    pub fn routes(&self) -> &UnitTracker {
        self.get(TrackerKind::Route)
    }

    /// Records a matched route by method and pattern (not the concrete path).
    pub fn record_route(&self, method: &str, pattern: &str) {
        let routes = self.routes();
        if routes.is_enabled() {
            routes.record(&route_name(method, pattern));
        }
    }

    /// Enabled trackers in display order.
    pub fn enabled(&self) -> impl Iterator<Item = &UnitTracker> {
        self.by_kind.iter().filter(|t| t.is_enabled())
    }
}

/// Records the calling source file with the code tracker.
///
/// ```
/// use usetrack_common::Config;
/// use usetrack_tracker::{Trackers, track_code};
///
/// let trackers = Trackers::new(&Config::default());
/// track_code!(trackers);
/// ```
#[macro_export]
macro_rules! track_code {
    ($trackers:expr) => {
        $trackers.code().record(file!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(views: bool) -> Config {
        let mut config = Config::default();
        config.trackers.views = views;
        config
    }

    fn drained_hits(tracker: &UnitTracker, unit: &str) -> u64 {
        tracker
            .accumulator()
            .map(|acc| acc.drain().get(unit).map(|s| s.hits).unwrap_or(0))
            .unwrap_or(0)
    }

    #[test]
    fn duplicate_calls_each_count() {
        let trackers = Trackers::new(&config(true));
        trackers.views().record("posts/index");
        trackers.views().record("posts/index");
        assert_eq!(drained_hits(trackers.views(), "posts/index"), 2);
    }

    #[test]
    fn disabled_tracker_is_a_no_op() {
        let trackers = Trackers::new(&config(false));
        assert!(!trackers.views().is_enabled());
        trackers.views().record("posts/index");
        assert!(trackers.views().accumulator().is_none());
        assert_eq!(trackers.enabled().count(), 3);
    }

    #[test]
    fn routes_are_keyed_by_method_and_pattern() {
        let trackers = Trackers::new(&Config::default());
        trackers.record_route("get", "/posts/:id");
        trackers.record_route("PATCH", "/posts/:id");
        trackers.record_route("GET", "/posts/:id");

        let snap = trackers.routes().accumulator().unwrap().drain();
        assert_eq!(snap.get("GET /posts/:id").unwrap().hits, 2);
        assert_eq!(snap.get("PATCH /posts/:id").unwrap().hits, 1);
    }

    #[test]
    fn clones_share_accumulators() {
        let trackers = Trackers::new(&Config::default());
        let handler_copy = trackers.clone();
        handler_copy.translations().record("posts.title");
        assert_eq!(drained_hits(trackers.translations(), "posts.title"), 1);
    }

    #[test]
    fn track_code_records_this_file() {
        let trackers = Trackers::new(&Config::default());
        track_code!(trackers);
        assert_eq!(drained_hits(trackers.code(), file!()), 1);
    }

    #[test]
    fn overflow_never_reaches_the_caller() {
        let mut config = Config::default();
        config.trackers.max_units = 1;
        config.verbose = true;
        let trackers = Trackers::new(&config);
        trackers.views().record("a");
        trackers.views().record("b");
        let acc = trackers.views().accumulator().unwrap();
        assert_eq!(acc.take_dropped(), 1);
    }
}
