pub mod accumulator;
pub mod metrics;
pub mod pipeline;
pub mod reporter;
pub mod tracker;

pub use accumulator::LocalAccumulator;
pub use metrics::{ReporterMetrics, ReporterMetricsSnapshot};
pub use pipeline::Usetrack;
pub use reporter::{
    BackgroundReporter, FlushOutcome, FlushReport, Jitter, ReporterHandle, ReporterState,
};
pub use tracker::{Trackers, UnitTracker};
