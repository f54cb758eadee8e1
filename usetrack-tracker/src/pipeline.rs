//! # Pipeline Facade
//!
//! Wires one process's tracking pipeline together from a validated
//! [`Config`]: shared store, one adapter per enabled tracker, the trackers
//! themselves and the background reporter.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use usetrack_common::{Config, TrackerKind, UsetrackError, UsetrackResult};
use usetrack_store::{SharedStore, StorageAdapter, build_adapter, connect};

use crate::reporter::{BackgroundReporter, FlushReport, ReporterHandle};
use crate::tracker::Trackers;

pub struct Usetrack {
    config: Arc<Config>,
    store: Arc<dyn SharedStore>,
    adapters: Vec<Arc<dyn StorageAdapter>>,
    trackers: Trackers,
    reporter: Arc<BackgroundReporter>,
    handle: Mutex<Option<ReporterHandle>>,
}

impl Usetrack {
    /// Validates `config` and connects to the store it names.
    ///
    /// A remote store connects lazily, so an unreachable server surfaces on the
    /// first flush rather than here.
    pub fn new(config: Config) -> UsetrackResult<Self> {
        config.validate()?;
        let store = connect(&config.store_url()?, config.io_timeout());
        Self::with_store(config, store)
    }

    /// Builds the pipeline over an existing store.
    pub fn with_store(config: Config, store: Arc<dyn SharedStore>) -> UsetrackResult<Self> {
        config.validate()?;
        let adapters: Vec<_> = config
            .enabled_kinds()
            .into_iter()
            .map(|kind| build_adapter(&config, kind, Arc::clone(&store)))
            .collect();
        let trackers = Trackers::new(&config);
        let reporter = Arc::new(BackgroundReporter::new(
            &config,
            trackers.clone(),
            adapters.iter().cloned(),
        ));
        info!(
            store = %store.describe(),
            backend = %config.store.backend,
            environment = %config.environment,
            trackers = adapters.len(),
            "tracking pipeline ready"
        );
        Ok(Usetrack {
            config: Arc::new(config),
            store,
            adapters,
            trackers,
            reporter,
            handle: Mutex::new(None),
        })
    }

    /// Spawns the background reporter when `reporting.auto_start` is set.
    ///
    /// Returns `Ok(false)` when auto start is off or the reporter already runs.
    /// Fails outside a Tokio runtime.
    pub fn start(&self) -> UsetrackResult<bool> {
        if !self.config.reporting.auto_start {
            info!("auto start disabled; flush with flush_now");
            return Ok(false);
        }
        tokio::runtime::Handle::try_current().map_err(|err| {
            UsetrackError::invalid_config("reporting.auto_start", err.to_string())
        })?;

        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(false);
        }
        *handle = Some(self.reporter.spawn());
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the reporter after its final flush. No-op when not running.
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn flush_now(&self) -> FlushReport {
        self.reporter.flush_now().await
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn trackers(&self) -> &Trackers {
        &self.trackers
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<BackgroundReporter> {
        &self.reporter
    }

    /// Adapters of enabled trackers, in tracker order.
    pub fn adapters(&self) -> &[Arc<dyn StorageAdapter>] {
        &self.adapters
    }

    pub fn adapter(&self, kind: TrackerKind) -> Option<&Arc<dyn StorageAdapter>> {
        self.adapters.iter().find(|a| a.namespace().kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usetrack_common::ConfigLoader;
    use usetrack_store::MemoryStore;

    fn config(apply: impl FnOnce(&mut Config) + 'static) -> Config {
        ConfigLoader::new()
            .without_env()
            .with_overrides(apply)
            .load()
            .unwrap()
    }

    #[test]
    fn builds_adapters_for_enabled_trackers_only() {
        let usetrack = Usetrack::new(config(|c| c.trackers.translations = false)).unwrap();
        let kinds: Vec<_> = usetrack.adapters().iter().map(|a| a.namespace().kind()).collect();
        assert_eq!(kinds, [TrackerKind::Code, TrackerKind::View, TrackerKind::Route]);
        assert!(usetrack.adapter(TrackerKind::Translation).is_none());
    }

    #[test]
    fn invalid_config_fails_before_anything_runs() {
        let mut bad = Config::default();
        bad.reporting.interval_secs = 0;
        let err = Usetrack::new(bad).err().unwrap();
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn start_needs_a_runtime() {
        let usetrack = Usetrack::new(Config::default()).unwrap();
        assert!(usetrack.start().is_err());
        assert!(!usetrack.is_running());
    }

    #[tokio::test]
    async fn manual_mode_never_spawns() {
        let store = Arc::new(MemoryStore::new());
        let usetrack =
            Usetrack::with_store(config(|c| c.reporting.auto_start = false), store).unwrap();
        assert!(!usetrack.start().unwrap());
        assert!(!usetrack.is_running());

        usetrack.trackers().views().record("posts/index");
        let report = usetrack.flush_now().await;
        assert_eq!(report.merged_hits(), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_flushes() {
        let store = Arc::new(MemoryStore::new());
        let usetrack = Usetrack::with_store(config(|_| {}), store).unwrap();
        assert!(usetrack.start().unwrap());
        assert!(!usetrack.start().unwrap());
        assert!(usetrack.is_running());

        usetrack.trackers().code().record("app/models/post.rb");
        usetrack.shutdown().await;
        assert!(!usetrack.is_running());

        let records = usetrack.adapter(TrackerKind::Code).unwrap().read().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hits, 1);
    }
}
