//! # Layered Configuration
//!
//! Purpose: Build one immutable [`Config`] at startup from defaults, an optional
//! TOML file, environment variables and explicit overrides, in that order.
//!
//! ## Design Principles
//!
//! 1. **Fail Fast**: Any unparseable value or failed validation is returned as a
//!    configuration fault before a reporter or web server starts.
//! 2. **Explicit Passing**: The result is handed to components by reference or
//!    `Arc`; nothing reads configuration from global state afterwards.
//! 3. **Injectable Environment**: The loader takes a lookup function so the
//!    environment layer is testable without mutating the process environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{UsetrackError, UsetrackResult};
use crate::types::{BackendKind, Namespace, TrackerKind};

/// Environment variable prefix for every override.
pub const ENV_PREFIX: &str = "USETRACK_";

/// Largest page a reporter client may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Complete runtime configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment environment; part of every namespace.
    pub environment: String,
    /// Leading component of every store key.
    pub namespace_prefix: String,
    /// Emit diagnostic logging of tracking and flush activity.
    pub verbose: bool,
    pub trackers: TrackersConfig,
    pub store: StoreConfig,
    pub reporting: ReportingConfig,
    pub web: WebConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackersConfig {
    pub code: bool,
    pub views: bool,
    pub translations: bool,
    pub routes: bool,
    /// Unit-name substrings dropped from snapshots before merge.
    pub ignore: Vec<String>,
    /// Distinct units one accumulator holds per interval.
    pub max_units: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// `memory://` or `redis://host:port[/db]`.
    pub url: String,
    pub io_timeout_ms: u64,
}

/// What the reporter does with a snapshot whose merge failed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the loss and discard the snapshot.
    #[default]
    Drop,
    /// Put the snapshot back into the accumulator for the next cycle.
    Retry,
}

impl FromStr for FailurePolicy {
    type Err = UsetrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "retry" => Ok(Self::Retry),
            other => Err(UsetrackError::invalid_config(
                "reporting.on_failure",
                format!("unknown policy `{other}` (expected `drop` or `retry`)"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub interval_secs: u64,
    pub wiggle_secs: u64,
    pub startup_delay_secs: u64,
    pub merge_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub on_failure: FailurePolicy,
    pub auto_start: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enable_clear: bool,
    pub paged_reporting: bool,
    pub page_size: usize,
    pub listen: SocketAddr,
    pub mount_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: "development".to_string(),
            namespace_prefix: "usetrack".to_string(),
            verbose: false,
            trackers: TrackersConfig::default(),
            store: StoreConfig::default(),
            reporting: ReportingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for TrackersConfig {
    fn default() -> Self {
        TrackersConfig {
            code: true,
            views: true,
            translations: true,
            routes: true,
            ignore: Vec::new(),
            max_units: 50_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: BackendKind::Sorted,
            url: "memory://".to_string(),
            io_timeout_ms: 2_000,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        ReportingConfig {
            interval_secs: 300,
            wiggle_secs: 30,
            startup_delay_secs: 0,
            merge_timeout_ms: 5_000,
            shutdown_timeout_ms: 1_000,
            on_failure: FailurePolicy::Drop,
            auto_start: true,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            enable_clear: false,
            paged_reporting: false,
            page_size: 100,
            listen: SocketAddr::from(([127, 0, 0, 1], 4567)),
            mount_path: "coverage".to_string(),
        }
    }
}

/// Parsed form of [`StoreConfig::url`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreUrl {
    /// In-process store shared only by components of this process.
    Memory,
    /// Redis-compatible server reachable over TCP.
    Resp { addr: String, db: u32 },
}

impl FromStr for StoreUrl {
    type Err = UsetrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| UsetrackError::invalid_config("store.url", reason);

        if s == "memory://" || s == "memory" {
            return Ok(StoreUrl::Memory);
        }
        let rest = s
            .strip_prefix("redis://")
            .ok_or_else(|| invalid(format!("unsupported scheme in `{s}`")))?;
        // Credentials are not supported; reject rather than leak them into logs.
        if rest.contains('@') {
            return Err(invalid("credentials in the store URL are not supported".into()));
        }
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(invalid(format!("missing host in `{s}`")));
        }
        let addr = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:6379")
        };
        let db = if path.is_empty() {
            0
        } else {
            path.parse::<u32>()
                .map_err(|_| invalid(format!("database `{path}` is not a number")))?
        };
        Ok(StoreUrl::Resp { addr, db })
    }
}

impl Config {
    /// Returns whether a tracker kind is switched on.
    pub fn is_enabled(&self, kind: TrackerKind) -> bool {
        match kind {
            TrackerKind::Code => self.trackers.code,
            TrackerKind::View => self.trackers.views,
            TrackerKind::Translation => self.trackers.translations,
            TrackerKind::Route => self.trackers.routes,
        }
    }

    /// Enabled tracker kinds in display order.
    pub fn enabled_kinds(&self) -> Vec<TrackerKind> {
        TrackerKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    /// Namespace for a tracker kind under this deployment.
    pub fn namespace(&self, kind: TrackerKind) -> Namespace {
        Namespace::new(
            &self.namespace_prefix,
            self.store.backend,
            kind,
            &self.environment,
        )
    }

    pub fn store_url(&self) -> UsetrackResult<StoreUrl> {
        self.store.url.parse()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reporting.interval_secs)
    }

    pub fn wiggle(&self) -> Duration {
        Duration::from_secs(self.reporting.wiggle_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.reporting.startup_delay_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.reporting.merge_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.reporting.shutdown_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.store.io_timeout_ms)
    }

    /// Checks semantic constraints the type system does not enforce.
    pub fn validate(&self) -> UsetrackResult<()> {
        if self.environment.trim().is_empty() {
            return Err(UsetrackError::invalid_config("environment", "must not be empty"));
        }
        if self.namespace_prefix.trim().is_empty() {
            return Err(UsetrackError::invalid_config(
                "namespace_prefix",
                "must not be empty",
            ));
        }
        if self.reporting.interval_secs == 0 {
            return Err(UsetrackError::invalid_config(
                "reporting.interval_secs",
                "must be greater than zero",
            ));
        }
        if self.reporting.merge_timeout_ms == 0 {
            return Err(UsetrackError::invalid_config(
                "reporting.merge_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.store.io_timeout_ms == 0 {
            return Err(UsetrackError::invalid_config(
                "store.io_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.trackers.max_units == 0 {
            return Err(UsetrackError::invalid_config(
                "trackers.max_units",
                "must be greater than zero",
            ));
        }
        if self.web.page_size == 0 || self.web.page_size > MAX_PAGE_SIZE {
            return Err(UsetrackError::invalid_config(
                "web.page_size",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        if self.web.mount_path.trim_matches('/').is_empty() {
            return Err(UsetrackError::invalid_config("web.mount_path", "must not be empty"));
        }
        self.store_url()?;

        if self.reporting.wiggle_secs > self.reporting.interval_secs {
            tracing::warn!(
                "reporting.wiggle_secs ({}) exceeds reporting.interval_secs ({}); \
                 flush timing will be dominated by jitter",
                self.reporting.wiggle_secs,
                self.reporting.interval_secs
            );
        }
        Ok(())
    }
}

/// Builds a [`Config`] from its layers.
///
/// ```no_run
/// use usetrack_common::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .file("usetrack.toml")
///     .with_overrides(|c| c.verbose = true)
///     .load()?;
/// # Ok::<(), usetrack_common::UsetrackError>(())
/// ```
#[derive(Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
    overrides: Vec<Box<dyn FnOnce(&mut Config)>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader::default()
    }

    /// Reads a TOML file as the second layer. A missing file is an error.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skips the environment layer entirely.
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Applies a programmatic override after every other layer.
    pub fn with_overrides(mut self, apply: impl FnOnce(&mut Config) + 'static) -> Self {
        self.overrides.push(Box::new(apply));
        self
    }

    /// Loads using the process environment.
    pub fn load(self) -> UsetrackResult<Config> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Loads using `lookup` as the environment.
    pub fn load_with_env(self, lookup: impl Fn(&str) -> Option<String>) -> UsetrackResult<Config> {
        let mut config = match &self.file {
            Some(path) => read_file(path)?,
            None => Config::default(),
        };

        if !self.skip_env {
            apply_env(&mut config, &lookup)?;
        }

        for apply in self.overrides {
            apply(&mut config);
        }

        config.validate()?;
        Ok(config)
    }
}

fn read_file(path: &Path) -> UsetrackResult<Config> {
    let file_error = |reason: String| UsetrackError::ConfigFile {
        path: path.display().to_string(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    toml::from_str(&content).map_err(|e| file_error(e.to_string()))
}

fn apply_env(config: &mut Config, lookup: &impl Fn(&str) -> Option<String>) -> UsetrackResult<()> {
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = get("ENV") {
        config.environment = v;
    }
    if let Some(v) = get("NAMESPACE_PREFIX") {
        config.namespace_prefix = v;
    }
    if let Some(v) = get("VERBOSE") {
        config.verbose = parse_bool("verbose", &v)?;
    }

    if let Some(v) = get("TRACK_CODE") {
        config.trackers.code = parse_bool("trackers.code", &v)?;
    }
    if let Some(v) = get("TRACK_VIEWS") {
        config.trackers.views = parse_bool("trackers.views", &v)?;
    }
    if let Some(v) = get("TRACK_TRANSLATIONS") {
        config.trackers.translations = parse_bool("trackers.translations", &v)?;
    }
    if let Some(v) = get("TRACK_ROUTES") {
        config.trackers.routes = parse_bool("trackers.routes", &v)?;
    }
    if let Some(v) = get("IGNORE") {
        config.trackers.ignore = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = get("MAX_UNITS") {
        config.trackers.max_units = parse_num("trackers.max_units", &v)?;
    }

    if let Some(v) = get("HASH_STORE") {
        if parse_bool("store.backend", &v)? {
            config.store.backend = BackendKind::Hash;
        }
    }
    if let Some(v) = get("STORE_BACKEND") {
        config.store.backend = v.parse()?;
    }
    if let Some(v) = get("STORE_URL").or_else(|| lookup("REDIS_URL")) {
        config.store.url = v;
    }
    if let Some(v) = get("STORE_IO_TIMEOUT_MS") {
        config.store.io_timeout_ms = parse_num("store.io_timeout_ms", &v)?;
    }

    if let Some(v) = get("REPORTING_INTERVAL_SECS") {
        config.reporting.interval_secs = parse_num("reporting.interval_secs", &v)?;
    }
    if let Some(v) = get("REPORTING_WIGGLE_SECS") {
        config.reporting.wiggle_secs = parse_num("reporting.wiggle_secs", &v)?;
    }
    if let Some(v) = get("STARTUP_DELAY_SECS") {
        config.reporting.startup_delay_secs = parse_num("reporting.startup_delay_secs", &v)?;
    }
    if let Some(v) = get("MERGE_TIMEOUT_MS") {
        config.reporting.merge_timeout_ms = parse_num("reporting.merge_timeout_ms", &v)?;
    }
    if let Some(v) = get("SHUTDOWN_TIMEOUT_MS") {
        config.reporting.shutdown_timeout_ms = parse_num("reporting.shutdown_timeout_ms", &v)?;
    }
    if let Some(v) = get("ON_FLUSH_FAILURE") {
        config.reporting.on_failure = v.parse()?;
    }
    if let Some(v) = get("DISABLE_AUTO_START") {
        config.reporting.auto_start = !parse_bool("reporting.auto_start", &v)?;
    }

    if let Some(v) = get("WEB_ENABLE_CLEAR") {
        config.web.enable_clear = parse_bool("web.enable_clear", &v)?;
    }
    if let Some(v) = get("PAGED_REPORTING") {
        config.web.paged_reporting = parse_bool("web.paged_reporting", &v)?;
    }
    if let Some(v) = get("PAGE_SIZE") {
        config.web.page_size = parse_num("web.page_size", &v)?;
    }
    if let Some(v) = get("LISTEN") {
        config.web.listen = v.parse().map_err(|_| {
            UsetrackError::invalid_config("web.listen", format!("`{v}` is not a socket address"))
        })?;
    }
    if let Some(v) = get("MOUNT_PATH") {
        config.web.mount_path = v;
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> UsetrackResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(UsetrackError::invalid_config(
            key,
            format!("`{other}` is not a boolean"),
        )),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> UsetrackResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        UsetrackError::invalid_config(key, format!("`{value}` is not a non-negative integer"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ConfigLoader::new().load_with_env(env(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.enabled_kinds(), TrackerKind::ALL.to_vec());
        assert!(!config.web.enable_clear);
        assert_eq!(config.reporting.on_failure, FailurePolicy::Drop);
    }

    #[test]
    fn env_overrides_tracker_switches() {
        let config = ConfigLoader::new()
            .load_with_env(env(&[
                ("USETRACK_TRACK_VIEWS", "false"),
                ("USETRACK_TRACK_TRANSLATIONS", "0"),
                ("USETRACK_VERBOSE", "true"),
            ]))
            .unwrap();
        assert!(!config.is_enabled(TrackerKind::View));
        assert!(!config.is_enabled(TrackerKind::Translation));
        assert!(config.is_enabled(TrackerKind::Route));
        assert!(config.verbose);
    }

    #[test]
    fn hash_store_flag_selects_hash_backend() {
        let config = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_HASH_STORE", "true")]))
            .unwrap();
        assert_eq!(config.store.backend, BackendKind::Hash);
    }

    #[test]
    fn redis_url_is_a_fallback_only() {
        let fallback = ConfigLoader::new()
            .load_with_env(env(&[("REDIS_URL", "redis://cache:6380/2")]))
            .unwrap();
        assert_eq!(
            fallback.store_url().unwrap(),
            StoreUrl::Resp { addr: "cache:6380".into(), db: 2 }
        );

        let explicit = ConfigLoader::new()
            .load_with_env(env(&[
                ("REDIS_URL", "redis://cache:6380/2"),
                ("USETRACK_STORE_URL", "memory://"),
            ]))
            .unwrap();
        assert_eq!(explicit.store_url().unwrap(), StoreUrl::Memory);
    }

    #[test]
    fn non_numeric_interval_fails_fast() {
        let err = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_REPORTING_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Configuration);
        assert!(err.to_string().contains("reporting.interval_secs"));
    }

    #[test]
    fn unknown_backend_fails_fast() {
        let err = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_STORE_BACKEND", "file")]))
            .unwrap_err();
        assert!(err.to_string().contains("store.backend"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ConfigLoader::new()
            .without_env()
            .with_overrides(|c| c.reporting.interval_secs = 0)
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("must be greater than zero"));
    }

    #[test]
    fn disable_auto_start_inverts() {
        let config = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_DISABLE_AUTO_START", "true")]))
            .unwrap();
        assert!(!config.reporting.auto_start);
    }

    #[test]
    fn ignore_list_is_split_and_trimmed() {
        let config = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_IGNORE", "vendor/, test/ ,,")]))
            .unwrap();
        assert_eq!(config.trackers.ignore, vec!["vendor/", "test/"]);
    }

    #[test]
    fn layers_apply_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
environment = "staging"

[reporting]
interval_secs = 10
wiggle_secs = 2

[web]
paged_reporting = true
"#
        )
        .unwrap();

        let config = ConfigLoader::new()
            .file(file.path())
            .with_overrides(|c| c.reporting.wiggle_secs = 5)
            .load_with_env(env(&[("USETRACK_REPORTING_INTERVAL_SECS", "20")]))
            .unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.interval(), Duration::from_secs(20));
        assert_eq!(config.wiggle(), Duration::from_secs(5));
        assert!(config.web.paged_reporting);
        // Untouched sections keep their defaults.
        assert_eq!(config.web.page_size, 100);
    }

    #[test]
    fn malformed_file_is_a_config_fault() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reporting = 7").unwrap();
        let err = ConfigLoader::new()
            .file(file.path())
            .load_with_env(env(&[]))
            .unwrap_err();
        assert!(matches!(err, UsetrackError::ConfigFile { .. }));
    }

    #[test]
    fn parses_store_urls() {
        assert_eq!("memory://".parse::<StoreUrl>().unwrap(), StoreUrl::Memory);
        assert_eq!(
            "redis://localhost".parse::<StoreUrl>().unwrap(),
            StoreUrl::Resp { addr: "localhost:6379".into(), db: 0 }
        );
        assert!("file:///tmp/x".parse::<StoreUrl>().is_err());
        assert!("redis://u:p@host".parse::<StoreUrl>().is_err());
        assert!("redis://host/abc".parse::<StoreUrl>().is_err());
    }

    #[test]
    fn page_size_is_bounded() {
        let err = ConfigLoader::new()
            .load_with_env(env(&[("USETRACK_PAGE_SIZE", "5000")]))
            .unwrap_err();
        assert!(err.to_string().contains("web.page_size"));
    }
}
