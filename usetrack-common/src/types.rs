//! # Core Types
//!
//! Purpose: Name the things usetrack counts and the shapes they take on their
//! way from a request handler to the shared store.
//!
//! ## Design Principles
//!
//! 1. **Scoped Identity**: A unit name is only meaningful together with its
//!    [`TrackerKind`]; the pair is the [`Unit`].
//! 2. **Plain Data**: Snapshots and records are owned, `Clone`-able values so
//!    they can cross task boundaries and be re-injected after a failed flush.
//! 3. **Mergeable**: [`UnitStats::absorb`] is commutative and associative, which
//!    is the property the whole pipeline leans on.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::UsetrackError;

/// Seconds since the Unix epoch, saturating to zero on clock skew.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The four unit categories.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    /// Source files that executed.
    Code,
    /// Rendered view templates.
    View,
    /// Looked-up translation keys.
    Translation,
    /// Matched routes (method + pattern).
    Route,
}

impl TrackerKind {
    /// All kinds in display order.
    pub const ALL: [TrackerKind; 4] = [Self::Code, Self::View, Self::Translation, Self::Route];

    /// Stable name used in namespaces and URLs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::View => "view",
            Self::Translation => "translation",
            Self::Route => "route",
        }
    }

    /// Prefix used when a unit is displayed outside its namespace.
    pub const fn unit_prefix(self) -> &'static str {
        match self {
            Self::Code => "file",
            Self::View => "view",
            Self::Translation => "i18n",
            Self::Route => "route",
        }
    }

    /// Dense index for per-kind arrays.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerKind {
    type Err = UsetrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" | "file" => Ok(Self::Code),
            "view" | "views" => Ok(Self::View),
            "translation" | "translations" | "i18n" => Ok(Self::Translation),
            "route" | "routes" => Ok(Self::Route),
            other => Err(UsetrackError::invalid_config(
                "kind",
                format!("unknown tracker kind `{other}`"),
            )),
        }
    }
}

/// A unit identity scoped to its tracker kind.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Unit {
    pub kind: TrackerKind,
    pub name: String,
}

impl Unit {
    pub fn new(kind: TrackerKind, name: impl Into<String>) -> Self {
        Unit {
            kind,
            name: name.into(),
        }
    }

    /// Builds a route unit; the method is upper-cased so `get` and `GET` match.
    pub fn route(method: &str, pattern: &str) -> Self {
        Unit::new(TrackerKind::Route, route_name(method, pattern))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.unit_prefix(), self.name)
    }
}

/// Canonical unit name for a route: `METHOD PATTERN`.
pub fn route_name(method: &str, pattern: &str) -> String {
    let mut name = String::with_capacity(method.len() + pattern.len() + 1);
    name.push_str(&method.to_ascii_uppercase());
    name.push(' ');
    name.push_str(pattern);
    name
}

/// Storage Adapter strategy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One sorted set per namespace, hit count as score.
    #[default]
    Sorted,
    /// One hash per namespace, hit count as field value.
    Hash,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sorted => "sorted",
            Self::Hash => "hash",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = UsetrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sorted" | "zset" | "redis" => Ok(Self::Sorted),
            "hash" | "hash_redis" => Ok(Self::Hash),
            other => Err(UsetrackError::invalid_config(
                "store.backend",
                format!("unknown backend `{other}` (expected `sorted` or `hash`)"),
            )),
        }
    }
}

/// Key scope for one tracker kind in one deployment environment.
///
/// Rendered as `{prefix}:{backend}:{kind}:{environment}`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Namespace {
    base: String,
    kind: TrackerKind,
}

impl Namespace {
    pub fn new(prefix: &str, backend: BackendKind, kind: TrackerKind, environment: &str) -> Self {
        Namespace {
            base: format!("{prefix}:{backend}:{kind}:{environment}"),
            kind,
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.base
    }

    /// Key holding hit counts.
    pub fn hits_key(&self) -> String {
        format!("{}:hits", self.base)
    }

    /// Key holding earliest observation timestamps.
    pub fn first_seen_key(&self) -> String {
        format!("{}:first_seen", self.base)
    }

    /// Key holding latest observation timestamps.
    pub fn last_seen_key(&self) -> String {
        format!("{}:last_seen", self.base)
    }

    /// Every key owned by this namespace.
    pub fn keys(&self) -> [String; 3] {
        [self.hits_key(), self.first_seen_key(), self.last_seen_key()]
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

/// Hits and observation window for one unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitStats {
    pub hits: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl UnitStats {
    pub const fn new(hits: u64, at: u64) -> Self {
        UnitStats {
            hits,
            first_seen: at,
            last_seen: at,
        }
    }

    /// Folds another observation window into this one.
    pub fn absorb(&mut self, other: UnitStats) {
        self.hits = self.hits.saturating_add(other.hits);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}

/// Drained contents of one accumulator: unit name to stats.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    entries: HashMap<String, UnitStats>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Snapshot {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Adds `stats` for `name`, combining with any existing entry.
    pub fn insert(&mut self, name: impl Into<String>, stats: UnitStats) {
        self.entries
            .entry(name.into())
            .and_modify(|existing| existing.absorb(stats))
            .or_insert(stats);
    }

    /// Combines every entry of `other` into `self`.
    pub fn merge(&mut self, other: Snapshot) {
        for (name, stats) in other.entries {
            self.insert(name, stats);
        }
    }

    pub fn get(&self, name: &str) -> Option<&UnitStats> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of hits over all units.
    pub fn total_hits(&self) -> u64 {
        self.entries.values().map(|s| s.hits).sum()
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|name, _| keep(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UnitStats)> {
        self.entries.iter().map(|(name, stats)| (name.as_str(), stats))
    }
}

impl FromIterator<(String, UnitStats)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, UnitStats)>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for (name, stats) in iter {
            snapshot.insert(name, stats);
        }
        snapshot
    }
}

impl IntoIterator for Snapshot {
    type Item = (String, UnitStats);
    type IntoIter = std::collections::hash_map::IntoIter<String, UnitStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Cross-process aggregate for one unit as read back from the store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub name: String,
    pub hits: u64,
    /// Earliest observation ever merged; absent if a clear raced the merge.
    pub first_seen: Option<u64>,
    /// Latest observation ever merged.
    pub last_seen: Option<u64>,
}

/// Orders records by popularity, then name, for stable rendering.
pub fn sort_by_popularity(records: &mut [AggregateRecord]) {
    records.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_display_uses_kind_prefix() {
        assert_eq!(Unit::new(TrackerKind::Code, "a.rb").to_string(), "file:a.rb");
        assert_eq!(Unit::new(TrackerKind::View, "index").to_string(), "view:index");
        assert_eq!(
            Unit::new(TrackerKind::Translation, "posts.title").to_string(),
            "i18n:posts.title"
        );
        assert_eq!(Unit::route("get", "/posts/:id").to_string(), "route:GET /posts/:id");
    }

    #[test]
    fn route_methods_are_distinct_units() {
        assert_ne!(Unit::route("GET", "/posts/:id"), Unit::route("PATCH", "/posts/:id"));
        assert_eq!(Unit::route("get", "/up"), Unit::route("GET", "/up"));
    }

    #[test]
    fn namespace_keys_are_scoped() {
        let ns = Namespace::new("usetrack", BackendKind::Hash, TrackerKind::View, "production");
        assert_eq!(ns.as_str(), "usetrack:hash:view:production");
        assert_eq!(ns.hits_key(), "usetrack:hash:view:production:hits");
        assert_eq!(ns.keys().len(), 3);

        let other = Namespace::new("usetrack", BackendKind::Hash, TrackerKind::Route, "production");
        assert_ne!(ns.hits_key(), other.hits_key());
    }

    #[test]
    fn parses_kinds_and_backends() {
        assert_eq!("views".parse::<TrackerKind>().unwrap(), TrackerKind::View);
        assert_eq!("i18n".parse::<TrackerKind>().unwrap(), TrackerKind::Translation);
        assert!("lines".parse::<TrackerKind>().is_err());
        assert_eq!("HASH".parse::<BackendKind>().unwrap(), BackendKind::Hash);
        assert!("file".parse::<BackendKind>().is_err());
    }

    #[test]
    fn absorb_keeps_widest_window() {
        let mut a = UnitStats { hits: 2, first_seen: 10, last_seen: 20 };
        a.absorb(UnitStats { hits: 3, first_seen: 5, last_seen: 15 });
        assert_eq!(a, UnitStats { hits: 5, first_seen: 5, last_seen: 20 });
    }

    #[test]
    fn snapshot_merge_combines_entries() {
        let mut a: Snapshot = [("x".to_string(), UnitStats::new(1, 100))].into_iter().collect();
        let b: Snapshot = [
            ("x".to_string(), UnitStats::new(2, 90)),
            ("y".to_string(), UnitStats::new(4, 110)),
        ]
        .into_iter()
        .collect();
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.total_hits(), 7);
        assert_eq!(a.get("x").unwrap().first_seen, 90);
    }

    #[test]
    fn popularity_order_breaks_ties_by_name() {
        let rec = |name: &str, hits| AggregateRecord {
            name: name.to_string(),
            hits,
            first_seen: None,
            last_seen: None,
        };
        let mut records = vec![rec("b", 1), rec("a", 1), rec("c", 9)];
        sort_by_popularity(&mut records);
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
