//! # Storage Adapter Interface
//!
//! ## Design Principles
//!
//! 1. **Three Operations**: `merge`, `read` and `clear` are the whole contract;
//!    paging and counting are read variants.
//! 2. **Commutative Merge**: Hits are added with increment commands and
//!    timestamps with `ZADD LT`/`ZADD GT`, so merge order across processes
//!    never changes the aggregate.
//! 3. **Eventually Consistent Clear**: A clear racing a merge may lose that
//!    merge or let it re-create the units it carried; neither corrupts counts.
//! 4. **Backend-Neutral Semantics**: Both backends return identical
//!    observable results; only their cost profile differs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use usetrack_common::{
    AggregateRecord, BackendKind, Config, Namespace, Snapshot, TrackerKind, UsetrackError,
    UsetrackResult,
};

use crate::command::{Command, Reply, ZAddCondition, into_pairs};
use crate::hash::HashAdapter;
use crate::sorted::SortedSetAdapter;
use crate::store::SharedStore;

/// Units per pipelined batch during a merge.
pub(crate) const MERGE_CHUNK: usize = 512;

/// One page of a paged read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<AggregateRecord>,
    /// Opaque cursor for the next page; `None` once the namespace is exhausted.
    pub next_cursor: Option<String>,
}

/// Merge/read/clear contract over one namespace.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    fn backend(&self) -> BackendKind;

    /// Adds a drained snapshot to the shared aggregate.
    async fn merge(&self, snapshot: &Snapshot) -> UsetrackResult<()>;

    /// Reads every record, most used first.
    async fn read(&self) -> UsetrackResult<Vec<AggregateRecord>>;

    /// Reads up to `limit` records starting at `cursor` (`None` = first page).
    ///
    /// Page boundaries are only stable while no merge runs concurrently.
    async fn read_page(&self, cursor: Option<&str>, limit: usize) -> UsetrackResult<Page>;

    /// Number of distinct units in the aggregate.
    async fn unit_count(&self) -> UsetrackResult<usize>;

    /// Removes every record of the namespace.
    async fn clear(&self) -> UsetrackResult<()>;
}

/// Builds the adapter selected by `config` for `kind`.
pub fn build_adapter(
    config: &Config,
    kind: TrackerKind,
    store: Arc<dyn SharedStore>,
) -> Arc<dyn StorageAdapter> {
    let namespace = config.namespace(kind);
    match config.store.backend {
        BackendKind::Sorted => Arc::new(SortedSetAdapter::new(namespace, store)),
        BackendKind::Hash => Arc::new(HashAdapter::new(namespace, store)),
    }
}

/// Commands recording the observation window of each unit in `chunk`.
pub(crate) fn timestamp_commands(
    namespace: &Namespace,
    chunk: &[(&str, &usetrack_common::UnitStats)],
) -> [Command; 2] {
    [
        Command::ZAdd {
            key: namespace.first_seen_key(),
            condition: ZAddCondition::LessThan,
            entries: chunk
                .iter()
                .map(|(name, stats)| (stats.first_seen, name.to_string()))
                .collect(),
        },
        Command::ZAdd {
            key: namespace.last_seen_key(),
            condition: ZAddCondition::GreaterThan,
            entries: chunk
                .iter()
                .map(|(name, stats)| (stats.last_seen, name.to_string()))
                .collect(),
        },
    ]
}

/// Runs a merge pipeline chunk by chunk, building per-unit hit commands with `hit`.
pub(crate) async fn run_merge(
    store: &dyn SharedStore,
    namespace: &Namespace,
    snapshot: &Snapshot,
    hit: impl Fn(&str, u64) -> Command,
) -> UsetrackResult<()> {
    let entries: Vec<_> = snapshot.iter().filter(|(_, s)| s.hits > 0).collect();
    for chunk in entries.chunks(MERGE_CHUNK) {
        let mut commands = Vec::with_capacity(chunk.len() + 2);
        commands.extend(chunk.iter().map(|(name, stats)| hit(name, stats.hits)));
        commands.extend(timestamp_commands(namespace, chunk));
        for reply in store.execute(commands).await? {
            reply.check()?;
        }
    }
    Ok(())
}

/// Reads both timestamp sets in full.
pub(crate) fn full_timestamp_commands(namespace: &Namespace) -> [Command; 2] {
    [
        Command::ZRevRangeWithScores {
            key: namespace.first_seen_key(),
            start: 0,
            stop: -1,
        },
        Command::ZRevRangeWithScores {
            key: namespace.last_seen_key(),
            start: 0,
            stop: -1,
        },
    ]
}

/// Joins hit pairs with full timestamp replies into records.
pub(crate) fn join_full(
    hits: Vec<(String, u64)>,
    first: Reply,
    last: Reply,
) -> UsetrackResult<Vec<AggregateRecord>> {
    let first: HashMap<String, u64> = into_pairs(first.into_array()?)?.into_iter().collect();
    let last: HashMap<String, u64> = into_pairs(last.into_array()?)?.into_iter().collect();
    let mut records: Vec<AggregateRecord> = hits
        .into_iter()
        .map(|(name, hits)| AggregateRecord {
            first_seen: first.get(&name).copied(),
            last_seen: last.get(&name).copied(),
            name,
            hits,
        })
        .collect();
    usetrack_common::sort_by_popularity(&mut records);
    Ok(records)
}

/// Fetches timestamps for one page of hit pairs and builds records in page order.
pub(crate) async fn attach_timestamps(
    store: &dyn SharedStore,
    namespace: &Namespace,
    hits: Vec<(String, u64)>,
) -> UsetrackResult<Vec<AggregateRecord>> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }
    let members: Vec<String> = hits.iter().map(|(name, _)| name.clone()).collect();
    let mut replies = store
        .execute(vec![
            Command::ZMScore {
                key: namespace.first_seen_key(),
                members: members.clone(),
            },
            Command::ZMScore {
                key: namespace.last_seen_key(),
                members,
            },
        ])
        .await?
        .into_iter();
    let (Some(first), Some(last)) = (replies.next(), replies.next()) else {
        return Err(UsetrackError::ProtocolViolation("missing ZMSCORE reply".into()));
    };
    let first = first.into_array()?;
    let last = last.into_array()?;
    if first.len() != hits.len() || last.len() != hits.len() {
        return Err(UsetrackError::ProtocolViolation(
            "ZMSCORE reply length mismatch".into(),
        ));
    }

    hits.into_iter()
        .zip(first.into_iter().zip(last))
        .map(|((name, hits), (first, last))| {
            Ok(AggregateRecord {
                name,
                hits,
                first_seen: first.into_score()?,
                last_seen: last.into_score()?,
            })
        })
        .collect()
}

/// Deletes every key of the namespace.
pub(crate) async fn clear_namespace(
    store: &dyn SharedStore,
    namespace: &Namespace,
) -> UsetrackResult<()> {
    let keys = namespace.keys().to_vec();
    for reply in store.execute(vec![Command::Del { keys }]).await? {
        reply.check()?;
    }
    Ok(())
}

pub(crate) fn parse_cursor(cursor: Option<&str>) -> UsetrackResult<u64> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| UsetrackError::InvalidCursor(raw.to_string())),
    }
}
