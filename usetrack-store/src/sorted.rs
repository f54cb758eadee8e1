//! # Sorted-Set Backend
//!
//! Each namespace is one sorted set with the hit count as score. A merge is one
//! `ZINCRBY` per unit; reads come back already ordered by popularity, and a
//! page is an index range, so the cursor is a plain offset.
//!
//! `ZREVRANGE` breaks hit ties by name descending. Each page is re-sorted to the
//! direct-read order (hits descending, then name ascending); a tie group that
//! straddles a page boundary still splits where the store's order puts it.
//!
//! Cost grows with `log(units)` per increment, which stays cheap up to a few
//! thousand units; past roughly 2000 the hash backend is the better fit.

use std::sync::Arc;

use async_trait::async_trait;
use usetrack_common::{
    AggregateRecord, BackendKind, Namespace, Snapshot, UsetrackError, UsetrackResult,
    sort_by_popularity,
};

use crate::adapter::{
    Page, StorageAdapter, attach_timestamps, clear_namespace, full_timestamp_commands, join_full,
    parse_cursor, run_merge,
};
use crate::command::{Command, into_pairs};
use crate::store::SharedStore;

pub struct SortedSetAdapter {
    namespace: Namespace,
    store: Arc<dyn SharedStore>,
}

impl SortedSetAdapter {
    pub fn new(namespace: Namespace, store: Arc<dyn SharedStore>) -> Self {
        SortedSetAdapter { namespace, store }
    }
}

#[async_trait]
impl StorageAdapter for SortedSetAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Sorted
    }

    async fn merge(&self, snapshot: &Snapshot) -> UsetrackResult<()> {
        let key = self.namespace.hits_key();
        run_merge(self.store.as_ref(), &self.namespace, snapshot, |name, delta| {
            Command::ZIncrBy {
                key: key.clone(),
                member: name.to_string(),
                delta,
            }
        })
        .await
    }

    async fn read(&self) -> UsetrackResult<Vec<AggregateRecord>> {
        let [first, last] = full_timestamp_commands(&self.namespace);
        let mut replies = self
            .store
            .execute(vec![
                Command::ZRevRangeWithScores {
                    key: self.namespace.hits_key(),
                    start: 0,
                    stop: -1,
                },
                first,
                last,
            ])
            .await?
            .into_iter();
        let (Some(hits), Some(first), Some(last)) = (replies.next(), replies.next(), replies.next())
        else {
            return Err(UsetrackError::ProtocolViolation("missing read reply".into()));
        };
        join_full(into_pairs(hits.into_array()?)?, first, last)
    }

    async fn read_page(&self, cursor: Option<&str>, limit: usize) -> UsetrackResult<Page> {
        // Range indexes are signed; larger offsets would wrap into tail indexes.
        let start = i64::try_from(parse_cursor(cursor)?)
            .map_err(|_| UsetrackError::InvalidCursor(cursor.unwrap_or_default().to_string()))?;
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let mut replies = self
            .store
            .execute(vec![
                Command::ZRevRangeWithScores {
                    key: self.namespace.hits_key(),
                    start,
                    stop: start.saturating_add(limit - 1),
                },
                Command::ZCard {
                    key: self.namespace.hits_key(),
                },
            ])
            .await?
            .into_iter();
        let (Some(range), Some(card)) = (replies.next(), replies.next()) else {
            return Err(UsetrackError::ProtocolViolation("missing page reply".into()));
        };
        let hits = into_pairs(range.into_array()?)?;
        let total = card.into_integer()?.max(0) as u64;
        let offset = start as u64;
        let end = offset.saturating_add(hits.len() as u64);

        let mut records = attach_timestamps(self.store.as_ref(), &self.namespace, hits).await?;
        sort_by_popularity(&mut records);
        Ok(Page {
            records,
            next_cursor: (end > offset && end < total).then(|| end.to_string()),
        })
    }

    async fn unit_count(&self) -> UsetrackResult<usize> {
        let reply = crate::store::execute_one(
            self.store.as_ref(),
            Command::ZCard {
                key: self.namespace.hits_key(),
            },
        )
        .await?;
        Ok(reply.into_integer()?.max(0) as usize)
    }

    async fn clear(&self) -> UsetrackResult<()> {
        clear_namespace(self.store.as_ref(), &self.namespace).await
    }
}
