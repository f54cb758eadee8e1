//! # Hash Backend
//!
//! Each namespace is one flat hash with the hit count as field value. A merge
//! is one `HINCRBY` per unit, constant cost regardless of how many units the
//! namespace already holds. Full reads sort client-side; paged reads walk the
//! hash with `HSCAN`, whose cursor is opaque to callers.
//!
//! A Redis server may return more fields than requested for small hashes;
//! `limit` is a hint for this backend.

use std::sync::Arc;

use async_trait::async_trait;
use usetrack_common::{
    AggregateRecord, BackendKind, Namespace, Snapshot, UsetrackError, UsetrackResult,
};

use crate::adapter::{
    Page, StorageAdapter, attach_timestamps, clear_namespace, full_timestamp_commands, join_full,
    parse_cursor, run_merge,
};
use crate::command::{Command, into_pairs};
use crate::store::SharedStore;

pub struct HashAdapter {
    namespace: Namespace,
    store: Arc<dyn SharedStore>,
}

impl HashAdapter {
    pub fn new(namespace: Namespace, store: Arc<dyn SharedStore>) -> Self {
        HashAdapter { namespace, store }
    }
}

#[async_trait]
impl StorageAdapter for HashAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Hash
    }

    async fn merge(&self, snapshot: &Snapshot) -> UsetrackResult<()> {
        let key = self.namespace.hits_key();
        run_merge(self.store.as_ref(), &self.namespace, snapshot, |name, delta| {
            Command::HIncrBy {
                key: key.clone(),
                field: name.to_string(),
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
                Command::HGetAll {
                    key: self.namespace.hits_key(),
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
        let cursor = parse_cursor(cursor)?;
        let reply = crate::store::execute_one(
            self.store.as_ref(),
            Command::HScan {
                key: self.namespace.hits_key(),
                cursor,
                count: limit.max(1),
            },
        )
        .await?;

        let mut parts = reply.into_array()?.into_iter();
        let (Some(next), Some(items)) = (parts.next(), parts.next()) else {
            return Err(UsetrackError::ProtocolViolation("malformed HSCAN reply".into()));
        };
        let next = next.into_string()?;
        let hits = into_pairs(items.into_array()?)?;

        let records = attach_timestamps(self.store.as_ref(), &self.namespace, hits).await?;
        Ok(Page {
            records,
            next_cursor: (next != "0").then_some(next),
        })
    }

    async fn unit_count(&self) -> UsetrackResult<usize> {
        let reply = crate::store::execute_one(
            self.store.as_ref(),
            Command::HLen {
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
