//! # In-Memory Store
//!
//! Purpose: Execute the store command model against process-local state with
//! the same reply shapes a Redis-compatible server produces.
//!
//! ## Design Principles
//!
//! 1. **Atomic Pipelines**: A whole batch runs under one lock, so a merge is
//!    never observed half-applied by a reader in the same process.
//! 2. **Ordered Structures**: Sorted sets keep a `(score, member)` index and
//!    hashes use a `BTreeMap`, giving deterministic ranges and scan cursors.
//! 3. **Outage Simulation**: [`MemoryStore::set_offline`] makes every call fail
//!    like an unreachable server, for exercising degraded paths.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use usetrack_common::{UsetrackError, UsetrackResult};

use crate::command::{Command, Reply, ZAddCondition};
use crate::store::SharedStore;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, u64, RandomState>,
    order: BTreeSet<(u64, String)>,
}

impl SortedSet {
    fn set(&mut self, member: &str, score: u64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(old, member.to_string()));
        }
        self.order.insert((score, member.to_string()));
    }

    fn score(&self, member: &str) -> Option<u64> {
        self.scores.get(member).copied()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug)]
enum Value {
    Sorted(SortedSet),
    Hash(BTreeMap<String, u64>),
}

type Keyspace = HashMap<String, Value, RandomState>;

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Keyspace>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Makes subsequent calls fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.keys.lock().len()
    }

    fn apply(keys: &mut Keyspace, command: Command) -> Reply {
        match command {
            Command::Ping => Reply::Status("PONG".into()),
            Command::Select(_) => Reply::ok(),
            Command::ZIncrBy { key, member, delta } => match sorted_mut(keys, key) {
                Some(set) => {
                    let score = set.score(&member).unwrap_or(0).saturating_add(delta);
                    set.set(&member, score);
                    Reply::bulk(score.to_string())
                }
                None => Reply::Error(WRONGTYPE.into()),
            },
            Command::ZAdd {
                key,
                condition,
                entries,
            } => match sorted_mut(keys, key) {
                Some(set) => {
                    let mut added = 0;
                    for (score, member) in entries {
                        match set.score(&member) {
                            None => {
                                set.set(&member, score);
                                added += 1;
                            }
                            Some(current) => {
                                let replace = match condition {
                                    ZAddCondition::LessThan => score < current,
                                    ZAddCondition::GreaterThan => score > current,
                                };
                                if replace {
                                    set.set(&member, score);
                                }
                            }
                        }
                    }
                    Reply::Integer(added)
                }
                None => Reply::Error(WRONGTYPE.into()),
            },
            Command::ZRevRangeWithScores { key, start, stop } => match keys.get(&key) {
                None => Reply::Array(Some(Vec::new())),
                Some(Value::Sorted(set)) => {
                    let Some((start, stop)) = resolve_range(start, stop, set.len()) else {
                        return Reply::Array(Some(Vec::new()));
                    };
                    let items = set
                        .order
                        .iter()
                        .rev()
                        .skip(start)
                        .take(stop - start + 1)
                        .flat_map(|(score, member)| {
                            [Reply::bulk(member.as_str()), Reply::bulk(score.to_string())]
                        })
                        .collect();
                    Reply::Array(Some(items))
                }
                Some(_) => Reply::Error(WRONGTYPE.into()),
            },
            Command::ZMScore { key, members } => {
                if members.is_empty() {
                    return Reply::Error("ERR wrong number of arguments for 'zmscore' command".into());
                }
                match keys.get(&key) {
                    None => Reply::Array(Some(members.iter().map(|_| Reply::Bulk(None)).collect())),
                    Some(Value::Sorted(set)) => Reply::Array(Some(
                        members
                            .iter()
                            .map(|m| match set.score(m) {
                                Some(score) => Reply::bulk(score.to_string()),
                                None => Reply::Bulk(None),
                            })
                            .collect(),
                    )),
                    Some(_) => Reply::Error(WRONGTYPE.into()),
                }
            }
            Command::ZCard { key } => match keys.get(&key) {
                None => Reply::Integer(0),
                Some(Value::Sorted(set)) => Reply::Integer(set.len() as i64),
                Some(_) => Reply::Error(WRONGTYPE.into()),
            },
            Command::HIncrBy { key, field, delta } => match hash_mut(keys, key) {
                Some(hash) => {
                    let value = hash.entry(field).or_insert(0);
                    *value = value.saturating_add(delta);
                    Reply::Integer(*value as i64)
                }
                None => Reply::Error(WRONGTYPE.into()),
            },
            Command::HGetAll { key } => match keys.get(&key) {
                None => Reply::Array(Some(Vec::new())),
                Some(Value::Hash(hash)) => Reply::Array(Some(
                    hash.iter()
                        .flat_map(|(f, v)| [Reply::bulk(f.as_str()), Reply::bulk(v.to_string())])
                        .collect(),
                )),
                Some(_) => Reply::Error(WRONGTYPE.into()),
            },
            Command::HScan { key, cursor, count } => match keys.get(&key) {
                None => Reply::Array(Some(vec![Reply::bulk("0"), Reply::Array(Some(Vec::new()))])),
                Some(Value::Hash(hash)) => {
                    // The cursor is a position in field order; stable while no writes interleave.
                    let start = cursor as usize;
                    let count = count.max(1);
                    let items: Vec<Reply> = hash
                        .iter()
                        .skip(start)
                        .take(count)
                        .flat_map(|(f, v)| [Reply::bulk(f.as_str()), Reply::bulk(v.to_string())])
                        .collect();
                    let next = start.saturating_add(items.len() / 2);
                    let next = if next >= hash.len() { 0 } else { next };
                    Reply::Array(Some(vec![
                        Reply::bulk(next.to_string()),
                        Reply::Array(Some(items)),
                    ]))
                }
                Some(_) => Reply::Error(WRONGTYPE.into()),
            },
            Command::HLen { key } => match keys.get(&key) {
                None => Reply::Integer(0),
                Some(Value::Hash(hash)) => Reply::Integer(hash.len() as i64),
                Some(_) => Reply::Error(WRONGTYPE.into()),
            },
            Command::Del { keys: targets } => {
                let removed = targets.iter().filter(|k| keys.remove(*k).is_some()).count();
                Reply::Integer(removed as i64)
            }
        }
    }
}

fn sorted_mut(keys: &mut Keyspace, key: String) -> Option<&mut SortedSet> {
    match keys
        .entry(key)
        .or_insert_with(|| Value::Sorted(SortedSet::default()))
    {
        Value::Sorted(set) => Some(set),
        Value::Hash(_) => None,
    }
}

fn hash_mut(keys: &mut Keyspace, key: String) -> Option<&mut BTreeMap<String, u64>> {
    match keys
        .entry(key)
        .or_insert_with(|| Value::Hash(BTreeMap::new()))
    {
        Value::Hash(hash) => Some(hash),
        Value::Sorted(_) => None,
    }
}

/// Resolves Redis-style inclusive indexes against `len`.
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn execute(&self, commands: Vec<Command>) -> UsetrackResult<Vec<Reply>> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(UsetrackError::Unreachable(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory store is offline",
            )));
        }
        let mut keys = self.keys.lock();
        Ok(commands
            .into_iter()
            .map(|command| Self::apply(&mut keys, command))
            .collect())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::into_pairs;

    async fn run(store: &MemoryStore, command: Command) -> Reply {
        store.execute(vec![command]).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn zincrby_accumulates() {
        let store = MemoryStore::new();
        for delta in [2, 3] {
            run(&store, Command::ZIncrBy { key: "z".into(), member: "a".into(), delta }).await;
        }
        let reply = run(&store, Command::ZRevRangeWithScores { key: "z".into(), start: 0, stop: -1 }).await;
        assert_eq!(into_pairs(reply.into_array().unwrap()).unwrap(), vec![("a".to_string(), 5)]);
    }

    #[tokio::test]
    async fn zadd_lt_and_gt_keep_extremes() {
        let store = MemoryStore::new();
        for score in [50, 10, 30] {
            run(
                &store,
                Command::ZAdd {
                    key: "first".into(),
                    condition: ZAddCondition::LessThan,
                    entries: vec![(score, "a".into())],
                },
            )
            .await;
            run(
                &store,
                Command::ZAdd {
                    key: "last".into(),
                    condition: ZAddCondition::GreaterThan,
                    entries: vec![(score, "a".into())],
                },
            )
            .await;
        }
        let first = run(&store, Command::ZMScore { key: "first".into(), members: vec!["a".into(), "b".into()] }).await;
        let first: Vec<_> = first.into_array().unwrap().into_iter().map(|r| r.into_score().unwrap()).collect();
        assert_eq!(first, vec![Some(10), None]);

        let last = run(&store, Command::ZMScore { key: "last".into(), members: vec!["a".into()] }).await;
        assert_eq!(last.into_array().unwrap().remove(0).into_score().unwrap(), Some(50));
    }

    #[tokio::test]
    async fn zrevrange_orders_by_score_descending() {
        let store = MemoryStore::new();
        for (member, delta) in [("low", 1), ("high", 9), ("mid", 4)] {
            run(&store, Command::ZIncrBy { key: "z".into(), member: member.into(), delta }).await;
        }
        let reply = run(&store, Command::ZRevRangeWithScores { key: "z".into(), start: 1, stop: 5 }).await;
        let names: Vec<_> = into_pairs(reply.into_array().unwrap())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, ["mid", "low"]);
    }

    #[tokio::test]
    async fn hscan_walks_every_field_once() {
        let store = MemoryStore::new();
        let commands = (0..25)
            .map(|i| Command::HIncrBy { key: "h".into(), field: format!("f{i:02}"), delta: 1 })
            .collect();
        store.execute(commands).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let reply = run(&store, Command::HScan { key: "h".into(), cursor, count: 10 }).await;
            let mut parts = reply.into_array().unwrap();
            let items = parts.pop().unwrap().into_array().unwrap();
            cursor = parts.pop().unwrap().into_string().unwrap().parse().unwrap();
            seen.extend(into_pairs(items).unwrap().into_iter().map(|(f, _)| f));
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 25);
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error_reply() {
        let store = MemoryStore::new();
        run(&store, Command::HIncrBy { key: "k".into(), field: "f".into(), delta: 1 }).await;
        let reply = run(&store, Command::ZIncrBy { key: "k".into(), member: "m".into(), delta: 1 }).await;
        assert!(matches!(reply, Reply::Error(_)));
    }

    #[tokio::test]
    async fn del_removes_keys() {
        let store = MemoryStore::new();
        run(&store, Command::HIncrBy { key: "a".into(), field: "f".into(), delta: 1 }).await;
        let reply = run(&store, Command::Del { keys: vec!["a".into(), "missing".into()] }).await;
        assert_eq!(reply, Reply::Integer(1));
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn offline_store_is_unreachable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.execute(vec![Command::Ping]).await.unwrap_err();
        assert!(err.is_retryable());
        store.set_offline(false);
        assert_eq!(run(&store, Command::Ping).await, Reply::Status("PONG".into()));
    }

    #[test]
    fn resolves_negative_ranges() {
        assert_eq!(resolve_range(0, -1, 5), Some((0, 4)));
        assert_eq!(resolve_range(3, 100, 5), Some((3, 4)));
        assert_eq!(resolve_range(5, 9, 5), None);
        assert_eq!(resolve_range(0, -1, 0), None);
    }
}
