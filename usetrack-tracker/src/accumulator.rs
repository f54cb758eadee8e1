//! # Local Accumulator
//!
//! Per-process, per-tracker counter map written on the request path and
//! drained by the reporter.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Units hash onto a fixed set of shards so concurrent
//!    writers rarely meet; a known unit only takes a shard read lock.
//! 2. **Atomic Counters**: Hits and timestamps are atomics, so repeat
//!    observations never need a write lock.
//! 3. **Swap on Drain**: `drain` replaces each shard's map under its write lock.
//!    A `record` holds the read lock for its whole update, so it lands either
//!    in the drained snapshot or in the fresh map, never both and never neither.
//! 4. **Bounded Growth**: New units beyond `max_units` are refused and counted
//!    instead of growing the map without limit.
//!
//! ## Notes
//! - A drain starts each unit's window afresh; timestamps are not carried over.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::hash::BuildHasher;
use usetrack_common::{Snapshot, TrackerKind, UnitStats, UsetrackError, UsetrackResult};

/// Number of shards; a power of two so the index is a mask.
const SHARDS: usize = 32;

#[derive(Debug)]
struct Counter {
    hits: AtomicU64,
    first_seen: AtomicU64,
    last_seen: AtomicU64,
}

impl Counter {
    fn new(stats: UnitStats) -> Self {
        Counter {
            hits: AtomicU64::new(stats.hits),
            first_seen: AtomicU64::new(stats.first_seen),
            last_seen: AtomicU64::new(stats.last_seen),
        }
    }

    fn add(&self, stats: UnitStats) {
        self.hits.fetch_add(stats.hits, Ordering::Relaxed);
        self.first_seen.fetch_min(stats.first_seen, Ordering::Relaxed);
        self.last_seen.fetch_max(stats.last_seen, Ordering::Relaxed);
    }

    fn into_stats(self) -> UnitStats {
        UnitStats {
            hits: self.hits.into_inner(),
            first_seen: self.first_seen.into_inner(),
            last_seen: self.last_seen.into_inner(),
        }
    }
}

type Shard = HashMap<Box<str>, Counter, RandomState>;

/// Concurrent unit → counter map for one tracker kind.
pub struct LocalAccumulator {
    kind: TrackerKind,
    shards: Box<[RwLock<Shard>]>,
    router: RandomState,
    units: AtomicUsize,
    max_units: usize,
    dropped: AtomicU64,
}

impl LocalAccumulator {
    /// Creates an empty accumulator that holds at most `max_units` distinct units.
    pub fn new(kind: TrackerKind, max_units: usize) -> Self {
        let shards = (0..SHARDS)
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LocalAccumulator {
            kind,
            shards,
            router: RandomState::new(),
            units: AtomicUsize::new(0),
            max_units,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    /// Records one observation of `name` at `now` (unix seconds).
    ///
    /// Fails only when `name` is new and the accumulator is full; the
    /// observation is then counted in [`Self::take_dropped`].
    pub fn record(&self, name: &str, now: u64) -> UsetrackResult<()> {
        self.add(name, UnitStats::new(1, now))
    }

    fn add(&self, name: &str, stats: UnitStats) -> UsetrackResult<()> {
        let shard = &self.shards[self.shard_index(name)];

        if let Some(counter) = shard.read().get(name) {
            counter.add(stats);
            return Ok(());
        }

        let mut map = shard.write();
        // Another writer may have inserted between the two locks.
        if let Some(counter) = map.get(name) {
            counter.add(stats);
            return Ok(());
        }
        if self.units.fetch_add(1, Ordering::Relaxed) >= self.max_units {
            self.units.fetch_sub(1, Ordering::Relaxed);
            self.dropped.fetch_add(stats.hits, Ordering::Relaxed);
            return Err(UsetrackError::CapacityExceeded(self.max_units));
        }
        map.insert(name.into(), Counter::new(stats));
        Ok(())
    }

    /// Swaps out every shard and returns what they held.
    pub fn drain(&self) -> Snapshot {
        let mut snapshot = Snapshot::with_capacity(self.units.load(Ordering::Relaxed));
        for shard in self.shards.iter() {
            let taken = std::mem::take(&mut *shard.write());
            self.units.fetch_sub(taken.len(), Ordering::Relaxed);
            for (name, counter) in taken {
                snapshot.insert(String::from(name), counter.into_stats());
            }
        }
        snapshot
    }

    /// Puts a snapshot back, e.g. after a failed merge.
    ///
    /// Returns how many units could not be restored because the accumulator
    /// filled up in the meantime.
    pub fn restore(&self, snapshot: Snapshot) -> usize {
        snapshot
            .into_iter()
            .filter(|(name, stats)| self.add(name, *stats).is_err())
            .count()
    }

    /// Returns and resets the number of observations refused since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Distinct units currently held.
    pub fn len(&self) -> usize {
        self.units.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self, name: &str) -> usize {
        (self.router.hash_one(name) as usize) & (SHARDS - 1)
    }
}
