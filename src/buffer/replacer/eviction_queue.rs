//! Ordered set of memory-resident records.
//!
//! The queue is keyed by `(ordering_value, key)`; the first entry is the
//! next eviction candidate. It owns the cache's access clock.
//!
//! # Thread Safety
//! Entries live in a lock-free skip list, so touches of different records
//! never contend. Callers hold the record's state lock when adding,
//! removing, or touching, which keeps each record's single position
//! consistent. Scans hand out one entry at a time and may miss entries that
//! move concurrently.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::buffer::record::{LocationRecord, RecordState};
use crate::buffer::replacer::{AccessStats, OrderingPolicy};
use crate::common::ObjectKey;

/// Position of a record in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvictionKey {
    pub ordering_value: u64,
    pub key: ObjectKey,
}

pub struct EvictionQueue {
    entries: SkipMap<EvictionKey, Arc<LocationRecord>>,
    policy: Box<dyn OrderingPolicy>,
    clock: AtomicU64,
}

impl EvictionQueue {
    pub fn new(policy: Box<dyn OrderingPolicy>) -> Self {
        Self {
            entries: SkipMap::new(),
            policy,
            clock: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &dyn OrderingPolicy {
        self.policy.as_ref()
    }

    /// Current clock value.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Advance the clock and return the value before the tick.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh history for a record created now.
    pub fn initial_stats(&self) -> AccessStats {
        let mut stats = AccessStats::new(self.now());
        self.policy.record_access(&mut stats, self.tick());
        stats
    }

    fn position(record: &LocationRecord, state: &RecordState) -> EvictionKey {
        EvictionKey {
            ordering_value: state.stats.ordering_value,
            key: record.key(),
        }
    }

    pub fn add(&self, record: &Arc<LocationRecord>, state: &RecordState) {
        self.entries
            .insert(Self::position(record, state), Arc::clone(record));
    }

    pub fn remove(&self, record: &LocationRecord, state: &RecordState) -> bool {
        self.entries.remove(&Self::position(record, state)).is_some()
    }

    /// Record an access and reposition the record.
    pub fn touch(&self, record: &Arc<LocationRecord>, state: &mut RecordState) {
        let present = self.entries.remove(&Self::position(record, state)).is_some();
        self.policy.record_access(&mut state.stats, self.tick());
        if present {
            self.entries
                .insert(Self::position(record, state), Arc::clone(record));
        }
    }

    /// Record an access of an object outside the queue.
    pub fn record_access(&self, state: &mut RecordState) {
        self.policy.record_access(&mut state.stats, self.tick());
    }

    /// Ordering value `state` would carry if accessed now.
    pub fn projected_ordering_value(&self, state: &RecordState) -> u64 {
        self.policy.projected_ordering_value(&state.stats, self.now())
    }

    /// Lowest entry.
    pub fn first(&self) -> Option<(EvictionKey, Arc<LocationRecord>)> {
        self.entries
            .front()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
    }

    /// Entry following `cursor`, or the first entry for `None`.
    pub fn next_after(
        &self,
        cursor: Option<EvictionKey>,
    ) -> Option<(EvictionKey, Arc<LocationRecord>)> {
        let entry = match &cursor {
            Some(cursor) => self.entries.lower_bound(Bound::Excluded(cursor)),
            None => self.entries.front(),
        };
        entry.map(|entry| (*entry.key(), Arc::clone(entry.value())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
