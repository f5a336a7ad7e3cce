//! The ordering policy seam.

use std::fmt;

/// Access history of one object, kept in its location record.
///
/// The clock is the cache's access counter, not wall time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccessStats {
    /// Clock value of the last access.
    pub last_access: u64,
    /// Combined recency/frequency weight.
    pub crf: f64,
    /// Key in the eviction queue: lower values are evicted first.
    pub ordering_value: u64,
    pub access_count: u32,
}

impl AccessStats {
    /// History of an object first seen at `now`.
    pub fn new(now: u64) -> Self {
        Self {
            last_access: now,
            crf: 0.0,
            ordering_value: now,
            access_count: 0,
        }
    }
}

/// Computes eviction order from access history.
///
/// Implementations must be monotone in recency: of two objects with the
/// same history, the one accessed later never orders lower.
pub trait OrderingPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Fold an access at clock `now` into `stats`.
    fn record_access(&self, stats: &mut AccessStats, now: u64);

    /// Ordering value `stats` would carry after an access at `now`.
    fn projected_ordering_value(&self, stats: &AccessStats, now: u64) -> u64 {
        let mut next = *stats;
        self.record_access(&mut next, now);
        next.ordering_value
    }
}
