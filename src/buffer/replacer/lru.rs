//! Recency-only ordering.

use super::{AccessStats, OrderingPolicy};

/// Orders objects by last access alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl OrderingPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn record_access(&self, stats: &mut AccessStats, now: u64) {
        stats.last_access = now;
        stats.ordering_value = now;
        stats.access_count = stats.access_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_orders_by_last_access() {
        let policy = LruPolicy;
        let mut stats = AccessStats::new(3);
        policy.record_access(&mut stats, 10);
        assert_eq!(stats.ordering_value, 10);
        assert_eq!(stats.access_count, 1);
        assert_eq!(policy.projected_ordering_value(&stats, 42), 42);
        assert_eq!(stats.ordering_value, 10);
    }
}
