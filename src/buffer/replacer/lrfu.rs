//! Least recently/frequently used ordering.
//!
//! Each access folds into a combined recency/frequency weight that decays
//! by half every `half_life` clock ticks:
//!
//! ```text
//! crf'      = 1 + crf × 0.5^((now - last_access) / half_life)
//! ordering  = now + half_life × log2(crf')
//! ```
//!
//! An object touched once orders exactly at its access time. Frequently
//! touched objects earn a bonus of up to about `half_life × log2(half_life)`
//! ticks, so they outlast a burst of one-off accesses.

use super::{AccessStats, OrderingPolicy};

/// Default half-life in clock ticks.
pub const DEFAULT_HALF_LIFE: u64 = 1 << 10;

#[derive(Debug, Clone, Copy)]
pub struct LrfuPolicy {
    half_life: f64,
}

impl LrfuPolicy {
    pub fn new(half_life: u64) -> Self {
        Self {
            half_life: half_life.max(1) as f64,
        }
    }

    pub fn half_life(&self) -> u64 {
        self.half_life as u64
    }
}

impl Default for LrfuPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HALF_LIFE)
    }
}

impl OrderingPolicy for LrfuPolicy {
    fn name(&self) -> &'static str {
        "lrfu"
    }

    fn record_access(&self, stats: &mut AccessStats, now: u64) {
        let elapsed = now.saturating_sub(stats.last_access) as f64;
        let decay = 0.5f64.powf(elapsed / self.half_life);
        stats.crf = 1.0 + stats.crf * decay;
        stats.last_access = now;
        stats.access_count = stats.access_count.saturating_add(1);

        let bonus = if stats.crf > 1.0 {
            (self.half_life * stats.crf.log2()) as u64
        } else {
            0
        };
        stats.ordering_value = now.saturating_add(bonus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_access_orders_at_clock() {
        let policy = LrfuPolicy::new(100);
        let mut stats = AccessStats::new(0);
        policy.record_access(&mut stats, 50);
        assert_eq!(stats.ordering_value, 50);
        assert_eq!(stats.crf, 1.0);
    }

    #[test]
    fn test_frequency_earns_bonus() {
        let policy = LrfuPolicy::new(100);
        let mut hot = AccessStats::new(0);
        for now in 0..10 {
            policy.record_access(&mut hot, now);
        }
        let mut cold = AccessStats::new(9);
        policy.record_access(&mut cold, 9);

        assert!(hot.ordering_value > cold.ordering_value);
        assert_eq!(hot.access_count, 10);
    }

    #[test]
    fn test_weight_decays_with_idle_time() {
        let policy = LrfuPolicy::new(10);
        let mut stats = AccessStats::new(0);
        policy.record_access(&mut stats, 0);
        policy.record_access(&mut stats, 0);
        assert_eq!(stats.crf, 2.0);

        policy.record_access(&mut stats, 10);
        assert!((stats.crf - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_later_access_never_orders_lower() {
        let policy = LrfuPolicy::default();
        let base = AccessStats::new(0);
        let early = policy.projected_ordering_value(&base, 100);
        let late = policy.projected_ordering_value(&base, 200);
        assert!(late > early);
    }
}
