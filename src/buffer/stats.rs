//! Buffer cache statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by the buffer cache.
///
/// All fields are atomic for lock-free, thread-safe updates.
///
/// # Memory Ordering
/// All operations use `Ordering::Relaxed`: the counters are independent and
/// only need atomicity.
///
/// # Example
/// ```
/// use spillcache::CacheStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = CacheStats::new();
/// stats.memory_hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.memory_hits.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug)]
pub struct CacheStats {
    /// Objects stored into memory by `add`.
    pub objects_added: AtomicU64,

    /// Gets served straight from the memory buffer.
    pub memory_hits: AtomicU64,

    /// Gets that had to read the object back from storage.
    pub storage_reads: AtomicU64,

    /// Objects written out to storage.
    pub storage_writes: AtomicU64,

    /// Objects pushed out of memory by the evictor.
    pub evictions: AtomicU64,

    /// Storage blocks moved by defragmentation.
    pub defrag_moves: AtomicU64,
}

impl CacheStats {
    /// Create a new stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            objects_added: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            storage_reads: AtomicU64::new(0),
            storage_writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            defrag_moves: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of gets served from memory (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_added: self.objects_added.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            storage_reads: self.storage_reads.load(Ordering::Relaxed),
            storage_writes: self.storage_writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            defrag_moves: self.defrag_moves.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.objects_added,
            &self.memory_hits,
            &self.storage_reads,
            &self.storage_writes,
            &self.evictions,
            &self.defrag_moves,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub objects_added: u64,
    pub memory_hits: u64,
    pub storage_reads: u64,
    pub storage_writes: u64,
    pub evictions: u64,
    pub defrag_moves: u64,
}

impl StatsSnapshot {
    /// Fraction of gets served from memory (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.storage_reads;
        if total == 0 {
            0.0
        } else {
            self.memory_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ added: {}, hits: {}, reads: {}, writes: {}, evictions: {}, hit_rate: {:.2}% }}",
            self.objects_added,
            self.memory_hits,
            self.storage_reads,
            self.storage_writes,
            self.evictions,
            self.hit_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.memory_hits.load(Ordering::Relaxed), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = CacheStats::new();
        stats.memory_hits.fetch_add(7, Ordering::Relaxed);
        stats.storage_reads.fetch_add(3, Ordering::Relaxed);
        CacheStats::bump(&stats.storage_writes);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.memory_hits, 7);
        assert_eq!(snapshot.storage_reads, 3);
        assert_eq!(snapshot.storage_writes, 1);
        assert_eq!(snapshot.hit_rate(), 0.7);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CacheStats::new();
        stats.evictions.fetch_add(100, Ordering::Relaxed);
        stats.reset();
        assert_eq!(stats.snapshot().evictions, 0);
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats::new();
        stats.memory_hits.fetch_add(80, Ordering::Relaxed);
        stats.storage_reads.fetch_add(20, Ordering::Relaxed);

        let display = format!("{}", stats.snapshot());
        assert!(display.contains("hits: 80"));
        assert!(display.contains("reads: 20"));
        assert!(display.contains("80.00%"));
    }
}
