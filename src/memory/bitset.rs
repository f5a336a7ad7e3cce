//! Segmented bitmap allocator.
//!
//! A [`ConcurrentBitSet`] tracks used/free status for fixed-size blocks.
//! The bits are split into segments, each behind its own lock, so
//! concurrent allocators starting in different segments never contend.
//!
//! # Segment Layout
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │  Segment 0   │  Segment 1   │  Segment 2   │ ... │
//! │ Mutex<words> │ Mutex<words> │ Mutex<words> │     │
//! └──────────────┴──────────────┴──────────────┴─────┘
//! index = segment × bits_per_segment + relative
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

const WORD_BITS: usize = 64;

/// One lock-protected slice of the bitmap.
struct Segment {
    words: Box<[u64]>,
    /// Bits addressable in this segment (the last segment may be short).
    bits: usize,
    bits_set: usize,
    /// Exact highest set bit, if any.
    highest_set: Option<usize>,
    /// Every bit below this index is set.
    start_search: usize,
}

impl Segment {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(WORD_BITS)].into_boxed_slice(),
            bits,
            bits_set: 0,
            highest_set: None,
            start_search: 0,
        }
    }

    #[inline]
    fn get(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    fn claim_lowest_clear(&mut self) -> Option<usize> {
        if self.bits_set >= self.bits {
            return None;
        }
        let mut word = self.start_search / WORD_BITS;
        while word < self.words.len() {
            let value = self.words[word];
            if value != u64::MAX {
                let bit = word * WORD_BITS + (!value).trailing_zeros() as usize;
                if bit >= self.bits {
                    return None;
                }
                self.words[word] |= 1 << (bit % WORD_BITS);
                self.bits_set += 1;
                self.start_search = bit + 1;
                self.highest_set = Some(self.highest_set.map_or(bit, |h| h.max(bit)));
                return Some(bit);
            }
            word += 1;
        }
        None
    }

    fn clear(&mut self, bit: usize) -> bool {
        if !self.get(bit) {
            return false;
        }
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        self.bits_set -= 1;
        self.start_search = self.start_search.min(bit);
        if self.highest_set == Some(bit) {
            self.highest_set = self.scan_highest(bit);
        }
        true
    }

    /// Highest set bit at or below `from`.
    fn scan_highest(&self, from: usize) -> Option<usize> {
        let mut word = from / WORD_BITS + 1;
        while word > 0 {
            word -= 1;
            let value = self.words[word];
            if value != 0 {
                return Some(word * WORD_BITS + (WORD_BITS - 1) - value.leading_zeros() as usize);
            }
        }
        None
    }
}

/// A concurrently-updatable bitmap split into independently locked segments.
///
/// # Thread Safety
/// - each segment: `Mutex`, held only for a word scan or a single update
/// - `bits_set`: `AtomicUsize`, global population count without locking
/// - `next_segment`: `AtomicUsize`, round-robin starting point
pub struct ConcurrentBitSet {
    segments: Box<[Mutex<Segment>]>,
    bits_per_segment: usize,
    total_bits: usize,
    bits_set: AtomicUsize,
    next_segment: AtomicUsize,
}

impl ConcurrentBitSet {
    /// Create a bitset of `total_bits` spread over about `concurrency` segments.
    pub fn new(total_bits: usize, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let per_segment = total_bits.div_ceil(concurrency).max(1);
        let bits_per_segment = per_segment.div_ceil(WORD_BITS) * WORD_BITS;
        let segment_count = total_bits.div_ceil(bits_per_segment).max(1);
        Self::build(total_bits, bits_per_segment, segment_count)
    }

    /// Create a bitset of exactly `segments` segments of `bits_per_segment` bits.
    pub fn with_segments(bits_per_segment: usize, segments: usize) -> Self {
        let bits_per_segment = bits_per_segment.max(1);
        let segments = segments.max(1);
        Self::build(bits_per_segment * segments, bits_per_segment, segments)
    }

    fn build(total_bits: usize, bits_per_segment: usize, segment_count: usize) -> Self {
        let segments: Vec<Mutex<Segment>> = (0..segment_count)
            .map(|i| {
                let start = i * bits_per_segment;
                let bits = total_bits.saturating_sub(start).min(bits_per_segment);
                Mutex::new(Segment::new(bits))
            })
            .collect();

        Self {
            segments: segments.into_boxed_slice(),
            bits_per_segment,
            total_bits,
            bits_set: AtomicUsize::new(0),
            next_segment: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn total_bits(&self) -> usize {
        self.total_bits
    }

    #[inline]
    pub fn bits_per_segment(&self) -> usize {
        self.bits_per_segment
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment holding a global index.
    #[inline]
    pub fn segment_of(&self, index: usize) -> usize {
        index / self.bits_per_segment
    }

    /// Next segment in round-robin order, used as an allocation hint.
    pub fn next_segment(&self) -> usize {
        self.next_segment.fetch_add(1, Ordering::Relaxed) % self.segments.len()
    }

    /// Claim the lowest clear bit, starting from the next round-robin segment.
    pub fn allocate_next(&self) -> Option<usize> {
        self.allocate_next_from(self.next_segment())
    }

    /// Claim the lowest clear bit in `segment_hint`, moving on to the
    /// following segments when it is full.
    pub fn allocate_next_from(&self, segment_hint: usize) -> Option<usize> {
        let count = self.segments.len();
        (0..count).find_map(|offset| self.allocate_in_segment((segment_hint + offset) % count))
    }

    /// Claim the lowest clear bit inside one segment only.
    pub fn allocate_in_segment(&self, segment: usize) -> Option<usize> {
        let relative = self.segments[segment].lock().claim_lowest_clear()?;
        self.bits_set.fetch_add(1, Ordering::Relaxed);
        Some(segment * self.bits_per_segment + relative)
    }

    /// Clear a bit. Returns whether it was set.
    pub fn clear(&self, index: usize) -> bool {
        let (segment, relative) = self.split(index);
        let cleared = self.segments[segment].lock().clear(relative);
        if cleared {
            self.bits_set.fetch_sub(1, Ordering::Relaxed);
        }
        cleared
    }

    /// Check a bit.
    pub fn get(&self, index: usize) -> bool {
        let (segment, relative) = self.split(index);
        self.segments[segment].lock().get(relative)
    }

    /// Number of set bits across all segments.
    #[inline]
    pub fn count_set(&self) -> usize {
        self.bits_set.load(Ordering::Relaxed)
    }

    /// Number of set bits in one segment.
    pub fn count_set_in(&self, segment: usize) -> usize {
        self.segments[segment].lock().bits_set
    }

    /// Highest set bit of a segment, relative to the segment start.
    pub fn highest_set_bit(&self, segment: usize) -> Option<usize> {
        self.segments[segment].lock().highest_set
    }

    /// Highest set bit of a segment as the next candidate to pull toward the
    /// front during defragmentation.
    ///
    /// The bit stays set: the block it guards still holds live data until the
    /// caller has copied it and clears it itself. The cached high-water mark
    /// is re-derived from the words so a stale value is never returned.
    pub fn compact_highest_set_bit(&self, segment: usize) -> Option<usize> {
        let mut seg = self.segments[segment].lock();
        let top = seg.bits.checked_sub(1)?;
        seg.highest_set = seg.scan_highest(top);
        seg.highest_set
    }

    #[inline]
    fn split(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.total_bits, "bit index out of range");
        (index / self.bits_per_segment, index % self.bits_per_segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_lowest_in_segment() {
        let bits = ConcurrentBitSet::with_segments(128, 2);
        assert_eq!(bits.allocate_in_segment(0), Some(0));
        assert_eq!(bits.allocate_in_segment(0), Some(1));
        assert_eq!(bits.allocate_in_segment(1), Some(128));
        assert_eq!(bits.count_set(), 3);
        assert_eq!(bits.count_set_in(0), 2);
    }

    #[test]
    fn test_clear_reuses_lowest() {
        let bits = ConcurrentBitSet::with_segments(64, 1);
        for _ in 0..10 {
            bits.allocate_in_segment(0).unwrap();
        }
        assert!(bits.clear(3));
        assert!(!bits.clear(3));
        assert_eq!(bits.allocate_in_segment(0), Some(3));
        assert_eq!(bits.allocate_in_segment(0), Some(10));
    }

    #[test]
    fn test_exhaustion() {
        let bits = ConcurrentBitSet::new(10, 4);
        let claimed: HashSet<usize> = (0..10).map(|_| bits.allocate_next().unwrap()).collect();
        assert_eq!(claimed.len(), 10);
        assert!(claimed.iter().all(|&i| i < 10));
        assert_eq!(bits.allocate_next(), None);
        assert_eq!(bits.count_set(), 10);
    }

    #[test]
    fn test_allocate_moves_to_next_segment() {
        let bits = ConcurrentBitSet::with_segments(2, 3);
        assert_eq!(bits.allocate_next_from(2), Some(4));
        assert_eq!(bits.allocate_next_from(2), Some(5));
        assert_eq!(bits.allocate_next_from(2), Some(0));
    }

    #[test]
    fn test_highest_set_bit_tracking() {
        let bits = ConcurrentBitSet::with_segments(256, 1);
        assert_eq!(bits.highest_set_bit(0), None);
        for _ in 0..100 {
            bits.allocate_in_segment(0);
        }
        assert_eq!(bits.highest_set_bit(0), Some(99));

        bits.clear(99);
        bits.clear(98);
        assert_eq!(bits.highest_set_bit(0), Some(97));

        bits.clear(50);
        assert_eq!(bits.compact_highest_set_bit(0), Some(97));
        // compaction candidate stays set
        assert!(bits.get(97));
    }

    #[test]
    fn test_compact_empty_segment() {
        let bits = ConcurrentBitSet::with_segments(64, 2);
        bits.allocate_in_segment(1);
        assert_eq!(bits.compact_highest_set_bit(0), None);
        assert_eq!(bits.compact_highest_set_bit(1), Some(0));
    }

    #[test]
    fn test_concurrent_allocate_is_unique() {
        let bits = Arc::new(ConcurrentBitSet::new(4000, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bits = Arc::clone(&bits);
                thread::spawn(move || {
                    (0..500)
                        .map(|_| bits.allocate_next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(all.insert(index), "bit {} claimed twice", index);
            }
        }
        assert_eq!(bits.count_set(), 4000);
        assert_eq!(bits.allocate_next(), None);
    }

    proptest! {
        #[test]
        fn prop_counts_match_claims(total in 1usize..600, clears in proptest::collection::vec(any::<usize>(), 0..50)) {
            let bits = ConcurrentBitSet::new(total, 5);
            let mut claimed: Vec<usize> = (0..total).filter_map(|_| bits.allocate_next()).collect();
            prop_assert_eq!(claimed.len(), total);

            let mut cleared = HashSet::new();
            for pick in clears {
                let index = claimed[pick % claimed.len()];
                if bits.clear(index) {
                    cleared.insert(index);
                }
            }
            prop_assert_eq!(bits.count_set(), total - cleared.len());

            let per_segment: usize = (0..bits.segment_count()).map(|s| bits.count_set_in(s)).sum();
            prop_assert_eq!(per_segment, bits.count_set());

            claimed.retain(|i| !cleared.contains(i));
            for segment in 0..bits.segment_count() {
                let expected = claimed
                    .iter()
                    .filter(|&&i| bits.segment_of(i) == segment)
                    .map(|&i| i % bits.bits_per_segment())
                    .max();
                prop_assert_eq!(bits.highest_set_bit(segment), expected);
            }
        }
    }
}
