//! Per-object location records.
//!
//! A [`LocationRecord`] is the single source of truth for where an object
//! lives and who is working on it. Its state sits behind a mutex paired with
//! a condition variable; every change that could unblock a waiter notifies.
//!
//! # State Machine
//! ```text
//! location:  Unallocated ──▶ Memory ◀──▶ Disk
//!                 ▲            │          │
//!                 └────────────┴──────────┘   (removal)
//!
//! activity:  Adding ◀──▶ Idle ◀──▶ Evicting
//! ```
//! `pinned` is held by a get for its whole read; `loading` by the holder of
//! a [`LoadGuard`](crate::LoadGuard).

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::replacer::AccessStats;
use crate::common::config::BLOCK_SIZE;
use crate::common::{BlockId, Error, ObjectKey, Result};

/// Where an object's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Reserved but not stored, or removed.
    Unallocated,
    /// In the memory arena under `inode`.
    Memory { inode: BlockId },
    /// In a storage bucket at `block`.
    Disk { block: BlockId },
}

impl Location {
    #[inline]
    pub fn is_memory(&self) -> bool {
        matches!(self, Location::Memory { .. })
    }

    #[inline]
    pub fn inode(&self) -> Option<BlockId> {
        match self {
            Location::Memory { inode } => Some(*inode),
            _ => None,
        }
    }

    #[inline]
    pub fn disk_block(&self) -> Option<BlockId> {
        match self {
            Location::Disk { block } => Some(*block),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Location::Unallocated => "unallocated",
            Location::Memory { .. } => "memory",
            Location::Disk { .. } => "disk",
        }
    }
}

/// The in-flight operation on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Adding,
    Evicting,
}

impl Activity {
    fn name(&self) -> &'static str {
        match self {
            Activity::Idle => "idle",
            Activity::Adding => "adding",
            Activity::Evicting => "evicting",
        }
    }
}

/// Blocks needed for `size` bytes.
#[inline]
pub fn blocks_for(size: u64) -> usize {
    size.div_ceil(BLOCK_SIZE as u64) as usize
}

/// Storage bucket for an object of `blocks` memory blocks: the smallest
/// power of two holding it.
#[inline]
pub fn size_index_for(blocks: usize) -> usize {
    blocks.max(1).next_power_of_two().trailing_zeros() as usize
}

/// Mutable part of a [`LocationRecord`].
#[derive(Debug)]
pub struct RecordState {
    location: Location,
    activity: Activity,
    pinned: bool,
    loading: bool,
    size: u64,
    memory_block_count: usize,
    size_index: usize,
    checksum: u32,
    pub(crate) stats: AccessStats,
}

impl RecordState {
    #[inline]
    pub fn location(&self) -> Location {
        self.location
    }

    #[inline]
    pub fn activity(&self) -> Activity {
        self.activity
    }

    #[inline]
    pub fn pinned(&self) -> bool {
        self.pinned
    }

    #[inline]
    pub fn loading(&self) -> bool {
        self.loading
    }

    /// Serialized size in bytes, 0 before the first store.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn memory_block_count(&self) -> usize {
        self.memory_block_count
    }

    #[inline]
    pub fn size_index(&self) -> usize {
        self.size_index
    }

    /// CRC32 of the serialized bytes.
    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    #[inline]
    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    pub fn set_activity(&mut self, key: ObjectKey, to: Activity) -> Result<()> {
        use Activity::*;
        let legal = matches!(
            (self.activity, to),
            (Idle, Adding) | (Adding, Idle) | (Idle, Evicting) | (Evicting, Idle)
        );
        if !legal {
            return Err(Error::IllegalTransition {
                key,
                from: self.activity.name(),
                to: to.name(),
            });
        }
        self.activity = to;
        Ok(())
    }

    /// Move the object. Disk to disk is a defrag relocation.
    pub fn set_location(&mut self, key: ObjectKey, to: Location) -> Result<()> {
        use Location::*;
        let legal = matches!(
            (self.location, to),
            (Unallocated, Memory { .. })
                | (Memory { .. }, Disk { .. })
                | (Disk { .. }, Memory { .. })
                | (Disk { .. }, Disk { .. })
                | (_, Unallocated)
        );
        if !legal {
            return Err(Error::IllegalTransition {
                key,
                from: self.location.name(),
                to: to.name(),
            });
        }
        self.location = to;
        Ok(())
    }

    /// Record the serialized size. The block count is fixed by the first
    /// store; a later store needing a different count is rejected.
    pub fn set_size(&mut self, key: ObjectKey, size: u64) -> Result<()> {
        let blocks = blocks_for(size);
        if self.memory_block_count != 0 && self.memory_block_count != blocks {
            return Err(Error::SizeChanged {
                key,
                expected_blocks: self.memory_block_count,
                actual_blocks: blocks,
            });
        }
        self.size = size;
        self.memory_block_count = blocks;
        self.size_index = size_index_for(blocks);
        Ok(())
    }

    pub(crate) fn set_checksum(&mut self, checksum: u32) {
        self.checksum = checksum;
    }

    /// Pin for a get. Only the load lock holder may pin, and only once.
    pub fn pin(&mut self, key: ObjectKey) -> Result<()> {
        if self.pinned || !self.loading {
            return Err(Error::IllegalTransition {
                key,
                from: if self.pinned { "pinned" } else { "unlocked" },
                to: "pinned",
            });
        }
        self.pinned = true;
        Ok(())
    }

    pub fn unpin(&mut self) {
        self.pinned = false;
    }
}

/// Location and coordination state of one cached object.
///
/// # Thread Safety
/// - `state`: `Mutex`, every read or change of the state takes it
/// - `changed`: `Condvar`, waiters re-check their condition after each
///   notification
#[derive(Debug)]
pub struct LocationRecord {
    key: ObjectKey,
    state: Mutex<RecordState>,
    changed: Condvar,
}

impl LocationRecord {
    pub fn new(key: ObjectKey, stats: AccessStats) -> Self {
        Self {
            key,
            state: Mutex::new(RecordState {
                location: Location::Unallocated,
                activity: Activity::Idle,
                pinned: false,
                loading: false,
                size: 0,
                memory_block_count: 0,
                size_index: 0,
                checksum: 0,
                stats,
            }),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    pub fn notify_all(&self) {
        self.changed.notify_all();
    }

    /// Wait until no get holds the object.
    pub fn wait_unpinned(&self, state: &mut MutexGuard<'_, RecordState>) {
        while state.pinned {
            self.changed.wait(state);
        }
    }

    /// Wait until the object is unpinned and no add or eviction is running.
    pub fn wait_idle(&self, state: &mut MutexGuard<'_, RecordState>) {
        while state.pinned || state.activity != Activity::Idle {
            self.changed.wait(state);
        }
    }

    /// Take the exclusive load lock, waiting for the current holder.
    pub fn lock_for_load(&self) {
        let mut state = self.state.lock();
        while state.loading {
            self.changed.wait(&mut state);
        }
        state.loading = true;
    }

    pub fn unlock_for_load(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.loading, "load lock released twice");
        state.loading = false;
        drop(state);
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn record() -> LocationRecord {
        LocationRecord::new(ObjectKey::new(1, 2), AccessStats::new(0))
    }

    #[test]
    fn test_size_sets_block_count_and_bucket() {
        let record = record();
        let mut state = record.lock();
        state.set_size(record.key(), 100).unwrap();
        assert_eq!(state.memory_block_count(), 1);
        assert_eq!(state.size_index(), 0);

        state.set_size(record.key(), 8000).unwrap();
        assert_eq!(state.size(), 8000);

        let err = state.set_size(record.key(), 3 * BLOCK_SIZE as u64).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeChanged {
                expected_blocks: 1,
                actual_blocks: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_size_index_for() {
        assert_eq!(size_index_for(1), 0);
        assert_eq!(size_index_for(2), 1);
        assert_eq!(size_index_for(3), 2);
        assert_eq!(size_index_for(4), 2);
        assert_eq!(size_index_for(5), 3);
        assert_eq!(size_index_for(1024), 10);
    }

    #[test]
    fn test_location_transitions() {
        let record = record();
        let key = record.key();
        let mut state = record.lock();
        let memory = Location::Memory {
            inode: BlockId::new(1),
        };
        let disk = Location::Disk {
            block: BlockId::new(2),
        };

        assert!(state.set_location(key, disk).is_err());
        state.set_location(key, memory).unwrap();
        assert!(state.set_location(key, memory).is_err());
        state.set_location(key, disk).unwrap();
        state.set_location(key, Location::Disk { block: BlockId::new(0) }).unwrap();
        state.set_location(key, memory).unwrap();
        state.set_location(key, Location::Unallocated).unwrap();
    }

    #[test]
    fn test_activity_transitions() {
        let record = record();
        let key = record.key();
        let mut state = record.lock();
        state.set_activity(key, Activity::Adding).unwrap();
        let err = state.set_activity(key, Activity::Evicting).unwrap_err();
        assert!(err.is_fatal());
        state.set_activity(key, Activity::Idle).unwrap();
        state.set_activity(key, Activity::Evicting).unwrap();
        assert!(state.set_activity(key, Activity::Adding).is_err());
    }

    #[test]
    fn test_pin_requires_load_lock() {
        let record = record();
        let key = record.key();
        assert!(record.lock().pin(key).is_err());

        record.lock_for_load();
        let mut state = record.lock();
        state.pin(key).unwrap();
        assert!(state.pin(key).is_err());
        state.unpin();
        drop(state);
        record.unlock_for_load();
    }

    #[test]
    fn test_load_lock_is_exclusive() {
        let record = Arc::new(record());
        record.lock_for_load();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let record = Arc::clone(&record);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                record.lock_for_load();
                acquired.store(true, Ordering::SeqCst);
                record.unlock_for_load();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        record.unlock_for_load();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_idle_wakes_on_change() {
        let record = Arc::new(record());
        let key = record.key();
        record.lock().set_activity(key, Activity::Adding).unwrap();

        let waiter = {
            let record = Arc::clone(&record);
            thread::spawn(move || {
                let mut state = record.lock();
                record.wait_idle(&mut state);
                state.activity()
            })
        };

        thread::sleep(Duration::from_millis(20));
        record.lock().set_activity(key, Activity::Idle).unwrap();
        record.notify_all();
        assert_eq!(waiter.join().unwrap(), Activity::Idle);
    }
}
