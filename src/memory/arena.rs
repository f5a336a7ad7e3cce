//! Fixed-capacity block arena.
//!
//! A [`BlockArena`] is a byte buffer sliced into equal power-of-two blocks.
//! Callers address blocks by [`BlockId`] and get a short-lived view:
//! - [`BlockView`] - shared read access
//! - [`BlockViewMut`] - exclusive write access
//!
//! A view lives for one read or write session. Holding one across an
//! allocation cycle is a bug: the block may be handed to another object once
//! its owner frees it.

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::common::config::BYTES_PER_BLOCK_ADDRESS;
use crate::common::{ArenaAllocation, BlockId};

/// Shared view of one block.
pub type BlockView<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// Exclusive view of one block.
pub type BlockViewMut<'a> = MappedRwLockWriteGuard<'a, [u8]>;

/// A fixed number of fixed-size blocks.
///
/// # Thread Safety
/// Each block sits behind its own `RwLock`, so views of different blocks
/// never contend. The arena itself is never resized.
pub struct BlockArena {
    blocks: Box<[RwLock<Box<[u8]>>]>,
    block_size: usize,
}

impl BlockArena {
    /// Create an arena of `block_count` blocks of `block_size` bytes.
    ///
    /// # Panics
    /// Panics if `block_size` is not a power of two.
    pub fn new(block_count: usize, block_size: usize, allocation: ArenaAllocation) -> Self {
        assert!(block_size.is_power_of_two(), "block_size must be a power of two");

        let blocks: Vec<RwLock<Box<[u8]>>> = (0..block_count)
            .map(|_| {
                let data = match allocation {
                    ArenaAllocation::Eager => vec![0u8; block_size].into_boxed_slice(),
                    ArenaAllocation::Lazy => Box::default(),
                };
                RwLock::new(data)
            })
            .collect();

        Self {
            blocks: blocks.into_boxed_slice(),
            block_size,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes the arena can hold.
    #[inline]
    pub fn capacity_bytes(&self) -> u64 {
        self.blocks.len() as u64 * self.block_size as u64
    }

    /// Shared view of a block.
    pub fn block(&self, id: BlockId) -> BlockView<'_> {
        let lock = &self.blocks[id.index()];
        let guard = lock.read();
        if !guard.is_empty() {
            return RwLockReadGuard::map(guard, |data| &data[..]);
        }
        drop(guard);
        RwLockReadGuard::map(RwLockWriteGuard::downgrade(self.backed(lock)), |data| &data[..])
    }

    /// Exclusive view of a block.
    pub fn block_mut(&self, id: BlockId) -> BlockViewMut<'_> {
        let lock = &self.blocks[id.index()];
        RwLockWriteGuard::map(self.backed(lock), |data| &mut data[..])
    }

    /// Read one pointer slot of a block holding block addresses.
    pub fn read_pointer(&self, id: BlockId, slot: usize) -> BlockId {
        let view = self.block(id);
        let at = slot * BYTES_PER_BLOCK_ADDRESS;
        BlockId::from_le_bytes([view[at], view[at + 1], view[at + 2], view[at + 3]])
    }

    /// Write one pointer slot of a block holding block addresses.
    pub fn write_pointer(&self, id: BlockId, slot: usize, value: BlockId) {
        let mut view = self.block_mut(id);
        let at = slot * BYTES_PER_BLOCK_ADDRESS;
        view[at..at + BYTES_PER_BLOCK_ADDRESS].copy_from_slice(&value.to_le_bytes());
    }

    /// Read the first `count` pointer slots of a block.
    pub fn read_pointers(&self, id: BlockId, count: usize) -> Vec<BlockId> {
        let view = self.block(id);
        view.chunks_exact(BYTES_PER_BLOCK_ADDRESS)
            .take(count)
            .map(|b| BlockId::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    /// Fill every pointer slot of a block with `value`.
    pub fn fill_pointers(&self, id: BlockId, value: BlockId) {
        let bytes = value.to_le_bytes();
        let mut view = self.block_mut(id);
        for chunk in view.chunks_exact_mut(BYTES_PER_BLOCK_ADDRESS) {
            chunk.copy_from_slice(&bytes);
        }
    }

    /// Write lock on a block, backing it with memory on first use.
    fn backed<'a>(&self, lock: &'a RwLock<Box<[u8]>>) -> RwLockWriteGuard<'a, Box<[u8]>> {
        let mut guard = lock.write();
        if guard.is_empty() {
            *guard = vec![0u8; self.block_size].into_boxed_slice();
        }
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_view_is_block_sized() {
        let arena = BlockArena::new(4, 64, ArenaAllocation::Eager);
        assert_eq!(arena.block(BlockId::new(0)).len(), 64);
        assert_eq!(arena.block_mut(BlockId::new(3)).len(), 64);
        assert_eq!(arena.capacity_bytes(), 256);
    }

    #[test]
    fn test_lazy_blocks_backed_on_use() {
        let arena = BlockArena::new(2, 128, ArenaAllocation::Lazy);
        assert_eq!(arena.block(BlockId::new(1)).len(), 128);

        arena.block_mut(BlockId::new(0))[5] = 0xAB;
        assert_eq!(arena.block(BlockId::new(0))[5], 0xAB);
    }

    #[test]
    fn test_blocks_are_independent() {
        let arena = BlockArena::new(2, 64, ArenaAllocation::Eager);
        arena.block_mut(BlockId::new(0)).fill(0x11);
        arena.block_mut(BlockId::new(1)).fill(0x22);

        assert!(arena.block(BlockId::new(0)).iter().all(|&b| b == 0x11));
        assert!(arena.block(BlockId::new(1)).iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_pointer_slots() {
        let arena = BlockArena::new(1, 64, ArenaAllocation::Eager);
        let id = BlockId::new(0);
        arena.fill_pointers(id, BlockId::EMPTY);
        arena.write_pointer(id, 2, BlockId::new(77));

        assert_eq!(arena.read_pointer(id, 2), BlockId::new(77));
        let pointers = arena.read_pointers(id, 16);
        assert_eq!(pointers.len(), 16);
        assert_eq!(pointers[0], BlockId::EMPTY);
        assert_eq!(pointers[2], BlockId::new(77));
    }

    #[test]
    fn test_concurrent_views() {
        let arena = Arc::new(BlockArena::new(8, 256, ArenaAllocation::Lazy));
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    arena.block_mut(BlockId::new(i)).fill(i as u8);
                    assert!(arena.block(BlockId::new(i)).iter().all(|&b| b == i as u8));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
