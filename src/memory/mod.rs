//! The memory tier: block arenas, their allocation bitsets, and the inode
//! addressing that strings blocks together into objects.
//!
//! # Structure
//! ```text
//!                 ┌──────────────────────────┐
//!                 │      MemoryArenas        │
//!                 ├────────────┬─────────────┤
//!   inodes_in_use │ inode arena│ data arena  │ blocks_in_use
//!   (bitset)      │  64B slots │  8KB blocks │ (bitset)
//!                 └────────────┴─────────────┘
//!                        ▲
//!                        │ walks/updates pointers
//!                 InodeBlockManager (one per object)
//! ```

mod arena;
mod bitset;
mod block_stream;
mod inode;

pub use arena::{BlockArena, BlockView, BlockViewMut};
pub use bitset::ConcurrentBitSet;
pub use block_stream::{BlockReader, BlockWriter};
pub(crate) use block_stream::stream_error;
pub use inode::{pointer_blocks_for, BlockSource, InodeBlockManager};

use tracing::trace;

use crate::common::config::{BLOCK_SIZE, CONCURRENCY_LEVEL, INODE_BYTES};
use crate::common::{ArenaAllocation, BlockId, Error, Result};

/// The data and inode arenas together with the bitsets tracking their use.
///
/// Inodes outnumber data blocks by one, so the inode arena can only run dry
/// through an allocator bug.
pub struct MemoryArenas {
    data: BlockArena,
    inodes: BlockArena,
    blocks_in_use: ConcurrentBitSet,
    inodes_in_use: ConcurrentBitSet,
}

impl MemoryArenas {
    /// Create arenas for `blocks` data blocks and `blocks + 1` inodes.
    pub fn new(blocks: usize, allocation: ArenaAllocation) -> Self {
        let inodes = blocks + 1;
        Self {
            data: BlockArena::new(blocks, BLOCK_SIZE, allocation),
            inodes: BlockArena::new(inodes, INODE_BYTES, allocation),
            blocks_in_use: ConcurrentBitSet::new(blocks, CONCURRENCY_LEVEL),
            inodes_in_use: ConcurrentBitSet::new(inodes, CONCURRENCY_LEVEL),
        }
    }

    #[inline]
    pub fn data(&self) -> &BlockArena {
        &self.data
    }

    #[inline]
    pub fn inodes(&self) -> &BlockArena {
        &self.inodes
    }

    /// Number of data blocks.
    #[inline]
    pub fn blocks(&self) -> usize {
        self.data.block_count()
    }

    #[inline]
    pub fn data_blocks_in_use(&self) -> usize {
        self.blocks_in_use.count_set()
    }

    #[inline]
    pub fn inodes_in_use(&self) -> usize {
        self.inodes_in_use.count_set()
    }

    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.blocks().saturating_sub(self.data_blocks_in_use())
    }

    /// Round-robin segment for a new writer.
    pub fn next_segment(&self) -> usize {
        self.blocks_in_use.next_segment()
    }

    /// Claim a free data block, preferring `segment_hint`.
    pub fn try_claim_block(&self, segment_hint: usize) -> Option<BlockId> {
        self.blocks_in_use
            .allocate_next_from(segment_hint % self.blocks_in_use.segment_count())
            .map(BlockId::from_index)
    }

    /// Claim any free data block.
    pub fn try_claim_any_block(&self) -> Option<BlockId> {
        self.blocks_in_use.allocate_next().map(BlockId::from_index)
    }

    pub fn release_block(&self, block: BlockId) {
        trace!(%block, "releasing memory block");
        self.blocks_in_use.clear(block.index());
    }

    pub fn claim_inode(&self) -> Option<BlockId> {
        self.inodes_in_use.allocate_next().map(BlockId::from_index)
    }

    pub fn release_inode(&self, inode: BlockId) {
        self.inodes_in_use.clear(inode.index());
    }
}

/// Plain allocation with no eviction: a full arena is an error.
impl BlockSource for MemoryArenas {
    fn next_block(&self, segment_hint: usize) -> Result<BlockId> {
        self.try_claim_block(segment_hint).ok_or(Error::OutOfBlocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_sizes() {
        let arenas = MemoryArenas::new(10, ArenaAllocation::Lazy);
        assert_eq!(arenas.blocks(), 10);
        assert_eq!(arenas.inodes().block_count(), 11);
        assert_eq!(arenas.data().block_size(), BLOCK_SIZE);
        assert_eq!(arenas.inodes().block_size(), INODE_BYTES);
    }

    #[test]
    fn test_claim_and_release() {
        let arenas = MemoryArenas::new(3, ArenaAllocation::Lazy);
        let blocks: Vec<_> = (0..3).map(|i| arenas.next_block(i).unwrap()).collect();
        assert_eq!(arenas.data_blocks_in_use(), 3);
        assert_eq!(arenas.free_blocks(), 0);
        assert!(matches!(arenas.next_block(0), Err(Error::OutOfBlocks)));

        arenas.release_block(blocks[1]);
        assert_eq!(arenas.try_claim_any_block(), Some(blocks[1]));
    }
}
