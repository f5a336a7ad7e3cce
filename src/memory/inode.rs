//! Inode-addressed block chains.
//!
//! Every memory-resident object owns one inode: 16 little-endian block
//! pointers. Logical block `i` of the object is found by:
//!
//! ```text
//! i < 14                      inode[i]
//! 14 <= i < MAX_INDIRECT      indirect[i - 14]             (inode[14])
//! MAX_INDIRECT <= i           double[(i - MAX_INDIRECT) / P]
//!                               [(i - MAX_INDIRECT) % P]   (inode[15])
//! ```
//!
//! Pointer slots hold [`BlockId::EMPTY`] when unused, and blocks are
//! allocated strictly in order, so the first empty slot reached on a walk
//! marks the end of the chain.

use tracing::{debug, trace};

use crate::common::config::{
    ADDRESSES_PER_BLOCK, DIRECT_POINTERS, DOUBLE_INDIRECT_SLOT, INDIRECT_SLOT, INODE_POINTERS,
    MAX_DOUBLE_INDIRECT, MAX_INDIRECT,
};
use crate::common::{BlockId, Error, ObjectKey, Result};
use crate::memory::{BlockView, BlockViewMut, MemoryArenas};

/// Where a [`InodeBlockManager`] gets fresh data blocks.
///
/// The cache implements this with eviction behind it; [`MemoryArenas`]
/// implements it as a plain claim that fails when the arena is full.
pub trait BlockSource {
    /// Claim a data block, preferring the given bitset segment.
    fn next_block(&self, segment_hint: usize) -> Result<BlockId>;
}

/// Number of pointer blocks needed to address `blocks` data blocks.
pub fn pointer_blocks_for(blocks: usize) -> usize {
    if blocks <= DIRECT_POINTERS {
        0
    } else if blocks <= MAX_INDIRECT {
        1
    } else {
        2 + (blocks - MAX_INDIRECT).div_ceil(ADDRESSES_PER_BLOCK)
    }
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Inode(BlockId),
    Pointer(BlockId),
}

/// One pointer slot inside the inode or a pointer block.
#[derive(Debug, Clone, Copy)]
struct Slot {
    table: Table,
    index: usize,
}

impl Slot {
    fn next(self) -> Option<Slot> {
        let len = match self.table {
            Table::Inode(_) => INODE_POINTERS,
            Table::Pointer(_) => ADDRESSES_PER_BLOCK,
        };
        (self.index + 1 < len).then_some(Slot {
            table: self.table,
            index: self.index + 1,
        })
    }
}

/// Reads, allocates, and frees the block chain of one object.
///
/// A manager is a short-lived handle: the inode number it carries is the
/// durable part and lives in the object's location record.
pub struct InodeBlockManager<'a> {
    arenas: &'a MemoryArenas,
    source: &'a dyn BlockSource,
    key: ObjectKey,
    inode: BlockId,
    segment: usize,
}

impl<'a> InodeBlockManager<'a> {
    /// Handle for an existing inode, or for a new object when `inode` is
    /// [`BlockId::EMPTY`]. New inodes are allocated on first block allocation.
    pub fn new(
        arenas: &'a MemoryArenas,
        source: &'a dyn BlockSource,
        key: ObjectKey,
        inode: BlockId,
    ) -> Self {
        Self {
            arenas,
            source,
            key,
            inode,
            segment: arenas.next_segment(),
        }
    }

    #[inline]
    pub fn inode(&self) -> BlockId {
        self.inode
    }

    #[inline]
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    #[inline]
    pub fn arenas(&self) -> &'a MemoryArenas {
        self.arenas
    }

    /// Physical block backing logical block `index`.
    pub fn block_id(&self, index: usize) -> Result<BlockId> {
        let block = self
            .walk(self.inode, index, false)?
            .map_or(BlockId::EMPTY, |slot| self.read_slot(slot));
        if !block.is_valid() {
            return Err(Error::Corrupted {
                key: self.key,
                reason: format!("logical block {} is not allocated", index),
            });
        }
        Ok(block)
    }

    /// Shared view of logical block `index`.
    pub fn get_block(&self, index: usize) -> Result<BlockView<'a>> {
        let block = self.block_id(index)?;
        Ok(self.arenas.data().block(block))
    }

    /// Exclusive view of logical block `index`.
    pub fn get_block_mut(&self, index: usize) -> Result<BlockViewMut<'a>> {
        let block = self.block_id(index)?;
        Ok(self.arenas.data().block_mut(block))
    }

    /// Allocate logical block `index`, which must directly follow the last
    /// allocated one, and return its physical id.
    pub fn allocate_block_id(&mut self, index: usize) -> Result<BlockId> {
        let inode = self.ensure_inode()?;
        let slot = self.walk(inode, index, true)?.ok_or_else(|| Error::Corrupted {
            key: self.key,
            reason: format!("logical block {} allocated out of order", index),
        })?;
        let block = self.source.next_block(self.segment)?;
        self.write_slot(slot, block);
        if let Some(next) = slot.next() {
            self.write_slot(next, BlockId::EMPTY);
        }
        trace!(key = %self.key, index, %block, "allocated block");
        Ok(block)
    }

    /// Allocate logical block `index` and return a view of it.
    pub fn allocate_block(&mut self, index: usize) -> Result<BlockViewMut<'a>> {
        let block = self.allocate_block_id(index)?;
        Ok(self.arenas.data().block_mut(block))
    }

    /// Free logical block `index`, which must be the last allocated one,
    /// along with any pointer block it leaves empty.
    pub fn free_block(&mut self, index: usize) -> Result<()> {
        let Some(slot) = self.walk(self.inode, index, false)? else {
            return Ok(());
        };
        let block = self.read_slot(slot);
        if !block.is_valid() {
            return Ok(());
        }
        self.write_slot(slot, BlockId::EMPTY);
        self.arenas.release_block(block);

        let inodes = self.arenas.inodes();
        if index == DIRECT_POINTERS {
            let indirect = inodes.read_pointer(self.inode, INDIRECT_SLOT);
            self.arenas.release_block(indirect);
            inodes.write_pointer(self.inode, INDIRECT_SLOT, BlockId::EMPTY);
        } else if index >= MAX_INDIRECT {
            let relative = index - MAX_INDIRECT;
            if relative % ADDRESSES_PER_BLOCK == 0 {
                let double = inodes.read_pointer(self.inode, DOUBLE_INDIRECT_SLOT);
                let outer = relative / ADDRESSES_PER_BLOCK;
                let indirect = self.arenas.data().read_pointer(double, outer);
                self.arenas.release_block(indirect);
                self.arenas.data().write_pointer(double, outer, BlockId::EMPTY);
                if relative == 0 {
                    self.arenas.release_block(double);
                    inodes.write_pointer(self.inode, DOUBLE_INDIRECT_SLOT, BlockId::EMPTY);
                }
            }
        }
        Ok(())
    }

    /// Release every block of the chain and the inode itself.
    ///
    /// With `reuse_one`, the first data block is kept claimed and returned
    /// so the caller can hand it straight to a pending writer.
    pub fn free(&mut self, reuse_one: bool) -> Option<BlockId> {
        if !self.inode.is_valid() {
            return None;
        }
        let pointers = self.arenas.inodes().read_pointers(self.inode, INODE_POINTERS);
        let first = pointers[0];
        let start = usize::from(reuse_one);
        let direct_full = self.release_run(&pointers[start..DIRECT_POINTERS]);

        debug!(key = %self.key, inode = %self.inode, "freeing inode");
        self.arenas.release_inode(self.inode);
        self.inode = BlockId::EMPTY;

        let reused = (reuse_one && first.is_valid()).then_some(first);
        let indirect = pointers[INDIRECT_SLOT];
        if !direct_full || !indirect.is_valid() || !self.release_pointer_block(indirect) {
            return reused;
        }
        let double = pointers[DOUBLE_INDIRECT_SLOT];
        if !double.is_valid() {
            return reused;
        }
        for indirect in self.arenas.data().read_pointers(double, ADDRESSES_PER_BLOCK) {
            if !indirect.is_valid() {
                break;
            }
            self.release_pointer_block(indirect);
        }
        self.arenas.release_block(double);
        reused
    }

    /// Release the blocks of `pointers` up to the first empty slot.
    /// Returns whether every slot was in use.
    fn release_run(&self, pointers: &[BlockId]) -> bool {
        for &block in pointers {
            if !block.is_valid() {
                return false;
            }
            self.arenas.release_block(block);
        }
        true
    }

    fn release_pointer_block(&self, block: BlockId) -> bool {
        let full = self.release_run(&self.arenas.data().read_pointers(block, ADDRESSES_PER_BLOCK));
        self.arenas.release_block(block);
        full
    }

    /// Find the slot for logical block `index` under `inode`. Pointer blocks
    /// on the way are created when `allocate` is set and `index` is the
    /// first block they cover.
    fn walk(&self, inode: BlockId, index: usize, allocate: bool) -> Result<Option<Slot>> {
        if index >= MAX_DOUBLE_INDIRECT {
            return Err(Error::MaxBlocksExceeded {
                blocks: index + 1,
                limit: MAX_DOUBLE_INDIRECT,
            });
        }
        if !inode.is_valid() {
            return Ok(None);
        }

        let root = Table::Inode(inode);
        if index < DIRECT_POINTERS {
            return Ok(Some(Slot { table: root, index }));
        }
        if index < MAX_INDIRECT {
            let slot = Slot {
                table: root,
                index: INDIRECT_SLOT,
            };
            let Some(indirect) = self.descend(slot, allocate && index == DIRECT_POINTERS)? else {
                return Ok(None);
            };
            return Ok(Some(Slot {
                table: Table::Pointer(indirect),
                index: index - DIRECT_POINTERS,
            }));
        }

        let relative = index - MAX_INDIRECT;
        let (outer, inner) = (relative / ADDRESSES_PER_BLOCK, relative % ADDRESSES_PER_BLOCK);
        let slot = Slot {
            table: root,
            index: DOUBLE_INDIRECT_SLOT,
        };
        let Some(double) = self.descend(slot, allocate && relative == 0)? else {
            return Ok(None);
        };
        let slot = Slot {
            table: Table::Pointer(double),
            index: outer,
        };
        let Some(indirect) = self.descend(slot, allocate && inner == 0)? else {
            return Ok(None);
        };
        Ok(Some(Slot {
            table: Table::Pointer(indirect),
            index: inner,
        }))
    }

    /// Follow the pointer in `slot`, first installing a fresh pointer block
    /// there when `create` is set.
    fn descend(&self, slot: Slot, create: bool) -> Result<Option<BlockId>> {
        if !create {
            let block = self.read_slot(slot);
            return Ok(block.is_valid().then_some(block));
        }
        let block = self.source.next_block(self.segment)?;
        self.arenas.data().write_pointer(block, 0, BlockId::EMPTY);
        self.write_slot(slot, block);
        if let Some(next) = slot.next() {
            self.write_slot(next, BlockId::EMPTY);
        }
        trace!(key = %self.key, %block, "allocated pointer block");
        Ok(Some(block))
    }

    fn ensure_inode(&mut self) -> Result<BlockId> {
        if self.inode.is_valid() {
            return Ok(self.inode);
        }
        let inode = self.arenas.claim_inode().ok_or(Error::OutOfInodes)?;
        self.arenas.inodes().fill_pointers(inode, BlockId::EMPTY);
        debug!(key = %self.key, %inode, "allocating inode");
        self.inode = inode;
        Ok(inode)
    }

    fn read_slot(&self, slot: Slot) -> BlockId {
        match slot.table {
            Table::Inode(id) => self.arenas.inodes().read_pointer(id, slot.index),
            Table::Pointer(id) => self.arenas.data().read_pointer(id, slot.index),
        }
    }

    fn write_slot(&self, slot: Slot, value: BlockId) {
        match slot.table {
            Table::Inode(id) => self.arenas.inodes().write_pointer(id, slot.index, value),
            Table::Pointer(id) => self.arenas.data().write_pointer(id, slot.index, value),
        }
    }
}
