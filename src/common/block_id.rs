//! Block address type.

use std::fmt;

use crate::common::config::ADDRESS_BITS;

/// Address of a fixed-size block in an arena or storage bucket.
///
/// Using `u32` with a 31-bit address space:
/// - 2^31 blocks × 8KB = 16TB of addressable memory
/// - `u32::MAX` is free to act as the empty sentinel
///
/// Block ids are stored verbatim (little-endian) in inode and pointer blocks.
///
/// # Example
/// ```
/// use spillcache::BlockId;
///
/// let block = BlockId::new(42);
/// assert!(block.is_valid());
/// assert!(!BlockId::EMPTY.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Empty/unallocated sentinel.
    pub const EMPTY: BlockId = BlockId(u32::MAX);

    /// Largest valid block address.
    pub const MAX: u32 = (1 << ADDRESS_BITS) - 1;

    /// Create a new BlockId.
    #[inline]
    pub fn new(id: u32) -> Self {
        BlockId(id)
    }

    /// Create a BlockId from a bitset index.
    #[inline]
    pub fn from_index(index: usize) -> Self {
        debug_assert!(index <= Self::MAX as usize, "block index out of range");
        BlockId(index as u32)
    }

    /// Check if this id addresses a block (is not the sentinel).
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::EMPTY
    }

    /// The id as a bitset/arena index.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Decode a pointer slot.
    #[inline]
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        BlockId(u32::from_le_bytes(bytes))
    }

    /// Encode into a pointer slot.
    #[inline]
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EMPTY {
            write!(f, "Block(EMPTY)")
        } else {
            write!(f, "Block({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_new() {
        let block = BlockId::new(42);
        assert_eq!(block.0, 42);
        assert_eq!(block.index(), 42);
        assert!(block.is_valid());
    }

    #[test]
    fn test_block_id_empty() {
        assert!(!BlockId::EMPTY.is_valid());
        assert!(BlockId::EMPTY.0 > BlockId::MAX);
    }

    #[test]
    fn test_block_id_bytes() {
        let block = BlockId::new(0x0102_0304);
        assert_eq!(BlockId::from_le_bytes(block.to_le_bytes()), block);
        assert_eq!(BlockId::from_le_bytes([0xFF; 4]), BlockId::EMPTY);
    }

    #[test]
    fn test_block_id_display() {
        assert_eq!(format!("{}", BlockId::new(7)), "Block(7)");
        assert_eq!(format!("{}", BlockId::EMPTY), "Block(EMPTY)");
    }
}
