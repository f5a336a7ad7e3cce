//! Configuration constants and the [`BufferConfig`] surface for spillcache.
//!
//! # Memory Layout
//! The memory buffer uses a 31-bit block address space over 8KB blocks:
//! - Max blocks: 2^31
//! - Max addressable memory: 2^31 × 2^13 = 2^44 bytes (16TB)
//!
//! # Inode Layout (64 bytes)
//! ```text
//! ┌──────────────────────────────┬──────────┬─────────────────┐
//! │ 14 × u32 direct pointers     │ indirect │ doubly indirect │
//! └──────────────────────────────┴──────────┴─────────────────┘
//! ```
//! With 8KB blocks and 4-byte pointers an object can span
//! 14 + 2048 + 2048² ≈ 2^22 blocks, about 32GB.

use std::path::PathBuf;

use crate::common::{Error, Result};

/// Log2 of the memory block size.
pub const LOG_BLOCK_SIZE: u32 = 13;

/// Size of a memory block in bytes (8KB).
///
/// Smaller blocks reduce internal fragmentation, which matters most when
/// the memory buffer is small (< 256MB).
pub const BLOCK_SIZE: usize = 1 << LOG_BLOCK_SIZE;

/// Number of bits in a block address.
pub const ADDRESS_BITS: u32 = 31;

/// Size of a block pointer in bytes.
pub const BYTES_PER_BLOCK_ADDRESS: usize = 4;

/// Number of pointer slots in an inode.
pub const INODE_POINTERS: usize = 16;

/// Size of an inode in bytes.
pub const INODE_BYTES: usize = INODE_POINTERS * BYTES_PER_BLOCK_ADDRESS;

/// Number of direct block pointers in an inode.
pub const DIRECT_POINTERS: usize = 14;

/// Inode slot holding the indirect pointer block.
pub const INDIRECT_SLOT: usize = DIRECT_POINTERS;

/// Inode slot holding the doubly-indirect pointer block.
pub const DOUBLE_INDIRECT_SLOT: usize = DIRECT_POINTERS + 1;

/// Number of block pointers that fit in one pointer block.
pub const ADDRESSES_PER_BLOCK: usize = BLOCK_SIZE / BYTES_PER_BLOCK_ADDRESS;

/// First logical block index served by the doubly-indirect block.
pub const MAX_INDIRECT: usize = DIRECT_POINTERS + ADDRESSES_PER_BLOCK;

/// Logical block ceiling for a single object.
pub const MAX_DOUBLE_INDIRECT: usize = MAX_INDIRECT + ADDRESSES_PER_BLOCK * ADDRESSES_PER_BLOCK;

/// Maximum bytes the memory buffer can address.
pub const MAX_ADDRESSABLE_MEMORY: u64 = 1 << (ADDRESS_BITS + LOG_BLOCK_SIZE);

/// Default memory buffer capacity (64MB).
pub const DEFAULT_MEMORY_BUFFER_SPACE: u64 = 1 << 26;

/// Default maximum serialized object size (8MB).
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 1 << 23;

/// Default free bytes a storage segment must hold before it is defragmented.
pub const DEFAULT_MIN_DEFRAG: u64 = 1 << 26;

/// Default number of files backing the smallest storage bucket.
pub const DEFAULT_STORAGE_SEGMENTS: usize = 32;

/// Default bytes addressable by one storage segment file (1GB).
pub const DEFAULT_MAX_STORAGE_FILE_SIZE: u64 = 1 << 30;

/// Number of segments in the memory bitsets.
pub const CONCURRENCY_LEVEL: usize = 32;

/// Passes over the eviction queue before a forced eviction gives up.
pub const EVICTION_SCANS: usize = 5;

/// How the memory arena backs its blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ArenaAllocation {
    /// Every block is allocated when the arena is built.
    #[default]
    Eager,
    /// A block is allocated the first time it is viewed.
    Lazy,
}

/// Recognized configuration for a [`BufferCache`](crate::BufferCache).
///
/// # Example
/// ```
/// use spillcache::BufferConfig;
///
/// let config = BufferConfig::default()
///     .with_memory_buffer_space(1 << 20)
///     .with_use_disk(false);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Memory buffer capacity in bytes.
    pub memory_buffer_space: u64,
    /// Largest serialized object the cache accepts.
    pub max_storage_object_size: usize,
    /// Eager or lazy block backing.
    pub arena_allocation: ArenaAllocation,
    /// Minimum free bytes in a segment before defrag runs.
    pub min_defrag: u64,
    /// Whether storage buckets are backed by files.
    pub use_disk: bool,
    /// Directory for storage files, a temporary one when `None`.
    pub disk_directory: Option<PathBuf>,
    /// Files backing the smallest bucket.
    pub storage_segments: usize,
    /// Bytes addressable per storage file.
    pub max_storage_file_size: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_buffer_space: DEFAULT_MEMORY_BUFFER_SPACE,
            max_storage_object_size: DEFAULT_MAX_OBJECT_SIZE,
            arena_allocation: ArenaAllocation::Eager,
            min_defrag: DEFAULT_MIN_DEFRAG,
            use_disk: true,
            disk_directory: None,
            storage_segments: DEFAULT_STORAGE_SEGMENTS,
            max_storage_file_size: DEFAULT_MAX_STORAGE_FILE_SIZE,
        }
    }
}

impl BufferConfig {
    /// Set the memory buffer capacity, clamped to the addressable ceiling.
    pub fn with_memory_buffer_space(mut self, bytes: u64) -> Self {
        self.memory_buffer_space = bytes.min(MAX_ADDRESSABLE_MEMORY);
        self
    }

    pub fn with_max_storage_object_size(mut self, bytes: usize) -> Self {
        self.max_storage_object_size = bytes;
        self
    }

    pub fn with_arena_allocation(mut self, allocation: ArenaAllocation) -> Self {
        self.arena_allocation = allocation;
        self
    }

    pub fn with_min_defrag(mut self, bytes: u64) -> Self {
        self.min_defrag = bytes;
        self
    }

    pub fn with_use_disk(mut self, use_disk: bool) -> Self {
        self.use_disk = use_disk;
        self
    }

    pub fn with_disk_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.disk_directory = Some(dir.into());
        self
    }

    pub fn with_storage_segments(mut self, segments: usize) -> Self {
        self.storage_segments = segments;
        self
    }

    pub fn with_max_storage_file_size(mut self, bytes: u64) -> Self {
        self.max_storage_file_size = bytes;
        self
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.memory_buffer_space == 0 {
            return Err(Error::InvalidConfig("memory_buffer_space must be > 0".into()));
        }
        if self.max_storage_object_size == 0 {
            return Err(Error::InvalidConfig("max_storage_object_size must be > 0".into()));
        }
        if self.storage_segments == 0 {
            return Err(Error::InvalidConfig("storage_segments must be > 0".into()));
        }
        if !self.max_storage_file_size.is_power_of_two()
            || self.max_storage_file_size < BLOCK_SIZE as u64
        {
            return Err(Error::InvalidConfig(format!(
                "max_storage_file_size must be a power of two >= {}",
                BLOCK_SIZE
            )));
        }
        Ok(())
    }

    /// Memory buffer space actually used: never below the max object size.
    pub fn effective_memory_buffer_space(&self) -> u64 {
        self.memory_buffer_space
            .min(MAX_ADDRESSABLE_MEMORY)
            .max(self.max_storage_object_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_is_power_of_two() {
        assert!(BLOCK_SIZE.is_power_of_two());
        assert_eq!(BLOCK_SIZE, 8192);
    }

    #[test]
    fn test_inode_geometry() {
        assert_eq!(INODE_BYTES, 64);
        assert_eq!(ADDRESSES_PER_BLOCK, 2048);
        assert_eq!(MAX_INDIRECT, 14 + 2048);
        assert_eq!(MAX_DOUBLE_INDIRECT, 14 + 2048 + 2048 * 2048);
    }

    #[test]
    fn test_max_addressable_memory() {
        // 16TB = 16 * 1024^4 bytes
        assert_eq!(MAX_ADDRESSABLE_MEMORY, 16 * 1024u64 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_memory_space_clamped() {
        let config = BufferConfig::default().with_memory_buffer_space(u64::MAX);
        assert_eq!(config.memory_buffer_space, MAX_ADDRESSABLE_MEMORY);

        let config = BufferConfig::default().with_memory_buffer_space(1024);
        assert_eq!(
            config.effective_memory_buffer_space(),
            DEFAULT_MAX_OBJECT_SIZE as u64
        );
    }

    #[test]
    fn test_validate() {
        assert!(BufferConfig::default().validate().is_ok());
        assert!(BufferConfig::default()
            .with_storage_segments(0)
            .validate()
            .is_err());
        assert!(BufferConfig::default()
            .with_max_storage_file_size(3 * 4096)
            .validate()
            .is_err());
    }
}
