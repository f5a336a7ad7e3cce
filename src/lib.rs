//! spillcache - a spill-to-disk buffer cache for intermediate query results.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          spillcache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │               Buffer Cache (buffer/)                     │   │
//! │  │   groups → LocationRecord → Memory | Disk | Unallocated  │   │
//! │  │   ┌─────────────────────────────────────────────────┐   │   │
//! │  │   │     Eviction ordering: LRFU (default) | LRU      │   │   │
//! │  │   └─────────────────────────────────────────────────┘   │   │
//! │  │      cleaner + defrag on a background worker pool        │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                   ↓ serialize              ↑ deserialize        │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                Memory Tier (memory/)                     │   │
//! │  │   inode arena + 8KB block arena + allocation bitsets     │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                   ↓ demote                 ↑ promote            │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                Storage Tier (storage/)                   │   │
//! │  │   size buckets 8KB, 16KB, ... over segment files         │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (BlockId, ObjectKey, Error, config)
//! - [`buffer`] - The cache, location records, and eviction policies
//! - [`memory`] - Block arenas and inode addressing
//! - [`storage`] - File stores and size-tiered block stores
//!
//! # Quick Start
//! ```
//! use std::io::{self, Read, Write};
//! use spillcache::{BufferCache, BufferConfig, Serializer};
//!
//! struct Text;
//!
//! impl Serializer<String> for Text {
//!     fn group_id(&self) -> u64 {
//!         7
//!     }
//!
//!     fn serialize(&self, value: &String, out: &mut dyn Write) -> io::Result<()> {
//!         out.write_all(&(value.len() as u32).to_le_bytes())?;
//!         out.write_all(value.as_bytes())
//!     }
//!
//!     fn deserialize(&self, input: &mut dyn Read) -> io::Result<String> {
//!         let mut len = [0u8; 4];
//!         input.read_exact(&mut len)?;
//!         let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
//!         input.read_exact(&mut bytes)?;
//!         String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
//!     }
//! }
//!
//! let cache = BufferCache::new(
//!     BufferConfig::default()
//!         .with_memory_buffer_space(1 << 20)
//!         .with_max_storage_object_size(1 << 16)
//!         .with_use_disk(false),
//! )
//! .unwrap();
//!
//! cache.create_cache_group(7);
//! cache.add_to_cache_group(7, 1);
//! cache.add(1, &"hello".to_string(), &Text).unwrap();
//!
//! let guard = cache.lock_for_load(7, 1).unwrap();
//! assert_eq!(cache.get(&guard, &Text).unwrap().as_deref(), Some("hello"));
//! ```

pub mod buffer;
pub mod common;
pub mod memory;
pub mod storage;

// Re-export commonly used items at crate root for convenience
pub use common::config::BLOCK_SIZE;
pub use common::{ArenaAllocation, BlockId, BufferConfig, Error, GroupId, ObjectId, ObjectKey, Result};

pub use buffer::replacer::{LrfuPolicy, LruPolicy, OrderingPolicy};
pub use buffer::{BufferCache, CacheStats, LoadGuard, Location, Serializer, StatsSnapshot};
pub use storage::{FileStorageManager, FileStore, MemoryStorageManager, StorageManager};
