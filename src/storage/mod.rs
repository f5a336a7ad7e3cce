//! Storage layer - the disk tier behind the memory buffer.
//!
//! This module handles spilled objects:
//! - [`FileStore`] / [`StorageManager`] - byte stores and their factories
//! - [`BlockStore`] - one size bucket of fixed-size storage blocks
//! - [`ObjectHeader`] - identity prefix of every stored object

mod block_store;
mod file_store;
mod object_header;

pub use block_store::{BlockRangeReader, BlockRelocator, BlockStore, DefragOutcome};
pub use file_store::{
    FileStorageManager, FileStore, FileStoreReader, MemoryStorageManager, StorageManager,
};
pub use object_header::ObjectHeader;
