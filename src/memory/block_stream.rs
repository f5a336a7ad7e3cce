//! Byte streams over an inode block chain.
//!
//! [`BlockWriter`] and [`BlockReader`] adapt an [`InodeBlockManager`] to
//! `std::io::Write` and `std::io::Read`, so serializers and storage copies
//! can stream through memory blocks without knowing the chain layout.

use std::io::{self, Read, Write};

use crc32fast::Hasher;

use crate::common::config::BLOCK_SIZE;
use crate::common::{BlockId, Error, ObjectKey};
use crate::memory::InodeBlockManager;

/// Turn an I/O error raised while streaming through blocks back into the
/// cache error it wraps, or a serialization error when it came from the
/// caller's own code.
pub(crate) fn stream_error(err: io::Error, key: ObjectKey) -> Error {
    if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(cache_error) = inner.downcast::<Error>() {
                return *cache_error;
            }
        }
        return Error::Corrupted {
            key,
            reason: "lost wrapped stream error".into(),
        };
    }
    Error::Serialization { key, source: err }
}

/// Appends bytes to an object's block chain.
///
/// Blocks are allocated as the writer crosses into them, up to
/// `max_blocks`. A preallocated writer only fills blocks that already exist.
pub struct BlockWriter<'m, 'a> {
    manager: &'m mut InodeBlockManager<'a>,
    max_blocks: usize,
    preallocated: bool,
    current: Option<(usize, BlockId)>,
    bytes_written: u64,
    hasher: Hasher,
}

impl<'m, 'a> BlockWriter<'m, 'a> {
    /// Writer that allocates blocks on demand.
    pub fn new(manager: &'m mut InodeBlockManager<'a>, max_blocks: usize) -> Self {
        Self::build(manager, max_blocks, false)
    }

    /// Writer over `blocks` blocks the caller already allocated.
    pub fn preallocated(manager: &'m mut InodeBlockManager<'a>, blocks: usize) -> Self {
        Self::build(manager, blocks, true)
    }

    fn build(manager: &'m mut InodeBlockManager<'a>, max_blocks: usize, preallocated: bool) -> Self {
        Self {
            manager,
            max_blocks,
            preallocated,
            current: None,
            bytes_written: 0,
            hasher: Hasher::new(),
        }
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes written and their CRC32.
    pub fn finish(self) -> (u64, u32) {
        (self.bytes_written, self.hasher.finalize())
    }

    fn block_for(&mut self, index: usize) -> io::Result<BlockId> {
        if let Some((current, block)) = self.current {
            if current == index {
                return Ok(block);
            }
        }
        if index >= self.max_blocks {
            return Err(io::Error::other(Error::MaxBlocksExceeded {
                blocks: index + 1,
                limit: self.max_blocks,
            }));
        }
        let block = if self.preallocated {
            self.manager.block_id(index)
        } else {
            self.manager.allocate_block_id(index)
        }
        .map_err(io::Error::other)?;
        self.current = Some((index, block));
        Ok(block)
    }
}

impl Write for BlockWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let index = (self.bytes_written / BLOCK_SIZE as u64) as usize;
        let offset = (self.bytes_written % BLOCK_SIZE as u64) as usize;
        let block = self.block_for(index)?;

        let len = buf.len().min(BLOCK_SIZE - offset);
        let mut view = self.manager.arenas().data().block_mut(block);
        view[offset..offset + len].copy_from_slice(&buf[..len]);
        drop(view);

        self.hasher.update(&buf[..len]);
        self.bytes_written += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads the first `len` bytes of an object's block chain.
pub struct BlockReader<'m, 'a> {
    manager: &'m InodeBlockManager<'a>,
    len: u64,
    position: u64,
    current: Option<(usize, BlockId)>,
}

impl<'m, 'a> BlockReader<'m, 'a> {
    pub fn new(manager: &'m InodeBlockManager<'a>, len: u64) -> Self {
        Self {
            manager,
            len,
            position: 0,
            current: None,
        }
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.len - self.position
    }
}

impl Read for BlockReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len {
            return Ok(0);
        }
        let index = (self.position / BLOCK_SIZE as u64) as usize;
        let offset = (self.position % BLOCK_SIZE as u64) as usize;
        let block = match self.current {
            Some((current, block)) if current == index => block,
            _ => {
                let block = self.manager.block_id(index).map_err(io::Error::other)?;
                self.current = Some((index, block));
                block
            }
        };

        let len = buf
            .len()
            .min(BLOCK_SIZE - offset)
            .min(self.remaining() as usize);
        let view = self.manager.arenas().data().block(block);
        buf[..len].copy_from_slice(&view[offset..offset + len]);
        self.position += len as u64;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ArenaAllocation;
    use crate::memory::MemoryArenas;

    fn key() -> ObjectKey {
        ObjectKey::new(3, 4)
    }

    #[test]
    fn test_write_then_read_across_blocks() {
        let arenas = MemoryArenas::new(8, ArenaAllocation::Lazy);
        let mut manager = InodeBlockManager::new(&arenas, &arenas, key(), BlockId::EMPTY);
        let data: Vec<u8> = (0..BLOCK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();

        let mut writer = BlockWriter::new(&mut manager, 3);
        writer.write_all(&data).unwrap();
        let (written, checksum) = writer.finish();
        assert_eq!(written, data.len() as u64);
        assert_eq!(checksum, crc32fast::hash(&data));
        assert_eq!(arenas.data_blocks_in_use(), 3);

        let mut out = Vec::new();
        BlockReader::new(&manager, written).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_writer_respects_max_blocks() {
        let arenas = MemoryArenas::new(8, ArenaAllocation::Lazy);
        let mut manager = InodeBlockManager::new(&arenas, &arenas, key(), BlockId::EMPTY);

        let mut writer = BlockWriter::new(&mut manager, 1);
        let err = writer.write_all(&vec![1u8; BLOCK_SIZE + 1]).unwrap_err();
        assert!(matches!(
            stream_error(err, key()),
            Error::MaxBlocksExceeded { blocks: 2, limit: 1 }
        ));
    }

    #[test]
    fn test_preallocated_writer_fills_existing_blocks() {
        let arenas = MemoryArenas::new(4, ArenaAllocation::Lazy);
        let mut manager = InodeBlockManager::new(&arenas, &arenas, key(), BlockId::EMPTY);
        manager.allocate_block_id(0).unwrap();
        manager.allocate_block_id(1).unwrap();

        let mut writer = BlockWriter::preallocated(&mut manager, 2);
        writer.write_all(&vec![7u8; BLOCK_SIZE + 10]).unwrap();
        assert!(writer.write_all(&vec![7u8; BLOCK_SIZE]).is_err());
        assert_eq!(arenas.data_blocks_in_use(), 2);
    }

    #[test]
    fn test_serializer_error_passes_through() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "bad row");
        assert!(matches!(
            stream_error(err, key()),
            Error::Serialization { .. }
        ));
    }

    #[test]
    fn test_reader_stops_at_len() {
        let arenas = MemoryArenas::new(2, ArenaAllocation::Lazy);
        let mut manager = InodeBlockManager::new(&arenas, &arenas, key(), BlockId::EMPTY);
        BlockWriter::new(&mut manager, 1).write_all(b"hello world").unwrap();

        let mut out = String::new();
        BlockReader::new(&manager, 5).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }
}
