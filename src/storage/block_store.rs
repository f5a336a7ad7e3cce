//! Size-tiered storage buckets.
//!
//! A [`BlockStore`] holds objects of one block size (8KB, 16KB, ...) across
//! one or more segment files. Block `b` lives in segment
//! `b / blocks_per_segment` at offset `(b % blocks_per_segment) × block_size`.
//!
//! ```text
//! segment 0 file                      segment 1 file
//! ┌────────┬────────┬────────┬──     ┌────────┬────────┬──
//! │ blk 0  │ blk 1  │ (free) │ ...   │ blk N  │ blk N+1│ ...
//! └────────┴────────┴────────┴──     └────────┴────────┴──
//! ```
//!
//! Freed blocks leave holes. Defragmentation moves the highest live block
//! of a segment into its lowest hole and truncates the file once nothing
//! more can move.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use crate::common::{BlockId, Result};
use crate::memory::ConcurrentBitSet;
use crate::storage::{FileStore, FileStoreReader, ObjectHeader, StorageManager};

/// Consecutive failed moves before a segment's defrag pass gives up.
const DEFRAG_MAX_STALLS: usize = 8;

/// Pause after a failed move.
const DEFRAG_BACKOFF: Duration = Duration::from_millis(5);

/// Copy buffer size for block transfers.
const COPY_CHUNK: usize = 64 * 1024;

/// Moves a stored block and repoints its owner.
///
/// The cache implements this: only it can map a header back to a location
/// record and swap the record's block under the record lock.
pub trait BlockRelocator {
    /// Try to move the object in `from` to a lower block of `store`.
    /// Returns whether the move happened.
    fn relocate(&self, store: &BlockStore, header: ObjectHeader, from: BlockId) -> Result<bool>;
}

/// Result of one segment defrag pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefragOutcome {
    /// Blocks moved toward the front.
    pub moved: usize,
    /// Segment file length after truncation.
    pub length: u64,
}

/// A storage bucket of fixed-size blocks.
///
/// # Thread Safety
/// - `blocks_in_use`: per-segment locks inside [`ConcurrentBitSet`]
/// - `locks[segment]`: `RwLock`, readers stream blocks out under the
///   read lock; writes, moves, and truncation take the write lock
pub struct BlockStore {
    block_size: usize,
    files: Vec<Arc<dyn FileStore>>,
    locks: Vec<RwLock<()>>,
    blocks_in_use: ConcurrentBitSet,
}

impl BlockStore {
    /// Create a bucket of `segments` files each addressing up to
    /// `max_file_size` bytes of `block_size` blocks.
    pub fn new(
        manager: &dyn StorageManager,
        block_size: usize,
        max_file_size: u64,
        segments: usize,
    ) -> Result<Self> {
        let segments = segments.max(1);
        let blocks_per_segment = (max_file_size / block_size as u64).max(1) as usize;
        let files = (0..segments)
            .map(|i| manager.create_file_store(&format!("bucket-{}k-{}", block_size >> 10, i)))
            .collect::<Result<Vec<_>>>()?;

        debug!(block_size, segments, blocks_per_segment, "created storage bucket");
        Ok(Self {
            block_size,
            files,
            locks: (0..segments).map(|_| RwLock::new(())).collect(),
            blocks_in_use: ConcurrentBitSet::with_segments(blocks_per_segment, segments),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.files.len()
    }

    #[inline]
    pub fn segment_of(&self, block: BlockId) -> usize {
        self.blocks_in_use.segment_of(block.index())
    }

    /// Blocks holding objects.
    #[inline]
    pub fn blocks_in_use(&self) -> usize {
        self.blocks_in_use.count_set()
    }

    fn locate(&self, block: BlockId) -> (usize, u64) {
        let per_segment = self.blocks_in_use.bits_per_segment();
        let segment = block.index() / per_segment;
        let offset = (block.index() % per_segment) as u64 * self.block_size as u64;
        (segment, offset)
    }

    /// Claim a block and fill it with `len` bytes from `reader`.
    pub fn write_to_storage_block(&self, reader: &mut dyn Read, len: u64) -> io::Result<BlockId> {
        if len > self.block_size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes do not fit a {} byte block", len, self.block_size),
            ));
        }
        let Some(index) = self.blocks_in_use.allocate_next() else {
            return Err(io::Error::other(format!(
                "storage bucket of {} byte blocks is full",
                self.block_size
            )));
        };
        let block = BlockId::from_index(index);
        let (segment, offset) = self.locate(block);

        let written = {
            let _write = self.locks[segment].write();
            self.copy_in(&*self.files[segment], reader, offset, len)
        };
        if let Err(e) = written {
            self.blocks_in_use.clear(index);
            return Err(e);
        }
        trace!(block_size = self.block_size, %block, len, "wrote storage block");
        Ok(block)
    }

    fn copy_in(&self, file: &dyn FileStore, reader: &mut dyn Read, offset: u64, len: u64) -> io::Result<()> {
        let end = offset + self.block_size as u64;
        if file.len()? < end {
            file.set_len(end)?;
        }
        let mut buf = vec![0u8; COPY_CHUNK.min(len as usize).max(1)];
        let mut done = 0u64;
        while done < len {
            let want = buf.len().min((len - done) as usize);
            reader.read_exact(&mut buf[..want])?;
            file.write_at(offset + done, &buf[..want])?;
            done += want as u64;
        }
        Ok(())
    }

    /// Stream `len` bytes of `block`. The segment read lock is held until the
    /// returned reader is dropped.
    pub fn read_range(&self, block: BlockId, len: u64) -> BlockRangeReader<'_> {
        let (segment, offset) = self.locate(block);
        BlockRangeReader {
            _lock: self.locks[segment].read(),
            inner: FileStoreReader::new(&*self.files[segment], offset, len),
        }
    }

    /// Read the object header at the start of `block`.
    pub fn read_header(&self, block: BlockId) -> io::Result<ObjectHeader> {
        ObjectHeader::read_from(&mut self.read_range(block, ObjectHeader::SIZE as u64))
    }

    /// Return a block to the free pool.
    pub fn release(&self, block: BlockId) -> bool {
        self.blocks_in_use.clear(block.index())
    }

    /// Whether a segment has enough holes below its last live block to be
    /// worth compacting.
    pub fn should_defrag(&self, segment: usize, min_defrag: u64) -> bool {
        let Some(highest) = self.blocks_in_use.highest_set_bit(segment) else {
            return false;
        };
        let span = highest + 1;
        let free = span.saturating_sub(self.blocks_in_use.count_set_in(segment));
        free > span / 4 && free as u64 * self.block_size as u64 > min_defrag
    }

    /// Copy `from` into the lowest free block of its segment when that block
    /// sits below it. The new block stays claimed; the caller releases
    /// whichever copy loses.
    pub fn relocate_lower(&self, from: BlockId) -> io::Result<Option<BlockId>> {
        let (segment, from_offset) = self.locate(from);
        let Some(index) = self.blocks_in_use.allocate_in_segment(segment) else {
            return Ok(None);
        };
        let to = BlockId::from_index(index);
        if to >= from {
            self.blocks_in_use.clear(index);
            return Ok(None);
        }
        let (_, to_offset) = self.locate(to);

        let copied = {
            let _write = self.locks[segment].write();
            let file = &*self.files[segment];
            let mut reader = FileStoreReader::new(file, from_offset, self.block_size as u64);
            self.copy_in(file, &mut reader, to_offset, self.block_size as u64)
        };
        if let Err(e) = copied {
            self.blocks_in_use.clear(index);
            return Err(e);
        }
        Ok(Some(to))
    }

    /// Compact one segment by pulling its highest blocks into lower holes,
    /// then truncate the file.
    pub fn defragment_segment(
        &self,
        segment: usize,
        min_defrag: u64,
        relocator: &dyn BlockRelocator,
    ) -> Result<DefragOutcome> {
        let mut outcome = DefragOutcome::default();
        let mut stalls = 0;
        while self.should_defrag(segment, min_defrag) {
            let Some(relative) = self.blocks_in_use.compact_highest_set_bit(segment) else {
                break;
            };
            let from = BlockId::from_index(segment * self.blocks_in_use.bits_per_segment() + relative);
            let moved = match self.read_header(from) {
                Ok(header) => relocator.relocate(self, header, from)?,
                // claimed but not written yet
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
                Err(e) => return Err(e.into()),
            };
            if moved {
                outcome.moved += 1;
                stalls = 0;
                continue;
            }
            stalls += 1;
            if stalls >= DEFRAG_MAX_STALLS {
                debug!(block_size = self.block_size, segment, "defrag stalled");
                break;
            }
            thread::sleep(DEFRAG_BACKOFF);
        }
        outcome.length = self.truncate(segment)?;
        Ok(outcome)
    }

    /// Cut a segment file down to its last live block. Returns the new length.
    pub fn truncate(&self, segment: usize) -> io::Result<u64> {
        let _write = self.locks[segment].write();
        let end = self
            .blocks_in_use
            .highest_set_bit(segment)
            .map_or(0, |highest| (highest as u64 + 1) * self.block_size as u64);
        let file = &*self.files[segment];
        let length = file.len()?;
        if length > end {
            debug!(file = file.name(), from = length, to = end, "truncating storage segment");
            file.set_len(end)?;
            return Ok(end);
        }
        Ok(length)
    }

    /// Bytes across all segment files.
    pub fn length(&self) -> u64 {
        self.files.iter().map(|file| file.len().unwrap_or(0)).sum()
    }
}

/// Reader over one stored block, holding its segment's read lock.
pub struct BlockRangeReader<'a> {
    _lock: RwLockReadGuard<'a, ()>,
    inner: FileStoreReader<'a>,
}

impl Read for BlockRangeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ObjectKey;
    use crate::storage::MemoryStorageManager;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const BLOCK: usize = 8192;

    fn store(segments: usize) -> BlockStore {
        BlockStore::new(&MemoryStorageManager::new(), BLOCK, 1 << 20, segments).unwrap()
    }

    fn object(key: ObjectKey, fill: u8) -> Vec<u8> {
        let mut bytes = ObjectHeader::new(key).to_bytes().to_vec();
        bytes.extend(std::iter::repeat(fill).take(100));
        bytes
    }

    fn put(store: &BlockStore, data: &[u8]) -> BlockId {
        store
            .write_to_storage_block(&mut &data[..], data.len() as u64)
            .unwrap()
    }

    /// Tracks where each key lives, the way the cache's records do.
    struct Locations(Mutex<HashMap<ObjectKey, BlockId>>);

    impl BlockRelocator for Locations {
        fn relocate(&self, store: &BlockStore, header: ObjectHeader, from: BlockId) -> Result<bool> {
            let mut locations = self.0.lock();
            if locations.get(&header.key()) != Some(&from) {
                return Ok(false);
            }
            let Some(to) = store.relocate_lower(from)? else {
                return Ok(false);
            };
            locations.insert(header.key(), to);
            store.release(from);
            Ok(true)
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let store = store(1);
        let data = object(ObjectKey::new(1, 1), 0xAA);
        let block = put(&store, &data);

        let mut out = Vec::new();
        store.read_range(block, data.len() as u64).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(store.read_header(block).unwrap().key(), ObjectKey::new(1, 1));
        assert_eq!(store.length(), BLOCK as u64);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let store = store(1);
        let data = vec![0u8; BLOCK + 1];
        assert!(store.write_to_storage_block(&mut &data[..], data.len() as u64).is_err());
        assert_eq!(store.blocks_in_use(), 0);
    }

    #[test]
    fn test_short_reader_releases_block() {
        let store = store(1);
        let data = vec![1u8; 10];
        assert!(store.write_to_storage_block(&mut &data[..], 20).is_err());
        assert_eq!(store.blocks_in_use(), 0);
    }

    #[test]
    fn test_should_defrag_thresholds() {
        let store = store(1);
        let blocks: Vec<_> = (0..8).map(|i| put(&store, &object(ObjectKey::new(1, i), 0))).collect();
        assert!(!store.should_defrag(0, 0));

        store.release(blocks[0]);
        assert!(!store.should_defrag(0, 0));

        store.release(blocks[1]);
        store.release(blocks[2]);
        assert!(store.should_defrag(0, 0));
        assert!(!store.should_defrag(0, 3 * BLOCK as u64));
    }

    #[test]
    fn test_defragment_compacts_and_truncates() {
        let store = store(1);
        let locations = Locations(Mutex::new(HashMap::new()));
        for i in 0..10 {
            let key = ObjectKey::new(1, i);
            let block = put(&store, &object(key, i as u8));
            locations.0.lock().insert(key, block);
        }
        assert_eq!(store.length(), 10 * BLOCK as u64);

        for i in 0..6 {
            let block = locations.0.lock().remove(&ObjectKey::new(1, i)).unwrap();
            store.release(block);
        }

        let outcome = store.defragment_segment(0, 0, &locations).unwrap();
        assert!(outcome.moved > 0);
        assert!(outcome.length < 10 * BLOCK as u64);
        assert_eq!(store.length(), outcome.length);

        for (key, block) in locations.0.lock().iter() {
            let mut out = Vec::new();
            store.read_range(*block, 116).read_to_end(&mut out).unwrap();
            assert_eq!(out, object(*key, key.object as u8));
        }
    }

    #[test]
    fn test_relocate_lower_needs_a_lower_hole() {
        let store = store(1);
        let a = put(&store, &object(ObjectKey::new(1, 0), 0));
        let b = put(&store, &object(ObjectKey::new(1, 1), 1));
        assert_eq!(store.relocate_lower(b).unwrap(), None);

        store.release(a);
        assert_eq!(store.relocate_lower(b).unwrap(), Some(a));
    }

    #[test]
    fn test_segments_are_separate_files() {
        let store = BlockStore::new(&MemoryStorageManager::new(), BLOCK, BLOCK as u64 * 2, 2).unwrap();
        let blocks: Vec<_> = (0..4).map(|i| put(&store, &object(ObjectKey::new(1, i), 0))).collect();
        let segments: Vec<_> = blocks.iter().map(|&b| store.segment_of(b)).collect();
        assert_eq!(segments.iter().filter(|&&s| s == 0).count(), 2);
        assert_eq!(segments.iter().filter(|&&s| s == 1).count(), 2);

        let data = object(ObjectKey::new(1, 9), 0);
        assert!(store.write_to_storage_block(&mut &data[..], data.len() as u64).is_err());
    }
}
