//! Buffer Cache - the two-tier object cache.
//!
//! The [`BufferCache`] provides:
//! - Object storage in a fixed memory arena, addressed through inodes
//! - Demotion of cold objects into size-tiered storage buckets
//! - Promotion back into memory on access
//! - Background memory cleaning and storage defragmentation

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::background::{SingleFlight, WorkerPool, WORKER_THREADS};
use crate::buffer::record::{blocks_for, Activity, Location, LocationRecord, RecordState};
use crate::buffer::replacer::{EvictionQueue, LrfuPolicy, OrderingPolicy};
use crate::buffer::{CacheStats, LoadGuard, Serializer, StatsSnapshot};
use crate::common::config::{
    ADDRESSES_PER_BLOCK, BLOCK_SIZE, EVICTION_SCANS, LOG_BLOCK_SIZE, MAX_DOUBLE_INDIRECT,
};
use crate::common::{
    BlockId, BufferConfig, Error, GroupId, ObjectId, ObjectKey, Result, Semaphore,
};
use crate::memory::{
    pointer_blocks_for, stream_error, BlockReader, BlockSource, BlockWriter, InodeBlockManager,
    MemoryArenas,
};
use crate::storage::{
    BlockRelocator, BlockStore, FileStorageManager, FileStore, MemoryStorageManager,
    ObjectHeader, StorageManager,
};

/// Members of one cache group. `None` marks a reserved id with nothing
/// stored yet.
type GroupMembers = Mutex<HashMap<ObjectId, Option<Arc<LocationRecord>>>>;

/// Outcome of one eviction attempt.
enum Eviction {
    /// A block was freed and claimed for the caller.
    Acquired(BlockId),
    /// An object left memory.
    Freed,
    /// Nothing could be evicted.
    Nothing,
}

/// Outcome of releasing an object's memory copy.
enum Release {
    /// The memory copy is gone; carries the block kept for reuse, if any.
    Freed(Option<BlockId>),
    /// Demotion failed and the object stays in memory.
    Kept,
}

/// Caches serialized objects in memory and spills them to storage.
///
/// # Architecture
/// ```text
/// ┌─────────────────────────────────────────────────────────────────┐
/// │                          BufferCache                            │
/// │  ┌────────────────┐   ┌──────────────────────────────────────┐  │
/// │  │ groups         │   │ MemoryArenas                         │  │
/// │  │ DashMap<gid,   │──▶│ inodes ─▶ [blk][blk][ptr][blk] ...   │  │
/// │  │  records>      │   └──────────────────────────────────────┘  │
/// │  └────────────────┘                   │ demote ▲ promote        │
/// │  ┌────────────────┐   ┌───────────────▼──────┴───────────────┐  │
/// │  │ eviction_queue │   │ size_stores: 8K │ 16K │ 32K │ ...     │  │
/// │  │ (LRFU order)   │   │  segment files per bucket            │  │
/// │  └────────────────┘   └──────────────────────────────────────┘  │
/// │  workers: cleaner + defrag (single-flight)                      │
/// └─────────────────────────────────────────────────────────────────┘
/// ```
///
/// # Thread Safety
/// - `groups`: `DashMap`, each group's members behind their own `Mutex`
/// - each record: `Mutex` + `Condvar`, location and activity state
/// - `memory_write_permits`: `Semaphore`, bounds blocks promised to writers
/// - `memory_eviction_lock`: `RwLock`, allocators share it, a forced
///   eviction that must wait on busy records takes it exclusively
/// - `eviction_queue`: lock-free skip list, updated under the record lock
/// - each storage segment: `RwLock`, see [`BlockStore`]
///
/// Locks are taken in the order group members, then record.
///
/// # Usage
/// ```ignore
/// let cache = BufferCache::new(BufferConfig::default())?;
/// cache.create_cache_group(1);
/// cache.add_to_cache_group(1, 42);
/// cache.add(42, &rows, &serializer)?;
///
/// if let Some(guard) = cache.lock_for_load(1, 42) {
///     let rows = cache.get(&guard, &serializer)?;
/// }
/// ```
pub struct BufferCache {
    context: Arc<CacheContext>,
}

pub(crate) struct CacheContext {
    me: Weak<CacheContext>,
    config: BufferConfig,
    memory: MemoryArenas,
    max_memory_blocks: usize,
    cleaning_threshold: usize,
    critical_cleaning_threshold: usize,
    memory_write_permits: Semaphore,
    memory_eviction_lock: RwLock<()>,
    eviction_queue: EvictionQueue,
    groups: DashMap<GroupId, Arc<GroupMembers>>,
    storage: Arc<dyn StorageManager>,
    size_stores: Vec<BlockStore>,
    stats: CacheStats,
    cleaner: SingleFlight,
    defrag: SingleFlight,
    workers: WorkerPool,
}

impl BufferCache {
    /// Create a cache backed by files (or heap stores when `use_disk` is off).
    pub fn new(config: BufferConfig) -> Result<Self> {
        let storage: Arc<dyn StorageManager> = if !config.use_disk {
            Arc::new(MemoryStorageManager::new())
        } else if let Some(dir) = &config.disk_directory {
            Arc::new(FileStorageManager::new(dir)?)
        } else {
            Arc::new(FileStorageManager::temporary()?)
        };
        Self::with_storage_manager(config, storage)
    }

    /// Create a cache over an explicit storage manager.
    pub fn with_storage_manager(
        config: BufferConfig,
        storage: Arc<dyn StorageManager>,
    ) -> Result<Self> {
        Self::with_components(config, storage, Box::new(LrfuPolicy::default()))
    }

    /// Create a cache with an explicit storage manager and ordering policy.
    pub fn with_components(
        config: BufferConfig,
        storage: Arc<dyn StorageManager>,
        policy: Box<dyn OrderingPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        let space = config.effective_memory_buffer_space();
        let per_block = ADDRESSES_PER_BLOCK as u64;
        let blocks = ((space >> LOG_BLOCK_SIZE) * per_block / (per_block + 1))
            .clamp(1, BlockId::MAX as u64) as usize;

        let mut max_memory_blocks = config
            .max_storage_object_size
            .div_ceil(BLOCK_SIZE)
            .clamp(1, MAX_DOUBLE_INDIRECT)
            .min(blocks);
        while max_memory_blocks > 1 && max_memory_blocks + pointer_blocks_for(max_memory_blocks) > blocks {
            max_memory_blocks -= 1;
        }
        let cleaning_threshold = (max_memory_blocks << 4).min(blocks >> 1);
        let critical_cleaning_threshold = (max_memory_blocks << 2).min(blocks >> 2);

        let size_stores = build_size_stores(&config, storage.as_ref())?;
        let workers = WorkerPool::new(WORKER_THREADS, "spillcache-worker")?;

        info!(
            blocks,
            max_memory_blocks,
            cleaning_threshold,
            critical_cleaning_threshold,
            buckets = size_stores.len(),
            policy = policy.name(),
            "buffer cache initialized"
        );

        let context = Arc::new_cyclic(|me| CacheContext {
            me: me.clone(),
            memory: MemoryArenas::new(blocks, config.arena_allocation),
            max_memory_blocks,
            cleaning_threshold,
            critical_cleaning_threshold,
            memory_write_permits: Semaphore::new(blocks),
            memory_eviction_lock: RwLock::new(()),
            eviction_queue: EvictionQueue::new(policy),
            groups: DashMap::new(),
            storage,
            size_stores,
            stats: CacheStats::new(),
            cleaner: SingleFlight::new(),
            defrag: SingleFlight::new(),
            workers,
            config,
        });
        Ok(Self { context })
    }

    // ========================================================================
    // Public API: Cache groups
    // ========================================================================

    /// Register a group. Existing groups are left untouched.
    pub fn create_cache_group(&self, group: GroupId) {
        debug!(group, "creating cache group");
        self.context
            .groups
            .entry(group)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())));
    }

    /// Reserve an object id in a group so a later `add` is accepted.
    ///
    /// Returns false if the group does not exist.
    pub fn add_to_cache_group(&self, group: GroupId, object: ObjectId) -> bool {
        let Some(members) = self.context.group(group) else {
            return false;
        };
        members.lock().entry(object).or_insert(None);
        true
    }

    /// Drop a group and free every object in it. Returns the ids it held.
    pub fn remove_cache_group(&self, group: GroupId) -> Vec<ObjectId> {
        debug!(group, "removing cache group");
        let Some((_, members)) = self.context.groups.remove(&group) else {
            return Vec::new();
        };
        let drained: Vec<_> = members.lock().drain().collect();

        let mut ids = Vec::with_capacity(drained.len());
        for (object, record) in drained {
            if let Some(record) = record {
                self.context.free_quietly(&record);
            }
            ids.push(object);
        }
        ids
    }

    // ========================================================================
    // Public API: Objects
    // ========================================================================

    /// Store `value` under `object` in the serializer's group.
    ///
    /// Returns `Ok(true)` when the cache is done with the object (stored,
    /// already resident, or no longer reserved) and `Ok(false)` when another
    /// add of the same object is in flight.
    ///
    /// # Errors
    /// - `Error::MaxBlocksExceeded` if a new object is larger than the
    ///   configured maximum
    /// - `Error::Serialization` if the serializer fails
    pub fn add<T>(&self, object: ObjectId, value: &T, serializer: &dyn Serializer<T>) -> Result<bool> {
        self.context
            .add(ObjectKey::new(serializer.group_id(), object), value, serializer)
    }

    /// Take the exclusive load lock of an object.
    ///
    /// Returns `None` if the object has no record (never added or removed).
    pub fn lock_for_load(&self, group: GroupId, object: ObjectId) -> Option<LoadGuard> {
        let record = self.context.lookup(ObjectKey::new(group, object))?;
        Some(LoadGuard::acquire(record))
    }

    /// Read an object, promoting it into memory if it was on storage.
    ///
    /// Returns `Ok(None)` if the object was removed.
    pub fn get<T>(&self, guard: &LoadGuard, serializer: &dyn Serializer<T>) -> Result<Option<T>> {
        self.context.get(guard.record(), serializer)
    }

    /// Lock, read, and unlock an object in one call.
    pub fn get_object<T>(
        &self,
        group: GroupId,
        object: ObjectId,
        serializer: &dyn Serializer<T>,
    ) -> Result<Option<T>> {
        match self.lock_for_load(group, object) {
            Some(guard) => self.get(&guard, serializer),
            None => Ok(None),
        }
    }

    /// Remove an object and release its memory and storage.
    ///
    /// Returns the object's serialized size if it held data.
    pub fn remove(&self, group: GroupId, object: ObjectId) -> Option<u64> {
        let members = self.context.group(group)?;
        let record = members.lock().remove(&object)??;
        debug!(key = %record.key(), "removing object");
        let size = record.lock().size();
        self.context.free_quietly(&record);
        Some(size)
    }

    // ========================================================================
    // Public API: Maintenance
    // ========================================================================

    /// Defragment every storage bucket now, excluding the background task.
    pub fn defragment(&self) {
        let context = &self.context;
        context.defrag.run_now(|| context.run_defrag());
    }

    /// Create an auxiliary store through the cache's storage manager.
    pub fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        self.context.storage.create_file_store(name)
    }

    // ========================================================================
    // Public API: Metrics
    // ========================================================================

    pub fn inodes_in_use(&self) -> usize {
        self.context.memory.inodes_in_use()
    }

    pub fn data_blocks_in_use(&self) -> usize {
        self.context.memory.data_blocks_in_use()
    }

    /// Gets that read an object back from storage.
    pub fn storage_reads(&self) -> u64 {
        self.context.stats.snapshot().storage_reads
    }

    /// Objects written out to storage.
    pub fn storage_writes(&self) -> u64 {
        self.context.stats.snapshot().storage_writes
    }

    /// Bytes held by all storage files.
    pub fn disk_usage(&self) -> u64 {
        self.context.size_stores.iter().map(BlockStore::length).sum()
    }

    /// Memory buffer capacity in bytes.
    pub fn memory_buffer_space(&self) -> u64 {
        self.context.config.effective_memory_buffer_space()
    }

    /// Data blocks in the memory arena.
    pub fn memory_blocks(&self) -> usize {
        self.context.memory.blocks()
    }

    /// Largest number of memory blocks one object may use.
    pub fn max_memory_blocks(&self) -> usize {
        self.context.max_memory_blocks
    }

    /// Objects currently in memory.
    pub fn memory_resident_objects(&self) -> usize {
        self.context.eviction_queue.len()
    }

    /// Storage buckets, smallest block size first.
    pub fn storage_buckets(&self) -> usize {
        self.context.size_stores.len()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.context.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.context.workers.shutdown();
    }
}

/// Buckets of doubling block size until one holds the largest object.
fn build_size_stores(config: &BufferConfig, storage: &dyn StorageManager) -> Result<Vec<BlockStore>> {
    let mut stores = Vec::new();
    let mut block_size = BLOCK_SIZE;
    let mut segments = config.storage_segments;
    loop {
        stores.push(BlockStore::new(
            storage,
            block_size,
            config.max_storage_file_size,
            segments,
        )?);
        block_size <<= 1;
        if segments > 1 {
            segments >>= 1;
        }
        if (block_size >> 1) >= config.max_storage_object_size {
            break;
        }
    }
    Ok(stores)
}

impl CacheContext {
    fn group(&self, group: GroupId) -> Option<Arc<GroupMembers>> {
        self.groups.get(&group).map(|members| Arc::clone(members.value()))
    }

    fn lookup(&self, key: ObjectKey) -> Option<Arc<LocationRecord>> {
        let members = self.group(key.group)?;
        let record = members.lock().get(&key.object)?.clone();
        record
    }

    // ========================================================================
    // Add
    // ========================================================================

    fn add<T>(&self, key: ObjectKey, value: &T, serializer: &dyn Serializer<T>) -> Result<bool> {
        trace!(%key, "adding object");
        let Some(members) = self.group(key.group) else {
            return Ok(true);
        };
        let (record, new_entry) = {
            let mut members = members.lock();
            match members.get(&key.object) {
                None => return Ok(true),
                Some(Some(record)) => (Arc::clone(record), false),
                Some(None) => {
                    let record = Arc::new(LocationRecord::new(key, self.eviction_queue.initial_stats()));
                    record.lock().set_activity(key, Activity::Adding)?;
                    members.insert(key.object, Some(Arc::clone(&record)));
                    (record, true)
                }
            }
        };

        let mut memory_blocks = self.max_memory_blocks;
        if !new_entry {
            let mut state = record.lock();
            if state.activity() == Activity::Adding {
                return Ok(false);
            }
            if state.activity() == Activity::Evicting
                || state.pinned()
                || state.location().is_memory()
                || !self.should_place_in_memory(&state)
            {
                return Ok(true);
            }
            state.set_activity(key, Activity::Adding)?;
            if state.memory_block_count() > 0 {
                memory_blocks = state.memory_block_count();
            }
        }

        let result = self.write_into_memory(&members, &record, value, serializer, memory_blocks);
        {
            let mut state = record.lock();
            if state.activity() == Activity::Adding {
                state.set_activity(key, Activity::Idle)?;
            }
        }
        record.notify_all();

        match result {
            Ok(installed) => {
                if installed {
                    CacheStats::bump(&self.stats.objects_added);
                }
                Ok(true)
            }
            Err(e @ Error::SizeChanged { .. }) => {
                debug!(%key, error = %e, "object changed size, keeping stored copy");
                Ok(true)
            }
            Err(e @ Error::MaxBlocksExceeded { .. }) if !new_entry => {
                debug!(%key, error = %e, "object grew past its stored size, keeping stored copy");
                Ok(true)
            }
            Err(e) => {
                error!(%key, error = %e, "error persisting object");
                Err(e)
            }
        }
    }

    /// Serialize into fresh memory blocks and install the result.
    /// Returns whether the record now points at the new copy.
    fn write_into_memory<T>(
        &self,
        members: &GroupMembers,
        record: &Arc<LocationRecord>,
        value: &T,
        serializer: &dyn Serializer<T>,
        memory_blocks: usize,
    ) -> Result<bool> {
        let key = record.key();
        self.check_for_low_memory();
        let _permits = self.memory_write_permits.acquire(memory_blocks);

        let mut manager = InodeBlockManager::new(&self.memory, self, key, BlockId::EMPTY);
        let written = serialize_into(&mut manager, memory_blocks, key, value, serializer);
        let (size, checksum) = match written {
            Ok(written) => written,
            Err(e) => {
                manager.free(false);
                return Err(e);
            }
        };

        let installed = {
            let members = members.lock();
            let current = matches!(
                members.get(&key.object),
                Some(Some(existing)) if Arc::ptr_eq(existing, record)
            );
            if current && self.groups.contains_key(&key.group) {
                let mut state = record.lock();
                self.install_memory_copy(record, &mut state, manager.inode(), size, checksum)
            } else {
                Ok(false)
            }
        };
        if !matches!(installed, Ok(true)) {
            manager.free(false);
        }
        installed
    }

    fn install_memory_copy(
        &self,
        record: &Arc<LocationRecord>,
        state: &mut RecordState,
        inode: BlockId,
        size: u64,
        checksum: u32,
    ) -> Result<bool> {
        let key = record.key();
        if state.location().is_memory() {
            return Ok(false);
        }
        state.set_size(key, size)?;
        let previous = state.location();
        state.set_location(key, Location::Memory { inode })?;
        state.set_checksum(checksum);
        self.eviction_queue.add(record, state);
        if let Location::Disk { block } = previous {
            self.release_storage_block(state.size_index(), block);
        }
        debug!(%key, %inode, size, "object stored in memory");
        Ok(true)
    }

    /// Whether an object coming back should displace what is in memory.
    fn should_place_in_memory(&self, state: &RecordState) -> bool {
        if self.memory.free_blocks() > self.critical_cleaning_threshold + state.memory_block_count() {
            return true;
        }
        match self.eviction_queue.first() {
            Some((lowest, _)) => {
                lowest.ordering_value < self.eviction_queue.projected_ordering_value(state)
            }
            None => false,
        }
    }

    // ========================================================================
    // Get
    // ========================================================================

    fn get<T>(&self, record: &Arc<LocationRecord>, serializer: &dyn Serializer<T>) -> Result<Option<T>> {
        let key = record.key();
        let source = {
            let mut state = record.lock();
            record.wait_unpinned(&mut state);
            match state.location() {
                Location::Unallocated => return Ok(None),
                Location::Memory { .. } => {
                    state.pin(key)?;
                    self.eviction_queue.touch(record, &mut state);
                    CacheStats::bump(&self.stats.memory_hits);
                }
                // only a removal claims a stored record
                Location::Disk { .. } if state.activity() == Activity::Evicting => return Ok(None),
                Location::Disk { .. } => {
                    state.pin(key)?;
                    self.eviction_queue.record_access(&mut state);
                    CacheStats::bump(&self.stats.storage_reads);
                }
            }
            (state.location(), state.size(), state.size_index(), state.checksum())
        };

        let result = self.read_pinned(record, source, serializer);
        record.lock().unpin();
        record.notify_all();
        result.map(Some)
    }

    fn read_pinned<T>(
        &self,
        record: &Arc<LocationRecord>,
        (location, size, size_index, checksum): (Location, u64, usize, u32),
        serializer: &dyn Serializer<T>,
    ) -> Result<T> {
        let key = record.key();
        let inode = match location {
            Location::Memory { inode } => {
                trace!(%key, %inode, "getting object from memory");
                inode
            }
            Location::Disk { block } => {
                trace!(%key, %block, size_index, "getting object from storage");
                self.promote(record, block, size, size_index, checksum)?
            }
            Location::Unallocated => {
                return Err(Error::Corrupted {
                    key,
                    reason: "object vanished while pinned".into(),
                })
            }
        };

        let manager = InodeBlockManager::new(&self.memory, self, key, inode);
        let mut reader = BlockReader::new(&manager, size);
        let header = ObjectHeader::read_from(&mut reader).map_err(|e| stream_error(e, key))?;
        if header.key() != key {
            return Err(Error::Corrupted {
                key,
                reason: format!("header names {}", header.key()),
            });
        }
        serializer
            .deserialize(&mut reader)
            .map_err(|e| stream_error(e, key))
    }

    /// Copy a stored object into fresh memory blocks and repoint its record.
    /// Returns the new inode.
    fn promote(
        &self,
        record: &Arc<LocationRecord>,
        block: BlockId,
        size: u64,
        size_index: usize,
        checksum: u32,
    ) -> Result<BlockId> {
        let key = record.key();
        let blocks = blocks_for(size);
        self.check_for_low_memory();
        let _permits = self.memory_write_permits.acquire(blocks);

        let mut manager = InodeBlockManager::new(&self.memory, self, key, BlockId::EMPTY);
        let promoted = self.copy_from_storage(record, &mut manager, block, size, size_index, checksum);
        match promoted {
            Ok(true) => Ok(manager.inode()),
            Ok(false) => {
                manager.free(false);
                record.lock().location().inode().ok_or_else(|| Error::Corrupted {
                    key,
                    reason: "object moved while being read".into(),
                })
            }
            Err(e) => {
                manager.free(false);
                Err(e)
            }
        }
    }

    fn copy_from_storage(
        &self,
        record: &Arc<LocationRecord>,
        manager: &mut InodeBlockManager<'_>,
        block: BlockId,
        size: u64,
        size_index: usize,
        checksum: u32,
    ) -> Result<bool> {
        let key = record.key();
        let blocks = blocks_for(size);
        // claim every block before holding the segment lock
        for index in 0..blocks {
            manager.allocate_block_id(index)?;
        }

        let store = &self.size_stores[size_index];
        let mut source = store.read_range(block, size);
        let mut writer = BlockWriter::preallocated(manager, blocks);
        io::copy(&mut source, &mut writer).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Corrupted {
                key,
                reason: format!("storage block {} is short", block),
            },
            _ => Error::Storage { key, source: e },
        })?;
        let (_, actual) = writer.finish();
        if actual != checksum {
            return Err(Error::Corrupted {
                key,
                reason: format!("checksum mismatch: expected {:08x}, found {:08x}", checksum, actual),
            });
        }

        let mut state = record.lock();
        if state.location() != (Location::Disk { block }) {
            return Ok(false);
        }
        state.set_location(key, Location::Memory { inode: manager.inode() })?;
        self.eviction_queue.add(record, &state);
        drop(source);
        self.release_storage_block(size_index, block);
        debug!(%key, inode = %manager.inode(), "object promoted into memory");
        Ok(true)
    }

    // ========================================================================
    // Release (demotion or removal)
    // ========================================================================

    fn free_quietly(&self, record: &Arc<LocationRecord>) {
        if let Err(e) = self.free_for_demotion_or_removal(record, false, false) {
            error!(key = %record.key(), error = %e, "error freeing object");
        }
    }

    /// Release an object's memory copy, either writing it to storage first
    /// (`demote`) or dropping it entirely along with any storage copy.
    ///
    /// A demotion requires the caller to have marked the record `Evicting`.
    /// With `acquire`, the first freed memory block stays claimed and is
    /// returned for the caller's own write.
    fn free_for_demotion_or_removal(
        &self,
        record: &Arc<LocationRecord>,
        demote: bool,
        acquire: bool,
    ) -> Result<Release> {
        let key = record.key();
        let (inode, size, size_index) = {
            let mut state = record.lock();
            if demote {
                if state.activity() != Activity::Evicting {
                    return Err(Error::IllegalTransition {
                        key,
                        from: "unclaimed",
                        to: "demoted",
                    });
                }
            } else {
                record.wait_idle(&mut state);
                state.set_activity(key, Activity::Evicting)?;
            }
            (state.location().inode(), state.size(), state.size_index())
        };

        let mut stored = None;
        if demote {
            if let Some(inode) = inode {
                let manager = InodeBlockManager::new(&self.memory, self, key, inode);
                let mut reader = BlockReader::new(&manager, size);
                match self.size_stores[size_index].write_to_storage_block(&mut reader, size) {
                    Ok(block) => {
                        CacheStats::bump(&self.stats.storage_writes);
                        stored = Some(block);
                    }
                    Err(e) => error!(%key, error = %e, "error transferring object to storage"),
                }
            }
        }

        let mut state = record.lock();
        record.wait_unpinned(&mut state);
        // a get that pinned before the claim may have promoted the object
        let mut manager = state
            .location()
            .inode()
            .map(|inode| InodeBlockManager::new(&self.memory, self, key, inode));
        let outcome = self.finish_release(record, &mut state, manager.as_mut(), demote, acquire, stored);
        if state.activity() == Activity::Evicting {
            state.set_activity(key, Activity::Idle)?;
        }
        drop(state);
        record.notify_all();
        outcome
    }

    fn finish_release(
        &self,
        record: &Arc<LocationRecord>,
        state: &mut RecordState,
        manager: Option<&mut InodeBlockManager<'_>>,
        demote: bool,
        acquire: bool,
        stored: Option<BlockId>,
    ) -> Result<Release> {
        let key = record.key();
        if demote {
            let (Some(manager), Some(block)) = (manager, stored) else {
                return Ok(Release::Kept);
            };
            self.eviction_queue.remove(record, state);
            state.set_location(key, Location::Disk { block })?;
            debug!(%key, %block, size_index = state.size_index(), "object demoted to storage");
            return Ok(Release::Freed(manager.free(acquire)));
        }

        if state.location().is_memory() {
            self.eviction_queue.remove(record, state);
        }
        if let Some(block) = state.location().disk_block() {
            self.release_storage_block(state.size_index(), block);
        }
        state.set_location(key, Location::Unallocated)?;
        Ok(Release::Freed(manager.and_then(|m| m.free(acquire))))
    }

    fn release_storage_block(&self, size_index: usize, block: BlockId) {
        let store = &self.size_stores[size_index];
        store.release(block);
        trace!(%block, size_index, "released storage block");
        if store.should_defrag(store.segment_of(block), self.config.min_defrag) {
            self.schedule_defrag();
        }
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    fn low_blocks(&self, critical: bool) -> bool {
        let in_use = self.memory.data_blocks_in_use();
        let threshold = if critical {
            self.critical_cleaning_threshold
        } else {
            self.cleaning_threshold
        };
        in_use > 0 && self.memory.blocks() - in_use < threshold && !self.eviction_queue.is_empty()
    }

    /// Start the cleaner when memory runs low; evict inline when critical.
    fn check_for_low_memory(&self) {
        if !self.cleaner.is_scheduled() {
            if self.low_blocks(false) && self.cleaner.try_schedule() {
                debug!("starting memory buffer cleaner");
                self.submit(|context| context.cleaner.run_scheduled(|| context.run_cleaner()), &self.cleaner);
                if self.low_blocks(true) {
                    self.evict_quietly();
                }
            }
        } else if self.low_blocks(true) {
            self.evict_quietly();
        }
    }

    fn evict_quietly(&self) {
        if let Err(e) = self.evict_from_memory(false) {
            warn!(error = %e, "error evicting from memory");
        }
    }

    fn run_cleaner(&self) {
        while self.low_blocks(false) {
            match self.evict_from_memory(false) {
                Ok(Eviction::Freed) => {}
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "error cleaning memory buffer");
                    break;
                }
            }
        }
    }

    /// Push objects out of memory.
    ///
    /// With `acquire`, keep going until a block can be claimed for the
    /// caller; otherwise evict at most one object while memory is low.
    /// Busy records are skipped except on the last scan of a forced
    /// eviction, which takes the eviction lock exclusively and waits.
    fn evict_from_memory(&self, acquire: bool) -> Result<Eviction> {
        let mut exclusive = None;
        for scan in 0..EVICTION_SCANS {
            let wait_for_busy = acquire && scan + 1 == EVICTION_SCANS;
            let mut cursor = None;
            loop {
                if acquire {
                    if let Some(block) = self.memory.try_claim_any_block() {
                        return Ok(Eviction::Acquired(block));
                    }
                } else if !self.low_blocks(false) {
                    return Ok(Eviction::Nothing);
                }
                let Some((position, record)) = self.eviction_queue.next_after(cursor) else {
                    break;
                };
                cursor = Some(position);
                if !self.claim_victim(&record, wait_for_busy, &mut exclusive)? {
                    continue;
                }
                match self.free_for_demotion_or_removal(&record, true, acquire)? {
                    Release::Freed(reused) => {
                        CacheStats::bump(&self.stats.evictions);
                        match reused {
                            Some(block) if acquire => return Ok(Eviction::Acquired(block)),
                            _ if !acquire => return Ok(Eviction::Freed),
                            _ => {}
                        }
                    }
                    Release::Kept => {}
                }
            }
        }
        Ok(Eviction::Nothing)
    }

    /// Mark a memory-resident record `Evicting`. Returns false when it is
    /// not resident or busy and `wait` is off.
    fn claim_victim<'s>(
        &'s self,
        record: &Arc<LocationRecord>,
        wait: bool,
        exclusive: &mut Option<RwLockWriteGuard<'s, ()>>,
    ) -> Result<bool> {
        let key = record.key();
        let mut state = record.lock();
        if !state.location().is_memory() {
            return Ok(false);
        }
        if state.pinned() || state.activity() != Activity::Idle {
            if !wait {
                return Ok(false);
            }
            if exclusive.is_none() {
                drop(state);
                *exclusive = Some(self.memory_eviction_lock.write());
                state = record.lock();
            }
            record.wait_idle(&mut state);
            if !state.location().is_memory() {
                return Ok(false);
            }
        }
        state.set_activity(key, Activity::Evicting)?;
        Ok(true)
    }

    // ========================================================================
    // Defrag
    // ========================================================================

    fn schedule_defrag(&self) {
        if self.defrag.try_schedule() {
            self.submit(|context| context.defrag.run_scheduled(|| context.run_defrag()), &self.defrag);
        }
    }

    fn run_defrag(&self) {
        trace!("running defrag");
        for (size_index, store) in self.size_stores.iter().enumerate() {
            for segment in 0..store.segment_count() {
                if !store.should_defrag(segment, self.config.min_defrag) {
                    // nothing to move, but trailing free blocks can still go
                    if let Err(e) = store.truncate(segment) {
                        warn!(size_index, segment, error = %e, "error performing defrag truncate");
                    }
                    continue;
                }
                match store.defragment_segment(segment, self.config.min_defrag, self) {
                    Ok(outcome) => {
                        self.stats
                            .defrag_moves
                            .fetch_add(outcome.moved as u64, Ordering::Relaxed);
                        debug!(size_index, segment, moved = outcome.moved, length = outcome.length, "defragmented segment");
                    }
                    Err(e) => warn!(size_index, segment, error = %e, "error performing defrag"),
                }
            }
        }
    }

    /// Hand a task to the worker pool, releasing its gate if the pool
    /// refuses it.
    fn submit<F>(&self, task: F, gate: &SingleFlight)
    where
        F: FnOnce(&CacheContext) + Send + 'static,
    {
        let me = self.me.clone();
        let submitted = self.workers.submit(Box::new(move || {
            if let Some(context) = me.upgrade() {
                task(&context);
            }
        }));
        if !submitted {
            gate.cancel();
        }
    }
}

/// Allocation for writers: take a free block, or evict until one frees up.
impl BlockSource for CacheContext {
    fn next_block(&self, segment_hint: usize) -> Result<BlockId> {
        {
            let _shared = self.memory_eviction_lock.read();
            if let Some(block) = self.memory.try_claim_block(segment_hint) {
                return Ok(block);
            }
        }
        match self.evict_from_memory(true)? {
            Eviction::Acquired(block) => Ok(block),
            _ => Err(Error::EvictionFailed),
        }
    }
}

/// Defrag moves: find the record named by a stored header and swap its
/// block for a lower one, under the record lock.
impl BlockRelocator for CacheContext {
    fn relocate(&self, store: &BlockStore, header: ObjectHeader, from: BlockId) -> Result<bool> {
        let key = header.key();
        let Some(record) = self.lookup(key) else {
            return Ok(false);
        };
        let owns = |state: &RecordState| {
            state.location() == (Location::Disk { block: from })
                && std::ptr::eq(&self.size_stores[state.size_index()], store)
        };
        {
            let mut state = record.lock();
            record.wait_unpinned(&mut state);
            if !owns(&state) {
                return Ok(false);
            }
        }

        let Some(to) = store.relocate_lower(from)? else {
            return Ok(false);
        };
        let mut state = record.lock();
        record.wait_unpinned(&mut state);
        if !owns(&state) {
            store.release(to);
            return Ok(false);
        }
        state.set_location(key, Location::Disk { block: to })?;
        store.release(from);
        trace!(%key, %from, %to, "relocated storage block");
        Ok(true)
    }
}

fn serialize_into<T>(
    manager: &mut InodeBlockManager<'_>,
    max_blocks: usize,
    key: ObjectKey,
    value: &T,
    serializer: &dyn Serializer<T>,
) -> Result<(u64, u32)> {
    let mut writer = BlockWriter::new(manager, max_blocks);
    ObjectHeader::new(key)
        .write_to(&mut writer)
        .and_then(|()| serializer.serialize(value, &mut writer))
        .and_then(|()| writer.flush())
        .map_err(|e| stream_error(e, key))?;
    Ok(writer.finish())
}
