//! RAII guard for the per-object load lock.

use std::sync::Arc;

use crate::buffer::record::LocationRecord;
use crate::common::ObjectKey;

/// Exclusive right to load one object.
///
/// Returned by [`BufferCache::lock_for_load`](crate::BufferCache::lock_for_load)
/// and required by [`BufferCache::get`](crate::BufferCache::get). At most one
/// guard exists per object; the lock is released when the guard is dropped.
///
/// # Example
/// ```ignore
/// if let Some(guard) = cache.lock_for_load(group, object) {
///     let value = cache.get(&guard, &serializer)?;
/// } // load lock released here
/// ```
#[must_use = "the load lock is released as soon as the guard is dropped"]
pub struct LoadGuard {
    record: Arc<LocationRecord>,
}

impl LoadGuard {
    /// Take the load lock on `record`, waiting for the current holder.
    pub(crate) fn acquire(record: Arc<LocationRecord>) -> Self {
        record.lock_for_load();
        Self { record }
    }

    #[inline]
    pub fn key(&self) -> ObjectKey {
        self.record.key()
    }

    #[inline]
    pub(crate) fn record(&self) -> &Arc<LocationRecord> {
        &self.record
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.record.unlock_for_load();
    }
}
