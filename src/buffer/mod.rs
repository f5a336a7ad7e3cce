//! The buffer cache.
//!
//! Objects are serialized into memory blocks, tracked by location records,
//! and ordered for eviction by an access policy. Cold objects spill into
//! size-tiered storage and come back on access.
//!
//! # Components
//! - [`BufferCache`] - The cache itself
//! - [`LocationRecord`] - Where one object lives and who is using it
//! - [`LoadGuard`] - RAII guard for the per-object load lock
//! - [`Serializer`] - Conversion between objects and bytes
//! - [`CacheStats`] - Performance statistics
//! - [`replacer`] - Eviction ordering policies

mod background;
mod cache;
mod load_guard;
mod record;
pub mod replacer;
mod serializer;
mod stats;

pub use background::{SingleFlight, WorkerPool};
pub use cache::BufferCache;
pub use load_guard::LoadGuard;
pub use record::{blocks_for, size_index_for, Activity, Location, LocationRecord, RecordState};
pub use serializer::Serializer;
pub use stats::{CacheStats, StatsSnapshot};
