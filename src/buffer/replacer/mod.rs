//! Eviction ordering for memory-resident objects.
//!
//! - [`OrderingPolicy`] - turns an access history into an ordering value
//! - [`LrfuPolicy`] - least recently/frequently used (the default)
//! - [`LruPolicy`] - plain recency
//! - [`EvictionQueue`] - memory-resident records sorted by ordering value

mod eviction_queue;
mod lrfu;
mod lru;
mod policy;

pub use eviction_queue::{EvictionKey, EvictionQueue};
pub use lrfu::LrfuPolicy;
pub use lru::LruPolicy;
pub use policy::{AccessStats, OrderingPolicy};
