//! Common types and utilities shared across spillcache.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration constants and [`BufferConfig`]
//! - Error types
//! - Identifiers ([`BlockId`], [`ObjectKey`])
//! - The write-permit [`Semaphore`]

pub mod config;
pub mod error;
mod block_id;
mod object_key;
mod semaphore;

pub use block_id::BlockId;
pub use config::{ArenaAllocation, BufferConfig};
pub use error::{Error, Result};
pub use object_key::{GroupId, ObjectId, ObjectKey};
pub use semaphore::{Permits, Semaphore};
