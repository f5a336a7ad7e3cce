//! Error types for spillcache.

use thiserror::Error;

use crate::common::ObjectKey;

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in spillcache.
///
/// Errors fall into four groups:
/// - capacity exceeded ([`Error::MaxBlocksExceeded`])
/// - transient size mismatch ([`Error::SizeChanged`]), which `add` only logs
/// - disk tier failures ([`Error::Io`], [`Error::Storage`], [`Error::Corrupted`])
/// - invariant violations, see [`Error::is_fatal`]
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a file store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An object needs more blocks than an inode (or the configured object
    /// size) can address.
    #[error(
        "max block number exceeded ({blocks} > {limit}); make the batch size smaller \
         or increase max_storage_object_size"
    )]
    MaxBlocksExceeded { blocks: usize, limit: usize },

    /// The object was re-added with a different block count.
    #[error("{key} changed size since first persistence: {expected_blocks} -> {actual_blocks} blocks")]
    SizeChanged {
        key: ObjectKey,
        expected_blocks: usize,
        actual_blocks: usize,
    },

    /// A disk tier failure while moving an object.
    #[error("storage error for {key}: {source}")]
    Storage {
        key: ObjectKey,
        #[source]
        source: std::io::Error,
    },

    /// Stored bytes do not match what was written.
    #[error("{key} is corrupted: {reason}")]
    Corrupted { key: ObjectKey, reason: String },

    /// The serializer failed to produce or consume an object.
    #[error("serialization failed for {key}: {source}")]
    Serialization {
        key: ObjectKey,
        #[source]
        source: std::io::Error,
    },

    /// The memory arena has no free block and eviction was not attempted.
    #[error("no free memory blocks")]
    OutOfBlocks,

    /// The inode arena is exhausted. Inodes outnumber data blocks, so this
    /// indicates an allocator bug.
    #[error("out of inodes")]
    OutOfInodes,

    /// Forced eviction could not free a block for a pending write.
    #[error("could not free space for pending write")]
    EvictionFailed,

    /// A location record was driven through a transition it does not allow.
    #[error("illegal transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: ObjectKey,
        from: &'static str,
        to: &'static str,
    },

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error signals a broken invariant rather than a
    /// recoverable runtime condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OutOfInodes | Error::EvictionFailed | Error::IllegalTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MaxBlocksExceeded {
            blocks: 20,
            limit: 10,
        };
        assert!(format!("{}", err).contains("batch size smaller"));

        let err = Error::OutOfInodes;
        assert_eq!(format!("{}", err), "out of inodes");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {} // Success
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::OutOfInodes.is_fatal());
        assert!(Error::EvictionFailed.is_fatal());
        assert!(!Error::OutOfBlocks.is_fatal());

        let err = Error::SizeChanged {
            key: ObjectKey::new(1, 2),
            expected_blocks: 1,
            actual_blocks: 2,
        };
        assert!(!err.is_fatal());
    }
}
