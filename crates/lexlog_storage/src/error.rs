//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// An append was called with no entries.
    #[error("empty append to {space}/{segment}")]
    EmptyBatch {
        /// Target space.
        space: String,
        /// Target segment.
        segment: String,
    },

    /// An append did not continue the segment at `last_sequence + 1`.
    #[error("out of order append to {space}/{segment}: expected sequence {expected}, got {found}")]
    OutOfOrder {
        /// Target space.
        space: String,
        /// Target segment.
        segment: String,
        /// The sequence the segment expected next.
        expected: u64,
        /// The sequence that was offered.
        found: u64,
    },

    /// An entry names a different space or segment than the append target.
    #[error("entry {sequence} belongs to {found}, not {expected}")]
    WrongSegment {
        /// Offending entry sequence.
        sequence: u64,
        /// `space/segment` the append targeted.
        expected: String,
        /// `space/segment` the entry names.
        found: String,
    },

    /// The backing store is no longer usable.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn out_of_order(space: &str, segment: &str, expected: u64, found: u64) -> Self {
        Self::OutOfOrder {
            space: space.to_string(),
            segment: segment.to_string(),
            expected,
            found,
        }
    }
}
