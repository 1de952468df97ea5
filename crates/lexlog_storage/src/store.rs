//! Log store trait definition.

use crate::error::StorageResult;
use lexlog_codec::LexKey;
use lexlog_protocol::{Entry, SequenceRange, TimestampWindow};

/// Which part of a segment a read covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBounds {
    /// Inclusive sequence bounds.
    Sequences(SequenceRange),
    /// Segment offsets strictly after `after`, up to and including `until`.
    Offsets {
        /// Exclusive lower bound; the empty key reads from the start.
        after: LexKey,
        /// Inclusive upper bound; `None` reads to the end.
        until: Option<LexKey>,
    },
}

impl SegmentBounds {
    /// Every entry of the segment.
    #[must_use]
    pub const fn all() -> Self {
        Self::Sequences(SequenceRange::all())
    }

    /// Entries strictly after `after`.
    #[must_use]
    pub fn after(after: LexKey) -> Self {
        Self::Offsets { after, until: None }
    }
}

/// The durable log engine behind a node.
///
/// A store holds spaces, each made of independently ordered segments. It
/// assigns nothing: sequences and timestamps arrive already stamped by the
/// segment leader.
///
/// # Invariants
///
/// - `append` only accepts a batch that continues the segment at
///   `last_sequence + 1`, so segments never contain gaps
/// - Reads return entries in ascending offset order
/// - `persisted_offset` of an empty segment is the empty key
pub trait LogStore: Send + Sync {
    /// Appends a contiguous batch and returns its `(first, last)` sequences.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is empty, names another segment, or
    /// does not start at `last_sequence + 1`.
    fn append(&self, space: &str, segment: &str, entries: &[Entry]) -> StorageResult<(u64, u64)>;

    /// Reads up to `limit` entries of a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_segment(
        &self,
        space: &str,
        segment: &str,
        bounds: &SegmentBounds,
        window: TimestampWindow,
        limit: usize,
    ) -> StorageResult<Vec<Entry>>;

    /// Reads up to `limit` entries of a space whose space offset is strictly
    /// after `after` and at most `until`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_space(
        &self,
        space: &str,
        after: &LexKey,
        until: Option<&LexKey>,
        window: TimestampWindow,
        limit: usize,
    ) -> StorageResult<Vec<Entry>>;

    /// Segment offset of the last persisted entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn persisted_offset(&self, space: &str, segment: &str) -> StorageResult<LexKey>;

    /// Space offset of the last persisted entry across every segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn persisted_space_offset(&self, space: &str) -> StorageResult<LexKey>;

    /// Last persisted sequence; `0` for an empty segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn last_sequence(&self, space: &str, segment: &str) -> StorageResult<u64>;

    /// The last persisted entry of a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn last_entry(&self, space: &str, segment: &str) -> StorageResult<Option<Entry>>;

    /// Names of every space holding at least one entry, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn spaces(&self) -> StorageResult<Vec<String>>;

    /// Names of the segments of a space, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn segments(&self, space: &str) -> StorageResult<Vec<String>>;
}
