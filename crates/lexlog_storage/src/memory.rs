//! In-memory log store.

use crate::error::{StorageError, StorageResult};
use crate::store::{LogStore, SegmentBounds};
use lexlog_codec::LexKey;
use lexlog_protocol::{Entry, TimestampWindow};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Default)]
struct SpaceLog {
    /// Segment name to entries; the entry with sequence `n` sits at `n - 1`.
    segments: BTreeMap<String, Vec<Entry>>,
    /// Space offset to `(segment, position)`.
    index: BTreeMap<LexKey, (String, usize)>,
}

impl SpaceLog {
    fn entry_at(&self, segment: &str, position: usize) -> Option<&Entry> {
        self.segments.get(segment).and_then(|entries| entries.get(position))
    }
}

/// A log store that keeps every space in memory.
///
/// Suitable for unit tests, integration tests and nodes that do not need
/// to survive a restart.
///
/// # Thread Safety
///
/// All state sits behind a single `RwLock`; reads run concurrently.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    spaces: RwLock<BTreeMap<String, SpaceLog>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across every space.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spaces
            .read()
            .values()
            .flat_map(|log| log.segments.values())
            .map(Vec::len)
            .sum()
    }

    /// Returns true if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, space: &str, segment: &str, entries: &[Entry]) -> StorageResult<(u64, u64)> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.sequence, last.sequence),
            _ => {
                return Err(StorageError::EmptyBatch {
                    space: space.to_string(),
                    segment: segment.to_string(),
                })
            }
        };

        let mut spaces = self.spaces.write();
        let current = spaces
            .get(space)
            .and_then(|log| log.segments.get(segment))
            .map_or(0, |entries| entries.len() as u64);

        for (entry, expected) in entries.iter().zip(current + 1..) {
            if entry.space != space || entry.segment != segment {
                return Err(StorageError::WrongSegment {
                    sequence: entry.sequence,
                    expected: format!("{space}/{segment}"),
                    found: format!("{}/{}", entry.space, entry.segment),
                });
            }
            if entry.sequence != expected {
                return Err(StorageError::out_of_order(space, segment, expected, entry.sequence));
            }
        }

        let log = spaces.entry(space.to_string()).or_default();
        let stored = log.segments.entry(segment.to_string()).or_default();
        for entry in entries {
            log.index
                .insert(entry.space_offset(), (segment.to_string(), stored.len()));
            stored.push(entry.clone());
        }
        Ok((first, last))
    }

    fn read_segment(
        &self,
        space: &str,
        segment: &str,
        bounds: &SegmentBounds,
        window: TimestampWindow,
        limit: usize,
    ) -> StorageResult<Vec<Entry>> {
        let spaces = self.spaces.read();
        let Some(entries) = spaces.get(space).and_then(|log| log.segments.get(segment)) else {
            return Ok(Vec::new());
        };

        let start = match bounds {
            SegmentBounds::Sequences(range) => range.min.saturating_sub(1) as usize,
            SegmentBounds::Offsets { after, .. } => {
                entries.partition_point(|e| e.segment_offset() <= *after)
            }
        };

        Ok(entries
            .iter()
            .skip(start)
            .take_while(|e| match bounds {
                SegmentBounds::Sequences(range) => range.max.map_or(true, |max| e.sequence <= max),
                SegmentBounds::Offsets { until, .. } => {
                    until.as_ref().map_or(true, |until| e.segment_offset() <= *until)
                }
            })
            .filter(|e| window.contains(e.timestamp))
            .take(limit)
            .cloned()
            .collect())
    }

    fn read_space(
        &self,
        space: &str,
        after: &LexKey,
        until: Option<&LexKey>,
        window: TimestampWindow,
        limit: usize,
    ) -> StorageResult<Vec<Entry>> {
        let spaces = self.spaces.read();
        let Some(log) = spaces.get(space) else {
            return Ok(Vec::new());
        };
        if until.is_some_and(|until| until < after) {
            return Ok(Vec::new());
        }

        let upper = until.map_or(Bound::Unbounded, Bound::Included);
        Ok(log
            .index
            .range::<LexKey, _>((Bound::Excluded(after), upper))
            .filter_map(|(_, (segment, position))| log.entry_at(segment, *position))
            .filter(|e| window.contains(e.timestamp))
            .take(limit)
            .cloned()
            .collect())
    }

    fn persisted_offset(&self, space: &str, segment: &str) -> StorageResult<LexKey> {
        Ok(self
            .last_entry(space, segment)?
            .map(|e| e.segment_offset())
            .unwrap_or_default())
    }

    fn persisted_space_offset(&self, space: &str) -> StorageResult<LexKey> {
        Ok(self
            .spaces
            .read()
            .get(space)
            .and_then(|log| log.index.keys().next_back().cloned())
            .unwrap_or_default())
    }

    fn last_sequence(&self, space: &str, segment: &str) -> StorageResult<u64> {
        Ok(self
            .spaces
            .read()
            .get(space)
            .and_then(|log| log.segments.get(segment))
            .map_or(0, |entries| entries.len() as u64))
    }

    fn last_entry(&self, space: &str, segment: &str) -> StorageResult<Option<Entry>> {
        Ok(self
            .spaces
            .read()
            .get(space)
            .and_then(|log| log.segments.get(segment))
            .and_then(|entries| entries.last().cloned()))
    }

    fn spaces(&self) -> StorageResult<Vec<String>> {
        Ok(self.spaces.read().keys().cloned().collect())
    }

    fn segments(&self, space: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .spaces
            .read()
            .get(space)
            .map(|log| log.segments.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lexlog_protocol::{segment_offset, NodeId, SequenceRange, Transaction, Trx};
    use proptest::prelude::*;

    fn batch(segment: &str, first: u64, count: usize, timestamp: i64) -> Vec<Entry> {
        let payloads = (0..count)
            .map(|i| Bytes::from(format!("{segment}-{}", first + i as u64)))
            .collect();
        Transaction::new(
            Trx::new(NodeId::random(), first),
            "orders",
            segment,
            first,
            timestamp,
            payloads,
        )
        .entries
    }

    fn sequences(entries: &[Entry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn new_store_is_empty() {
        let store = MemoryLogStore::new();
        assert!(store.is_empty());
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 0);
        assert!(store.persisted_offset("orders", "s1").unwrap().is_empty());
        assert!(store.persisted_space_offset("orders").unwrap().is_empty());
        assert!(store.last_entry("orders", "s1").unwrap().is_none());
    }

    #[test]
    fn append_returns_range() {
        let store = MemoryLogStore::new();
        assert_eq!(store.append("orders", "s1", &batch("s1", 1, 3, 10)).unwrap(), (1, 3));
        assert_eq!(store.append("orders", "s1", &batch("s1", 4, 2, 11)).unwrap(), (4, 5));
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 5);
        assert_eq!(store.persisted_offset("orders", "s1").unwrap(), segment_offset("s1", 5));
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn append_rejects_gap_and_overlap() {
        let store = MemoryLogStore::new();
        store.append("orders", "s1", &batch("s1", 1, 2, 10)).unwrap();

        let gap = store.append("orders", "s1", &batch("s1", 4, 1, 10)).unwrap_err();
        assert_eq!(gap, StorageError::out_of_order("orders", "s1", 3, 4));

        let overlap = store.append("orders", "s1", &batch("s1", 2, 2, 10)).unwrap_err();
        assert_eq!(overlap, StorageError::out_of_order("orders", "s1", 3, 2));

        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 2);
    }

    #[test]
    fn append_rejects_empty_and_foreign_entries() {
        let store = MemoryLogStore::new();
        assert!(matches!(
            store.append("orders", "s1", &[]),
            Err(StorageError::EmptyBatch { .. })
        ));
        assert!(matches!(
            store.append("orders", "s1", &batch("s2", 1, 1, 10)),
            Err(StorageError::WrongSegment { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn read_by_sequence_and_window() {
        let store = MemoryLogStore::new();
        store.append("orders", "s1", &batch("s1", 1, 3, 10)).unwrap();
        store.append("orders", "s1", &batch("s1", 4, 3, 20)).unwrap();

        let all = store
            .read_segment("orders", "s1", &SegmentBounds::all(), TimestampWindow::unbounded(), 100)
            .unwrap();
        assert_eq!(sequences(&all), vec![1, 2, 3, 4, 5, 6]);

        let range = SegmentBounds::Sequences(SequenceRange::between(2, 4));
        let some = store
            .read_segment("orders", "s1", &range, TimestampWindow::unbounded(), 100)
            .unwrap();
        assert_eq!(sequences(&some), vec![2, 3, 4]);

        let late = store
            .read_segment("orders", "s1", &SegmentBounds::all(), TimestampWindow::between(15, 25), 2)
            .unwrap();
        assert_eq!(sequences(&late), vec![4, 5]);
    }

    #[test]
    fn read_by_offset_is_exclusive_of_lower_bound() {
        let store = MemoryLogStore::new();
        store.append("orders", "s1", &batch("s1", 1, 5, 10)).unwrap();

        let bounds = SegmentBounds::Offsets {
            after: segment_offset("s1", 2),
            until: Some(segment_offset("s1", 4)),
        };
        let read = store
            .read_segment("orders", "s1", &bounds, TimestampWindow::unbounded(), 100)
            .unwrap();
        assert_eq!(sequences(&read), vec![3, 4]);

        let from_start = store
            .read_segment(
                "orders",
                "s1",
                &SegmentBounds::after(LexKey::empty()),
                TimestampWindow::unbounded(),
                100,
            )
            .unwrap();
        assert_eq!(from_start.len(), 5);
    }

    #[test]
    fn space_reads_interleave_segments_by_timestamp() {
        let store = MemoryLogStore::new();
        store.append("orders", "a", &batch("a", 1, 1, 10)).unwrap();
        store.append("orders", "b", &batch("b", 1, 1, 5)).unwrap();
        store.append("orders", "a", &batch("a", 2, 1, 20)).unwrap();

        let read = store
            .read_space("orders", &LexKey::empty(), None, TimestampWindow::unbounded(), 10)
            .unwrap();
        let order: Vec<_> = read.iter().map(|e| (e.segment.as_str(), e.sequence)).collect();
        assert_eq!(order, vec![("b", 1), ("a", 1), ("a", 2)]);

        let tail = store
            .read_space("orders", &read[1].space_offset(), None, TimestampWindow::unbounded(), 10)
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 2);

        assert_eq!(
            store.persisted_space_offset("orders").unwrap(),
            read[2].space_offset()
        );
    }

    #[test]
    fn lists_spaces_and_segments() {
        let store = MemoryLogStore::new();
        store.append("orders", "b", &batch("b", 1, 1, 1)).unwrap();
        store.append("orders", "a", &batch("a", 1, 1, 1)).unwrap();

        assert_eq!(store.spaces().unwrap(), vec!["orders".to_string()]);
        assert_eq!(store.segments("orders").unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.segments("missing").unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn offset_reads_never_return_entries_at_or_before_cursor(
            len in 1usize..40,
            cursor in 0u64..45,
        ) {
            let store = MemoryLogStore::new();
            store.append("orders", "s1", &batch("s1", 1, len, 7)).unwrap();

            let after = if cursor == 0 { LexKey::empty() } else { segment_offset("s1", cursor) };
            let read = store
                .read_segment("orders", "s1", &SegmentBounds::after(after), TimestampWindow::unbounded(), usize::MAX)
                .unwrap();

            let expected: Vec<u64> = (cursor + 1..=len as u64).collect();
            prop_assert_eq!(sequences(&read), expected);
        }
    }
}
