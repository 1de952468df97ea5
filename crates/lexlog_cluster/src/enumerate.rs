//! Lazy, restartable traversal of spaces and segments.
//!
//! An [`Enumerator`] reads the store one page at a time, in offset order,
//! starting strictly after a cursor. The cursor of the last entry handed
//! out can be stored and passed back later to resume where it stopped.

use lexlog_codec::LexKey;
use lexlog_protocol::{segment_offset, Entry, EntryPage, SequenceRange, TimestampWindow};
use lexlog_storage::{LogStore, SegmentBounds, StorageResult};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Scope {
    Space,
    Segment { segment: String, until: Option<LexKey> },
}

/// Page-wise reader over a space or a segment.
pub struct Enumerator {
    store: Arc<dyn LogStore>,
    space: String,
    scope: Scope,
    window: TimestampWindow,
    page_size: usize,
    /// Offset of the last entry handed out.
    cursor: LexKey,
    /// Offset of the last entry read from the store.
    read_cursor: LexKey,
    buffer: VecDeque<Entry>,
    exhausted: bool,
}

impl Enumerator {
    /// Traverses a space by space offset, strictly after `after`.
    pub fn space(
        store: Arc<dyn LogStore>,
        space: impl Into<String>,
        window: TimestampWindow,
        after: LexKey,
        page_size: usize,
    ) -> Self {
        Self::with_scope(store, space.into(), Scope::Space, window, after, page_size)
    }

    /// Traverses a segment by segment offset, strictly after `after` and
    /// within `sequences`.
    pub fn segment(
        store: Arc<dyn LogStore>,
        space: impl Into<String>,
        segment: impl Into<String>,
        sequences: SequenceRange,
        window: TimestampWindow,
        after: LexKey,
        page_size: usize,
    ) -> Self {
        let segment = segment.into();
        let after = if sequences.min > 1 {
            after.max(segment_offset(&segment, sequences.min - 1))
        } else {
            after
        };
        let until = sequences.max.map(|max| segment_offset(&segment, max));
        Self::with_scope(store, space.into(), Scope::Segment { segment, until }, window, after, page_size)
    }

    fn with_scope(
        store: Arc<dyn LogStore>,
        space: String,
        scope: Scope,
        window: TimestampWindow,
        after: LexKey,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            space,
            scope,
            window,
            page_size: page_size.max(1),
            cursor: after.clone(),
            read_cursor: after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Offset of the last entry handed out, or the starting cursor.
    pub fn cursor(&self) -> &LexKey {
        &self.cursor
    }

    /// Returns the next page of entries.
    ///
    /// `has_more` is false once a read comes back short; an empty page with
    /// `has_more == false` marks the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn next_page(&mut self) -> StorageResult<EntryPage> {
        if self.buffer.is_empty() {
            self.fill()?;
        }
        let take = self.buffer.len().min(self.page_size);
        let entries: Vec<Entry> = self.buffer.drain(..take).collect();
        if let Some(last) = entries.last() {
            self.cursor = self.offset_of(last);
        }
        Ok(EntryPage {
            entries,
            cursor: self.cursor.clone(),
            has_more: !self.buffer.is_empty() || !self.exhausted,
        })
    }

    fn fill(&mut self) -> StorageResult<()> {
        if self.exhausted {
            return Ok(());
        }
        let page = match &self.scope {
            Scope::Space => self.store.read_space(
                &self.space,
                &self.read_cursor,
                None,
                self.window,
                self.page_size,
            )?,
            Scope::Segment { segment, until } => self.store.read_segment(
                &self.space,
                segment,
                &SegmentBounds::Offsets {
                    after: self.read_cursor.clone(),
                    until: until.clone(),
                },
                self.window,
                self.page_size,
            )?,
        };
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.read_cursor = self.offset_of(last);
        }
        self.buffer.extend(page);
        Ok(())
    }

    fn offset_of(&self, entry: &Entry) -> LexKey {
        match self.scope {
            Scope::Space => entry.space_offset(),
            Scope::Segment { .. } => entry.segment_offset(),
        }
    }
}

impl Iterator for Enumerator {
    type Item = StorageResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let entry = self.buffer.pop_front()?;
        self.cursor = self.offset_of(&entry);
        Some(Ok(entry))
    }
}

impl std::fmt::Debug for Enumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enumerator")
            .field("space", &self.space)
            .field("scope", &self.scope)
            .field("cursor", &self.cursor)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
