//! Data model shared by every node.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use lexlog_codec::LexKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a random node id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing uuid.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the raw uuid.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Identity of a single outbound request; echoed by its ACK or NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Creates a fresh request id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identity: `(id, originating node, per-node counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trx {
    /// Globally unique transaction id.
    pub id: Uuid,
    /// Node that opened the transaction.
    pub node: NodeId,
    /// Monotonic counter on the originating node.
    pub number: u64,
}

impl Trx {
    /// Creates a new identity with a random id.
    #[must_use]
    pub fn new(node: NodeId, number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            node,
            number,
        }
    }
}

impl fmt::Display for Trx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx:{}#{}", self.id, self.number)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Reserved and replicating, not yet agreed.
    Uncommitted,
    /// A quorum acknowledged the transaction.
    Committed,
    /// The commit decision has been broadcast.
    Finalized,
    /// The transaction was abandoned.
    RolledBack,
}

impl TransactionStatus {
    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Uncommitted => "uncommitted",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Finalized => "finalized",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Finalized | TransactionStatus::RolledBack
        )
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Uncommitted, TransactionStatus::Committed)
                | (TransactionStatus::Uncommitted, TransactionStatus::RolledBack)
                | (TransactionStatus::Committed, TransactionStatus::Finalized)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional timestamp bounds, inclusive on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampWindow {
    /// Lowest accepted timestamp.
    pub min: Option<i64>,
    /// Highest accepted timestamp.
    pub max: Option<i64>,
}

impl TimestampWindow {
    /// A window that accepts everything.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    /// A window bounded on both sides.
    #[must_use]
    pub const fn between(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Returns true if the timestamp falls inside the window.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.min.map_or(true, |min| timestamp >= min) && self.max.map_or(true, |max| timestamp <= max)
    }
}

/// Inclusive sequence bounds; `max == None` means open-ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    /// Lowest accepted sequence.
    pub min: u64,
    /// Highest accepted sequence.
    pub max: Option<u64>,
}

impl SequenceRange {
    /// Every sequence.
    #[must_use]
    pub const fn all() -> Self {
        Self { min: 0, max: None }
    }

    /// `[min, max]`.
    #[must_use]
    pub const fn between(min: u64, max: u64) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    /// Returns true if the sequence falls inside the range.
    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.min && self.max.map_or(true, |max| sequence <= max)
    }
}

/// A single immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Space the entry belongs to.
    pub space: String,
    /// Segment the entry belongs to.
    pub segment: String,
    /// Leader-assigned sequence number, starting at 1.
    pub sequence: u64,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
    /// Transaction that introduced the entry.
    pub trx: Trx,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Entry {
    /// Offset of this entry within its segment.
    pub fn segment_offset(&self) -> LexKey {
        segment_offset(&self.segment, self.sequence)
    }

    /// Offset of this entry within its space.
    pub fn space_offset(&self) -> LexKey {
        space_offset(self.timestamp, &self.segment, self.sequence)
    }
}

/// Builds the segment offset for `sequence`.
pub fn segment_offset(segment: &str, sequence: u64) -> LexKey {
    LexKey::builder().text(segment).u64(sequence).build()
}

/// Builds the space offset for an entry position.
pub fn space_offset(timestamp: i64, segment: &str, sequence: u64) -> LexKey {
    LexKey::builder()
        .i64(timestamp)
        .text(segment)
        .u64(sequence)
        .build()
}

/// A batch of entries appended atomically under quorum agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction identity.
    pub trx: Trx,
    /// Target space.
    pub space: String,
    /// Target segment.
    pub segment: String,
    /// First reserved sequence.
    pub first_sequence: u64,
    /// Last reserved sequence.
    pub last_sequence: u64,
    /// Entries in sequence order.
    pub entries: Vec<Entry>,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
}

impl Transaction {
    /// Builds a transaction that stamps `payloads` with consecutive sequences
    /// starting at `first_sequence`.
    ///
    /// `payloads` must not be empty.
    pub fn new(
        trx: Trx,
        space: impl Into<String>,
        segment: impl Into<String>,
        first_sequence: u64,
        timestamp: i64,
        payloads: Vec<Bytes>,
    ) -> Self {
        let space = space.into();
        let segment = segment.into();
        let entries: Vec<Entry> = payloads
            .into_iter()
            .zip(first_sequence..)
            .map(|(payload, sequence)| Entry {
                space: space.clone(),
                segment: segment.clone(),
                sequence,
                timestamp,
                trx,
                payload,
            })
            .collect();
        let last_sequence = first_sequence + entries.len().saturating_sub(1) as u64;

        Self {
            trx,
            space,
            segment,
            first_sequence,
            last_sequence,
            entries,
            timestamp,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the transaction carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Segment offset of the last entry.
    pub fn last_offset(&self) -> LexKey {
        segment_offset(&self.segment, self.last_sequence)
    }

    /// Checks the structural invariants of the record.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidTransaction`] if the range does not
    /// match the entries, the entries are out of order, or an entry names a
    /// different space, segment or transaction.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.entries.is_empty() {
            return Err(ProtocolError::InvalidTransaction(
                "transaction has no entries".into(),
            ));
        }
        if self.first_sequence == 0 || self.last_sequence < self.first_sequence {
            return Err(ProtocolError::InvalidTransaction(format!(
                "invalid range [{}, {}]",
                self.first_sequence, self.last_sequence
            )));
        }
        let span = self.last_sequence - self.first_sequence + 1;
        if span != self.entries.len() as u64 {
            return Err(ProtocolError::InvalidTransaction(format!(
                "range [{}, {}] does not match {} entries",
                self.first_sequence,
                self.last_sequence,
                self.entries.len()
            )));
        }
        for (entry, expected) in self.entries.iter().zip(self.first_sequence..) {
            if entry.sequence != expected {
                return Err(ProtocolError::InvalidTransaction(format!(
                    "entry sequence {} where {} was expected",
                    entry.sequence, expected
                )));
            }
            if entry.space != self.space || entry.segment != self.segment || entry.trx != self.trx {
                return Err(ProtocolError::InvalidTransaction(format!(
                    "entry {} does not belong to {}/{}",
                    entry.sequence, self.space, self.segment
                )));
            }
        }
        Ok(())
    }
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![i as u8])).collect()
    }

    #[test]
    fn transaction_reserves_contiguous_range() {
        let trx = Trx::new(NodeId::random(), 1);
        let tx = Transaction::new(trx, "orders", "s1", 10, 1_000, payloads(3));

        assert_eq!(tx.first_sequence, 10);
        assert_eq!(tx.last_sequence, 12);
        assert_eq!(tx.len(), 3);
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn validate_rejects_range_mismatch() {
        let trx = Trx::new(NodeId::random(), 1);
        let mut tx = Transaction::new(trx, "orders", "s1", 1, 1_000, payloads(2));
        tx.last_sequence = 5;

        assert!(matches!(
            tx.validate(),
            Err(ProtocolError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn validate_rejects_foreign_entry() {
        let trx = Trx::new(NodeId::random(), 1);
        let mut tx = Transaction::new(trx, "orders", "s1", 1, 1_000, payloads(2));
        tx.entries[1].segment = "s2".into();

        assert!(tx.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_transaction() {
        let trx = Trx::new(NodeId::random(), 1);
        let tx = Transaction::new(trx, "orders", "s1", 1, 1_000, Vec::new());
        assert!(tx.validate().is_err());
    }

    #[test]
    fn status_transitions() {
        use TransactionStatus::*;

        assert!(Uncommitted.can_transition_to(Committed));
        assert!(Uncommitted.can_transition_to(RolledBack));
        assert!(Committed.can_transition_to(Finalized));
        assert!(!Uncommitted.can_transition_to(Finalized));
        assert!(!Finalized.can_transition_to(RolledBack));
        assert!(!RolledBack.can_transition_to(Committed));

        assert!(Finalized.is_terminal());
        assert!(RolledBack.is_terminal());
        assert!(!Committed.is_terminal());
    }

    #[test]
    fn space_offset_follows_timestamp_then_sequence() {
        let a = space_offset(100, "s1", 5);
        let b = space_offset(100, "s1", 6);
        let c = space_offset(101, "s0", 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn windows_and_ranges() {
        let window = TimestampWindow::between(10, 20);
        assert!(window.contains(10));
        assert!(window.contains(20));
        assert!(!window.contains(21));
        assert!(TimestampWindow::unbounded().contains(i64::MIN));

        let range = SequenceRange::between(3, 4);
        assert!(range.contains(3));
        assert!(!range.contains(5));
        assert!(SequenceRange::all().contains(u64::MAX));
    }
}
