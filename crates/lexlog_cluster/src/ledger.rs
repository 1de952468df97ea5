//! Per-segment transaction ledger.
//!
//! The ledger is the leader's record of every transaction it opened on one
//! segment: which sequences are reserved, which are committed, who voted
//! what, and how recent transactions were decided. It is plain data; the
//! coordinator serializes access to it per segment.

use crate::error::{ClusterError, ClusterResult};
use bytes::Bytes;
use lexlog_codec::LexKey;
use lexlog_protocol::{Envelope, NackReason, NodeId, Reply, Transaction, TransactionStatus, Trx};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::error;
use uuid::Uuid;

/// A member's answer to a commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    /// The member staged the transaction.
    Ack,
    /// The member refused.
    Nack {
        /// Why.
        reason: NackReason,
        /// The member's own offset, when relevant.
        offset: Option<LexKey>,
    },
}

impl Vote {
    /// Shorthand for a NACK without offset.
    pub fn nack(reason: NackReason) -> Self {
        Vote::Nack {
            reason,
            offset: None,
        }
    }

    /// Reads the vote carried by a reply.
    pub fn from_reply(reply: &Reply) -> Self {
        match reply {
            Reply::Ack(_) | Reply::Response(_) => Vote::Ack,
            Reply::Nack(nack) => Vote::Nack {
                reason: nack.reason,
                offset: nack.offset.clone(),
            },
        }
    }

    /// Turns the vote into the reply for `envelope`.
    pub fn into_reply(self, envelope: &Envelope, node: NodeId) -> Reply {
        match self {
            Vote::Ack => envelope.ack(node),
            Vote::Nack {
                reason,
                offset: Some(offset),
            } => envelope.nack_at(node, reason, offset),
            Vote::Nack { reason, offset: None } => envelope.nack(node, reason),
        }
    }
}

/// A transaction the leader is still driving.
#[derive(Debug, Clone)]
pub struct TrackedTransaction {
    /// The record.
    pub transaction: Transaction,
    /// Current status.
    pub status: TransactionStatus,
    /// Members that staged it.
    pub acks: BTreeSet<NodeId>,
    /// Members that refused it.
    pub nacks: BTreeMap<NodeId, NackReason>,
}

impl TrackedTransaction {
    /// Distinct ACKs from `members`.
    pub fn acks_within(&self, members: &BTreeSet<NodeId>) -> usize {
        self.acks.intersection(members).count()
    }

    /// The first NACK from one of `members`, if any.
    pub fn veto_within(&self, members: &BTreeSet<NodeId>) -> Option<(NodeId, NackReason)> {
        self.nacks
            .iter()
            .find(|(node, _)| members.contains(node))
            .map(|(node, reason)| (*node, *reason))
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Transaction identity.
    pub trx: Trx,
    /// `Finalized` or `RolledBack`.
    pub status: TransactionStatus,
    /// First reserved sequence.
    pub first_sequence: u64,
    /// Last reserved sequence.
    pub last_sequence: u64,
}

/// Reservation and decision state of one segment on its leader.
#[derive(Debug)]
pub struct SegmentLedger {
    space: String,
    segment: String,
    next_sequence: u64,
    committed_through: u64,
    last_timestamp: i64,
    committed: VecDeque<(u64, u64)>,
    active: HashMap<Uuid, TrackedTransaction>,
    decisions: HashMap<Uuid, Decision>,
    decided_order: VecDeque<Uuid>,
    history: usize,
}

impl SegmentLedger {
    /// Creates a ledger for a segment whose store ends at `last_sequence`.
    pub fn new(
        space: impl Into<String>,
        segment: impl Into<String>,
        last_sequence: u64,
        last_timestamp: i64,
        history: usize,
    ) -> Self {
        Self {
            space: space.into(),
            segment: segment.into(),
            next_sequence: last_sequence + 1,
            committed_through: last_sequence,
            last_timestamp,
            committed: VecDeque::new(),
            active: HashMap::new(),
            decisions: HashMap::new(),
            decided_order: VecDeque::new(),
            history: history.max(1),
        }
    }

    /// The sequence the next reservation starts at.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Last committed sequence.
    pub fn committed_through(&self) -> u64 {
        self.committed_through
    }

    /// Recently committed ranges, oldest first.
    pub fn committed_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.committed.iter().copied()
    }

    /// Timestamp for a new transaction: `now`, but never earlier than the
    /// last one handed out on this segment.
    pub fn stamp(&self, now: i64) -> i64 {
        now.max(self.last_timestamp)
    }

    /// Moves the ledger forward after entries arrived from elsewhere.
    pub fn catch_up(&mut self, last_sequence: u64, last_timestamp: i64) {
        if last_sequence > self.committed_through && self.active.is_empty() {
            self.committed_through = last_sequence;
            self.next_sequence = last_sequence + 1;
            self.last_timestamp = self.last_timestamp.max(last_timestamp);
        }
    }

    /// Reserves the next contiguous range and tracks a new uncommitted
    /// transaction for it.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::EmptyTransaction`] for no payloads and
    /// [`ClusterError::SequenceConflict`] if the range overlaps a committed
    /// or in-flight range.
    pub fn reserve(&mut self, trx: Trx, timestamp: i64, payloads: Vec<Bytes>) -> ClusterResult<Transaction> {
        if payloads.is_empty() {
            return Err(ClusterError::EmptyTransaction {
                space: self.space.clone(),
                segment: self.segment.clone(),
            });
        }

        let transaction = Transaction::new(
            trx,
            self.space.clone(),
            self.segment.clone(),
            self.next_sequence,
            self.stamp(timestamp),
            payloads,
        );
        let (first, last) = (transaction.first_sequence, transaction.last_sequence);
        let overlaps_active = self.active.values().any(|t| {
            t.transaction.first_sequence <= last && first <= t.transaction.last_sequence
        });
        if first <= self.committed_through || overlaps_active {
            return Err(self.conflict(first, last));
        }

        self.next_sequence = last + 1;
        self.last_timestamp = transaction.timestamp;
        self.active.insert(
            trx.id,
            TrackedTransaction {
                transaction: transaction.clone(),
                status: TransactionStatus::Uncommitted,
                acks: BTreeSet::new(),
                nacks: BTreeMap::new(),
            },
        );
        Ok(transaction)
    }

    /// Records a member's vote on an uncommitted transaction.
    ///
    /// Returns false if the transaction is no longer collecting votes.
    pub fn record_vote(&mut self, id: &Uuid, node: NodeId, vote: Vote) -> bool {
        match self.active.get_mut(id) {
            Some(tracked) if tracked.status == TransactionStatus::Uncommitted => {
                match vote {
                    Vote::Ack => {
                        tracked.nacks.remove(&node);
                        tracked.acks.insert(node);
                    }
                    Vote::Nack { reason, .. } => {
                        tracked.acks.remove(&node);
                        tracked.nacks.insert(node, reason);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// A transaction still being driven.
    pub fn tracked(&self, id: &Uuid) -> Option<&TrackedTransaction> {
        self.active.get(id)
    }

    /// How a recent transaction ended.
    pub fn decision(&self, id: &Uuid) -> Option<Decision> {
        self.decisions.get(id).copied()
    }

    /// Current status of an active or recently decided transaction.
    pub fn status(&self, id: &Uuid) -> Option<TransactionStatus> {
        self.active
            .get(id)
            .map(|t| t.status)
            .or_else(|| self.decisions.get(id).map(|d| d.status))
    }

    /// Number of transactions still being driven.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Moves a transaction to `next`.
    ///
    /// Repeating a transition that already happened is a no-op; terminal
    /// states never change.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidTransition`] for an illegal move,
    /// [`ClusterError::UnknownTransaction`] for an id the ledger never saw
    /// or already forgot, and [`ClusterError::SequenceConflict`] if a commit
    /// would overlap an already committed range.
    pub fn advance(&mut self, id: &Uuid, next: TransactionStatus) -> ClusterResult<TransactionStatus> {
        if let Some(decision) = self.decisions.get(id) {
            return if decision.status == next {
                Ok(next)
            } else {
                Err(ClusterError::InvalidTransition {
                    from: decision.status,
                    to: next,
                })
            };
        }

        let Some(tracked) = self.active.get(id) else {
            return Err(ClusterError::UnknownTransaction(*id));
        };
        let current = tracked.status;
        if current == next {
            return Ok(next);
        }
        if !current.can_transition_to(next) {
            return Err(ClusterError::InvalidTransition { from: current, to: next });
        }
        let (first, last) = (
            tracked.transaction.first_sequence,
            tracked.transaction.last_sequence,
        );

        match next {
            TransactionStatus::Committed => {
                if first <= self.committed_through {
                    return Err(self.conflict(first, last));
                }
                self.committed_through = last;
                self.committed.push_back((first, last));
                while self.committed.len() > self.history {
                    self.committed.pop_front();
                }
                if let Some(tracked) = self.active.get_mut(id) {
                    tracked.status = next;
                }
            }
            TransactionStatus::Finalized | TransactionStatus::RolledBack => {
                if next == TransactionStatus::RolledBack && self.next_sequence == last + 1 {
                    self.next_sequence = first;
                }
                if let Some(tracked) = self.active.remove(id) {
                    self.remember(Decision {
                        trx: tracked.transaction.trx,
                        status: next,
                        first_sequence: first,
                        last_sequence: last,
                    });
                }
            }
            TransactionStatus::Uncommitted => {}
        }
        Ok(next)
    }

    fn remember(&mut self, decision: Decision) {
        self.decisions.insert(decision.trx.id, decision);
        self.decided_order.push_back(decision.trx.id);
        while self.decided_order.len() > self.history {
            if let Some(old) = self.decided_order.pop_front() {
                self.decisions.remove(&old);
            }
        }
    }

    fn conflict(&self, first: u64, last: u64) -> ClusterError {
        error!(
            space = %self.space,
            segment = %self.segment,
            first,
            last,
            committed_through = self.committed_through,
            "reserved range overlaps committed sequences"
        );
        ClusterError::SequenceConflict {
            space: self.space.clone(),
            segment: self.segment.clone(),
            first,
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payloads(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(format!("e{i}"))).collect()
    }

    fn ledger(last: u64) -> SegmentLedger {
        SegmentLedger::new("orders", "s1", last, 0, 16)
    }

    fn trx() -> Trx {
        Trx::new(NodeId::random(), 1)
    }

    #[test]
    fn reserve_continues_after_store() {
        let mut ledger = ledger(9);
        let tx = ledger.reserve(trx(), 100, payloads(3)).unwrap();

        assert_eq!(tx.first_sequence, 10);
        assert_eq!(tx.last_sequence, 12);
        assert_eq!(ledger.next_sequence(), 13);
        assert_eq!(ledger.status(&tx.trx.id), Some(TransactionStatus::Uncommitted));
    }

    #[test]
    fn empty_reservation_is_refused() {
        let mut ledger = ledger(0);
        assert!(matches!(
            ledger.reserve(trx(), 1, Vec::new()),
            Err(ClusterError::EmptyTransaction { .. })
        ));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut ledger = ledger(0);
        let a = ledger.reserve(trx(), 500, payloads(1)).unwrap();
        ledger.advance(&a.trx.id, TransactionStatus::Committed).unwrap();
        let b = ledger.reserve(trx(), 200, payloads(1)).unwrap();

        assert_eq!(b.timestamp, 500);
    }

    #[test]
    fn finalize_twice_is_noop() {
        let mut ledger = ledger(0);
        let tx = ledger.reserve(trx(), 1, payloads(2)).unwrap();
        let id = tx.trx.id;

        ledger.advance(&id, TransactionStatus::Committed).unwrap();
        ledger.advance(&id, TransactionStatus::Committed).unwrap();
        ledger.advance(&id, TransactionStatus::Finalized).unwrap();
        assert_eq!(ledger.advance(&id, TransactionStatus::Finalized).unwrap(), TransactionStatus::Finalized);

        assert!(matches!(
            ledger.advance(&id, TransactionStatus::RolledBack),
            Err(ClusterError::InvalidTransition { .. })
        ));
        assert_eq!(ledger.status(&id), Some(TransactionStatus::Finalized));
        assert_eq!(ledger.committed_through(), 2);
    }

    #[test]
    fn committed_cannot_roll_back() {
        let mut ledger = ledger(0);
        let tx = ledger.reserve(trx(), 1, payloads(1)).unwrap();
        ledger.advance(&tx.trx.id, TransactionStatus::Committed).unwrap();

        assert!(matches!(
            ledger.advance(&tx.trx.id, TransactionStatus::RolledBack),
            Err(ClusterError::InvalidTransition {
                from: TransactionStatus::Committed,
                to: TransactionStatus::RolledBack
            })
        ));
    }

    #[test]
    fn rollback_releases_reservation() {
        let mut ledger = ledger(4);
        let tx = ledger.reserve(trx(), 1, payloads(3)).unwrap();
        ledger.advance(&tx.trx.id, TransactionStatus::RolledBack).unwrap();

        assert_eq!(ledger.next_sequence(), 5);
        let retry = ledger.reserve(trx(), 1, payloads(1)).unwrap();
        assert_eq!(retry.first_sequence, 5);
        assert_eq!(
            ledger.decision(&tx.trx.id).map(|d| d.status),
            Some(TransactionStatus::RolledBack)
        );
    }

    #[test]
    fn votes_stop_after_decision() {
        let mut ledger = ledger(0);
        let tx = ledger.reserve(trx(), 1, payloads(1)).unwrap();
        let node = NodeId::random();

        assert!(ledger.record_vote(&tx.trx.id, node, Vote::Ack));
        ledger.advance(&tx.trx.id, TransactionStatus::Committed).unwrap();
        assert!(!ledger.record_vote(&tx.trx.id, node, Vote::nack(NackReason::Conflict)));
        assert_eq!(ledger.tracked(&tx.trx.id).unwrap().acks.len(), 1);
    }

    #[test]
    fn veto_and_ack_counting_respect_members() {
        let mut ledger = ledger(0);
        let tx = ledger.reserve(trx(), 1, payloads(1)).unwrap();
        let (a, b, gone) = (NodeId::random(), NodeId::random(), NodeId::random());
        ledger.record_vote(&tx.trx.id, a, Vote::Ack);
        ledger.record_vote(&tx.trx.id, gone, Vote::nack(NackReason::Conflict));

        let members: BTreeSet<NodeId> = [a, b].into_iter().collect();
        let tracked = ledger.tracked(&tx.trx.id).unwrap();
        assert_eq!(tracked.acks_within(&members), 1);
        assert_eq!(tracked.veto_within(&members), None);
    }

    #[test]
    fn history_is_bounded() {
        let mut ledger = SegmentLedger::new("orders", "s1", 0, 0, 2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let tx = ledger.reserve(trx(), 1, payloads(1)).unwrap();
            ledger.advance(&tx.trx.id, TransactionStatus::Committed).unwrap();
            ledger.advance(&tx.trx.id, TransactionStatus::Finalized).unwrap();
            ids.push(tx.trx.id);
        }

        assert!(ledger.decision(&ids[0]).is_none());
        assert!(ledger.decision(&ids[2]).is_some());
        assert!(matches!(
            ledger.advance(&ids[0], TransactionStatus::Finalized),
            Err(ClusterError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn catch_up_moves_reservations_forward() {
        let mut ledger = ledger(3);
        ledger.catch_up(7, 50);
        let tx = ledger.reserve(trx(), 10, payloads(1)).unwrap();

        assert_eq!(tx.first_sequence, 8);
        assert_eq!(tx.timestamp, 50);
    }

    proptest! {
        #[test]
        fn committed_ranges_are_disjoint_and_gap_free(
            base in 0u64..100,
            ops in prop::collection::vec((1usize..6, any::<bool>()), 1..40),
        ) {
            let mut ledger = SegmentLedger::new("orders", "s1", base, 0, 1_000);
            let mut committed_len = 0u64;

            for (len, commit) in ops {
                let tx = ledger.reserve(trx(), 1, payloads(len)).unwrap();
                if commit {
                    ledger.advance(&tx.trx.id, TransactionStatus::Committed).unwrap();
                    ledger.advance(&tx.trx.id, TransactionStatus::Finalized).unwrap();
                    committed_len += len as u64;
                } else {
                    ledger.advance(&tx.trx.id, TransactionStatus::RolledBack).unwrap();
                }
            }

            let mut expected_first = base + 1;
            for (first, last) in ledger.committed_ranges() {
                prop_assert_eq!(first, expected_first);
                prop_assert!(last >= first);
                expected_first = last + 1;
            }
            prop_assert_eq!(ledger.committed_through(), base + committed_len);
            prop_assert_eq!(ledger.next_sequence(), base + committed_len + 1);
        }
    }
}
