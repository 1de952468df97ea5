//! Replica side of the commit protocol.
//!
//! A participant stages the transactions its leaders send, applies them on
//! `Finalize`, discards them on `Rollback`, and accepts replayed suffixes
//! from the reconciler. Every write to the local store goes through one
//! lock so finalize and replay never interleave on a segment.

use crate::error::ClusterResult;
use crate::ledger::Vote;
use crate::membership::SegmentKey;
use lexlog_codec::LexKey;
use lexlog_protocol::{Entry, NackReason, SequenceRange, TimestampWindow, Transaction, TransactionStatus, Trx};
use lexlog_storage::{LogStore, SegmentBounds, StorageError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A transaction waiting for its leader's decision.
#[derive(Debug, Clone)]
pub struct StagedTransaction {
    /// The record.
    pub transaction: Transaction,
    /// When it was staged, or last reported as stale.
    pub staged_at: Instant,
}

#[derive(Debug)]
struct DecisionLog {
    statuses: HashMap<Uuid, TransactionStatus>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DecisionLog {
    fn new(capacity: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, id: &Uuid) -> Option<TransactionStatus> {
        self.statuses.get(id).copied()
    }

    fn record(&mut self, id: Uuid, status: TransactionStatus) {
        if self.statuses.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

#[derive(Debug)]
struct State {
    staged: HashMap<SegmentKey, BTreeMap<u64, StagedTransaction>>,
    decisions: DecisionLog,
}

/// Stages and applies transactions on a replica.
pub struct Participant {
    store: Arc<dyn LogStore>,
    state: Mutex<State>,
}

impl Participant {
    /// Creates a participant remembering up to `history` decisions.
    pub fn new(store: Arc<dyn LogStore>, history: usize) -> Self {
        Self {
            store,
            state: Mutex::new(State {
                staged: HashMap::new(),
                decisions: DecisionLog::new(history),
            }),
        }
    }

    /// Stages a transaction sent by its leader.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    pub fn on_commit(&self, transaction: &Transaction) -> ClusterResult<Vote> {
        if let Err(err) = transaction.validate() {
            warn!(trx = %transaction.trx, error = %err, "refusing malformed transaction");
            return Ok(Vote::nack(NackReason::Malformed));
        }
        let (space, segment) = (transaction.space.as_str(), transaction.segment.as_str());
        let (first, last) = (transaction.first_sequence, transaction.last_sequence);

        let mut state = self.state.lock();
        match state.decisions.get(&transaction.trx.id) {
            Some(TransactionStatus::Finalized) => return Ok(Vote::Ack),
            Some(TransactionStatus::RolledBack) => return Ok(Vote::nack(NackReason::Rejected)),
            _ => {}
        }

        let persisted = self.store.last_sequence(space, segment)?;
        if first <= persisted {
            let present = self.store.read_segment(
                space,
                segment,
                &SegmentBounds::Sequences(SequenceRange::between(first, first)),
                TimestampWindow::unbounded(),
                1,
            )?;
            if present.first().is_some_and(|e| e.trx.id == transaction.trx.id) {
                return Ok(Vote::Ack);
            }
            warn!(space, segment, first, persisted, trx = %transaction.trx, "commit overlaps persisted entries");
            return Ok(Vote::Nack {
                reason: NackReason::Conflict,
                offset: Some(self.store.persisted_offset(space, segment)?),
            });
        }

        let staged = state.staged.entry(SegmentKey::new(space, segment)).or_default();
        staged.retain(|_, s| {
            let keep = s.transaction.last_sequence < first || s.transaction.first_sequence > last;
            if !keep {
                debug!(space, segment, trx = %s.transaction.trx, "replacing abandoned staged transaction");
            }
            keep
        });
        staged.insert(
            first,
            StagedTransaction {
                transaction: transaction.clone(),
                staged_at: Instant::now(),
            },
        );
        debug!(space, segment, first, last, trx = %transaction.trx, "staged transaction");
        Ok(Vote::Ack)
    }

    /// Applies a staged transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails.
    pub fn on_finalize(&self, space: &str, segment: &str, trx: &Trx) -> ClusterResult<Vote> {
        let mut state = self.state.lock();
        if state.decisions.get(&trx.id) == Some(TransactionStatus::Finalized) {
            return Ok(Vote::Ack);
        }

        let key = SegmentKey::new(space, segment);
        let Some(staged) = find_staged(&state.staged, &key, &trx.id) else {
            debug!(space, segment, trx = %trx, "finalize for unknown transaction");
            return Ok(Vote::nack(NackReason::Unknown));
        };

        let persisted = self.store.last_sequence(space, segment)?;
        if staged.first_sequence > persisted + 1 {
            info!(space, segment, persisted, first = staged.first_sequence, "finalize leaves a gap");
            return Ok(self.behind(space, segment)?);
        }

        let suffix: Vec<Entry> = staged
            .entries
            .iter()
            .filter(|e| e.sequence > persisted)
            .cloned()
            .collect();
        if !suffix.is_empty() {
            self.store.append(space, segment, &suffix)?;
        }

        let first = staged.first_sequence;
        if let Some(segment_staged) = state.staged.get_mut(&key) {
            segment_staged.remove(&first);
        }
        state.decisions.record(trx.id, TransactionStatus::Finalized);
        debug!(space, segment, trx = %trx, applied = suffix.len(), "finalized transaction");
        Ok(Vote::Ack)
    }

    /// Discards a staged transaction. Always acknowledged.
    pub fn on_rollback(&self, space: &str, segment: &str, trx: &Trx) -> Vote {
        let mut state = self.state.lock();
        if state.decisions.get(&trx.id) == Some(TransactionStatus::Finalized) {
            warn!(space, segment, trx = %trx, "rollback for a finalized transaction ignored");
            return Vote::Ack;
        }
        if let Some(staged) = state.staged.get_mut(&SegmentKey::new(space, segment)) {
            staged.retain(|_, s| s.transaction.trx.id != trx.id);
        }
        state.decisions.record(trx.id, TransactionStatus::RolledBack);
        debug!(space, segment, trx = %trx, "rolled back staged transaction");
        Vote::Ack
    }

    /// Appends a replayed suffix of a segment.
    ///
    /// Entries at or below the local last sequence are skipped; a suffix
    /// that does not continue the segment is refused as `Behind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails for another reason.
    pub fn on_replay(&self, space: &str, segment: &str, entries: &[Entry]) -> ClusterResult<Vote> {
        let mut state = self.state.lock();
        let persisted = self.store.last_sequence(space, segment)?;
        let suffix: Vec<Entry> = entries
            .iter()
            .filter(|e| e.sequence > persisted)
            .cloned()
            .collect();
        if suffix.is_empty() {
            return Ok(Vote::Ack);
        }

        match self.store.append(space, segment, &suffix) {
            Ok(_) => {}
            Err(StorageError::OutOfOrder { expected, found, .. }) => {
                info!(space, segment, expected, found, "replay does not continue the segment");
                return self.behind(space, segment);
            }
            Err(err) => return Err(err.into()),
        }

        let applied_through = suffix.last().map_or(persisted, |e| e.sequence);
        let replayed_trx: HashMap<u64, Uuid> = suffix.iter().map(|e| (e.sequence, e.trx.id)).collect();
        let key = SegmentKey::new(space, segment);
        let State { staged, decisions } = &mut *state;
        if let Some(segment_staged) = staged.get_mut(&key) {
            segment_staged.retain(|first, s| {
                if s.transaction.last_sequence > applied_through {
                    return true;
                }
                let status = if replayed_trx.get(first) == Some(&s.transaction.trx.id) {
                    TransactionStatus::Finalized
                } else {
                    TransactionStatus::RolledBack
                };
                decisions.record(s.transaction.trx.id, status);
                false
            });
        }
        debug!(space, segment, applied = suffix.len(), through = applied_through, "applied replay");
        Ok(Vote::Ack)
    }

    /// Staged transactions older than `older_than`.
    ///
    /// Returned transactions have their age reset so the next call only
    /// reports them again after another full period.
    pub fn stale(&self, older_than: Duration) -> Vec<Transaction> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut stale = Vec::new();
        for staged in state.staged.values_mut().flat_map(|m| m.values_mut()) {
            if now.saturating_duration_since(staged.staged_at) >= older_than {
                staged.staged_at = now;
                stale.push(staged.transaction.clone());
            }
        }
        stale
    }

    /// Number of transactions staged on a segment.
    pub fn staged_count(&self, space: &str, segment: &str) -> usize {
        self.state
            .lock()
            .staged
            .get(&SegmentKey::new(space, segment))
            .map_or(0, BTreeMap::len)
    }

    /// Decision recorded for a transaction, if any.
    pub fn decision(&self, trx: &Trx) -> Option<TransactionStatus> {
        self.state.lock().decisions.get(&trx.id)
    }

    fn behind(&self, space: &str, segment: &str) -> ClusterResult<Vote> {
        let offset: LexKey = self.store.persisted_offset(space, segment)?;
        Ok(Vote::Nack {
            reason: NackReason::Behind,
            offset: Some(offset),
        })
    }
}

fn find_staged(
    staged: &HashMap<SegmentKey, BTreeMap<u64, StagedTransaction>>,
    key: &SegmentKey,
    id: &Uuid,
) -> Option<Transaction> {
    staged
        .get(key)?
        .values()
        .find(|s| s.transaction.trx.id == *id)
        .map(|s| s.transaction.clone())
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lexlog_protocol::{segment_offset, NodeId};
    use lexlog_storage::MemoryLogStore;

    fn tx(first: u64, count: usize) -> Transaction {
        let payloads = (0..count).map(|i| Bytes::from(format!("e{i}"))).collect();
        Transaction::new(Trx::new(NodeId::random(), first), "orders", "s1", first, 10, payloads)
    }

    fn participant() -> (Participant, Arc<MemoryLogStore>) {
        let store = Arc::new(MemoryLogStore::new());
        (Participant::new(store.clone(), 64), store)
    }

    #[test]
    fn stage_then_finalize_applies_entries() {
        let (p, store) = participant();
        let t = tx(1, 3);

        assert_eq!(p.on_commit(&t).unwrap(), Vote::Ack);
        assert_eq!(p.staged_count("orders", "s1"), 1);
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 0);

        assert_eq!(p.on_finalize("orders", "s1", &t.trx).unwrap(), Vote::Ack);
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 3);
        assert_eq!(p.staged_count("orders", "s1"), 0);

        assert_eq!(p.on_finalize("orders", "s1", &t.trx).unwrap(), Vote::Ack);
        assert_eq!(p.on_commit(&t).unwrap(), Vote::Ack);
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 3);
    }

    #[test]
    fn commit_below_persisted_conflicts() {
        let (p, store) = participant();
        let t = tx(1, 2);
        store.append("orders", "s1", &t.entries).unwrap();

        let other = tx(2, 1);
        assert_eq!(
            p.on_commit(&other).unwrap(),
            Vote::Nack {
                reason: NackReason::Conflict,
                offset: Some(segment_offset("s1", 2)),
            }
        );
        assert_eq!(p.on_commit(&t).unwrap(), Vote::Ack);
    }

    #[test]
    fn rolled_back_transaction_is_rejected() {
        let (p, _) = participant();
        let t = tx(1, 1);
        p.on_commit(&t).unwrap();

        assert_eq!(p.on_rollback("orders", "s1", &t.trx), Vote::Ack);
        assert_eq!(p.staged_count("orders", "s1"), 0);
        assert_eq!(p.on_commit(&t).unwrap(), Vote::nack(NackReason::Rejected));
        assert_eq!(p.decision(&t.trx), Some(TransactionStatus::RolledBack));
    }

    #[test]
    fn finalize_without_staging_is_unknown() {
        let (p, _) = participant();
        let t = tx(1, 1);
        assert_eq!(
            p.on_finalize("orders", "s1", &t.trx).unwrap(),
            Vote::nack(NackReason::Unknown)
        );
    }

    #[test]
    fn finalize_with_gap_reports_behind() {
        let (p, store) = participant();
        let t = tx(3, 1);
        p.on_commit(&t).unwrap();

        assert_eq!(
            p.on_finalize("orders", "s1", &t.trx).unwrap(),
            Vote::Nack {
                reason: NackReason::Behind,
                offset: Some(LexKey::empty()),
            }
        );
        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 0);
        assert_eq!(p.staged_count("orders", "s1"), 1);
    }

    #[test]
    fn malformed_commit_is_refused() {
        let (p, _) = participant();
        let mut t = tx(1, 2);
        t.last_sequence = 5;
        assert_eq!(p.on_commit(&t).unwrap(), Vote::nack(NackReason::Malformed));
    }

    #[test]
    fn new_attempt_replaces_abandoned_staging() {
        let (p, _) = participant();
        let abandoned = tx(1, 2);
        let retry = tx(1, 1);
        p.on_commit(&abandoned).unwrap();
        p.on_commit(&retry).unwrap();

        assert_eq!(p.staged_count("orders", "s1"), 1);
        assert_eq!(
            p.on_finalize("orders", "s1", &abandoned.trx).unwrap(),
            Vote::nack(NackReason::Unknown)
        );
        assert_eq!(p.on_finalize("orders", "s1", &retry.trx).unwrap(), Vote::Ack);
    }

    #[test]
    fn replay_appends_suffix_and_settles_staging() {
        let (p, store) = participant();
        let first = tx(1, 2);
        let second = tx(3, 2);
        store.append("orders", "s1", &first.entries).unwrap();
        p.on_commit(&second).unwrap();

        let mut replay = first.entries.clone();
        replay.extend(second.entries.iter().cloned());
        assert_eq!(p.on_replay("orders", "s1", &replay).unwrap(), Vote::Ack);

        assert_eq!(store.last_sequence("orders", "s1").unwrap(), 4);
        assert_eq!(p.staged_count("orders", "s1"), 0);
        assert_eq!(p.decision(&second.trx), Some(TransactionStatus::Finalized));
    }

    #[test]
    fn replay_with_gap_reports_behind() {
        let (p, store) = participant();
        let later = tx(5, 2);

        assert_eq!(
            p.on_replay("orders", "s1", &later.entries).unwrap(),
            Vote::Nack {
                reason: NackReason::Behind,
                offset: Some(LexKey::empty()),
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_staging_is_reported_once_per_period() {
        let (p, _) = participant();
        let t = tx(1, 1);
        p.on_commit(&t).unwrap();

        assert!(p.stale(Duration::from_secs(10)).is_empty());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(p.stale(Duration::from_secs(10)).len(), 1);
        assert!(p.stale(Duration::from_secs(10)).is_empty());
    }
}
