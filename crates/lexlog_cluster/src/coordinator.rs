//! Quorum commit coordinator.
//!
//! The leader of a segment drives every transaction on it:
//!
//! 1. reserve the next contiguous sequence range in the segment ledger
//! 2. send `Commit` to every other member of the current quorum
//! 3. aggregate votes until all members ACK, one NACKs, or the deadline
//!    passes with or without the threshold met
//! 4. on commit, append locally and broadcast `Finalize`; on rollback or
//!    a failed local append, release the range and tell the members that
//!    staged it
//!
//! Each segment has its own async mutex held for the whole round, so
//! reservation and vote aggregation are serialized per segment while
//! different segments proceed in parallel.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::ledger::{SegmentLedger, Vote};
use crate::membership::{MembershipEvent, MembershipTracker, QuorumSnapshot, SegmentKey};
use crate::reply::ReplyRouter;
use crate::transport::Transport;
use bytes::Bytes;
use lexlog_protocol::{
    now_millis, Commit, Envelope, Finalize, Message, NodeId, Rollback, Transaction,
    TransactionStatus, Trx,
};
use lexlog_storage::LogStore;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Transaction identity.
    pub trx: Trx,
    /// First assigned sequence.
    pub first_sequence: u64,
    /// Last assigned sequence.
    pub last_sequence: u64,
    /// Distinct ACKs from the final quorum, the leader included.
    pub acks: usize,
    /// ACKs that were required.
    pub threshold: usize,
    /// Members that acknowledged `Finalize`.
    pub finalized: BTreeSet<NodeId>,
}

enum RoundOutcome {
    Commit { acks: usize, threshold: usize },
    Rollback(ClusterError),
}

/// Drives transactions on the segments this node leads.
pub struct Coordinator {
    config: ClusterConfig,
    local: NodeId,
    store: Arc<dyn LogStore>,
    membership: Arc<MembershipTracker>,
    transport: Arc<dyn Transport>,
    router: ReplyRouter,
    ledgers: Mutex<HashMap<SegmentKey, Arc<tokio::sync::Mutex<SegmentLedger>>>>,
    counter: AtomicU64,
}

impl Coordinator {
    /// Creates a coordinator.
    pub fn new(
        config: ClusterConfig,
        store: Arc<dyn LogStore>,
        membership: Arc<MembershipTracker>,
        transport: Arc<dyn Transport>,
        router: ReplyRouter,
    ) -> Self {
        Self {
            local: config.node_id,
            config,
            store,
            membership,
            transport,
            router,
            ledgers: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Appends `payloads` to a segment under quorum agreement.
    ///
    /// Returns only once the transaction is committed and locally applied.
    /// An unreachable quorum is retried with backoff, waking early on any
    /// membership change.
    ///
    /// # Errors
    ///
    /// Fails with [`ClusterError::NotLeader`] if another node leads the
    /// segment, [`ClusterError::RolledBack`] if a member vetoed,
    /// [`ClusterError::Timeout`] if the threshold was not met in time,
    /// [`ClusterError::QuorumUnreachable`] once retries are exhausted,
    /// [`ClusterError::ApplyFailed`] if the local append failed after the
    /// vote, and [`ClusterError::SequenceConflict`] on a reservation bug.
    pub async fn begin_and_replicate(
        &self,
        space: &str,
        segment: &str,
        payloads: Vec<Bytes>,
    ) -> ClusterResult<CommitReceipt> {
        if payloads.is_empty() {
            return Err(ClusterError::EmptyTransaction {
                space: space.to_string(),
                segment: segment.to_string(),
            });
        }

        let mut attempt = 0;
        loop {
            let mut changes = self.membership.subscribe();
            match self.replicate_once(space, segment, payloads.clone()).await {
                Err(err @ ClusterError::QuorumUnreachable { .. })
                    if attempt + 1 < self.config.retry.max_attempts =>
                {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(space, segment, attempt, ?delay, error = %err, "quorum unreachable, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = changes.recv() => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Replays the decision for `trx` to a node that asks for it.
    ///
    /// A finalized transaction is re-sent as `Finalize`, a rolled back one
    /// as `Rollback`. Returns the status the leader holds; `Uncommitted`
    /// or `Committed` mean the decision is still pending.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownTransaction`] if the leader has no
    /// record of the transaction.
    pub fn reconcile(
        &self,
        space: &str,
        segment: &str,
        trx: Trx,
        node: NodeId,
    ) -> ClusterResult<TransactionStatus> {
        let ledger = self.ledger(space, segment)?;
        let Ok(ledger) = ledger.try_lock() else {
            // A round is running on this segment; its outcome is not known yet.
            return Ok(TransactionStatus::Uncommitted);
        };
        let status = ledger
            .status(&trx.id)
            .ok_or(ClusterError::UnknownTransaction(trx.id))?;
        drop(ledger);

        let message = match status {
            TransactionStatus::Finalized => Message::Finalize(Finalize {
                trx,
                space: space.to_string(),
                segment: segment.to_string(),
            }),
            TransactionStatus::RolledBack => Message::Rollback(Rollback {
                trx,
                space: space.to_string(),
                segment: segment.to_string(),
            }),
            pending => return Ok(pending),
        };
        info!(space, segment, trx = %trx, %node, status = %status, "replaying decision");
        self.transport
            .publish(node, Envelope::new(self.local, message))?;
        Ok(status)
    }

    /// Status of a transaction this node opened, if still remembered.
    pub async fn status(&self, space: &str, segment: &str, trx: &Trx) -> Option<TransactionStatus> {
        let ledger = self.ledger(space, segment).ok()?;
        let ledger = ledger.lock().await;
        ledger.status(&trx.id)
    }

    async fn replicate_once(
        &self,
        space: &str,
        segment: &str,
        payloads: Vec<Bytes>,
    ) -> ClusterResult<CommitReceipt> {
        self.leader_quorum(space, segment)?;

        let ledger = self.ledger(space, segment)?;
        let mut ledger = ledger.lock().await;
        if let Some(last) = self.store.last_entry(space, segment)? {
            ledger.catch_up(last.sequence, last.timestamp);
        }

        let trx = Trx::new(self.local, self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let transaction = ledger.reserve(trx, now_millis(), payloads)?;
        debug!(
            space,
            segment,
            trx = %trx,
            first = transaction.first_sequence,
            last = transaction.last_sequence,
            "reserved range"
        );

        match self.commit_round(&mut ledger, &transaction).await {
            RoundOutcome::Commit { acks, threshold } => {
                if let Err(err) = self.store.append(space, segment, &transaction.entries) {
                    error!(space, segment, trx = %trx, error = %err, "transaction could not be applied, rolling back");
                    self.roll_back(&mut ledger, &transaction)?;
                    return Err(ClusterError::ApplyFailed { trx, source: err });
                }
                ledger.advance(&trx.id, TransactionStatus::Committed)?;
                let finalized = self.broadcast_finalize(&transaction).await;
                ledger.advance(&trx.id, TransactionStatus::Finalized)?;
                info!(
                    space,
                    segment,
                    trx = %trx,
                    first = transaction.first_sequence,
                    last = transaction.last_sequence,
                    acks,
                    threshold,
                    "transaction committed"
                );
                Ok(CommitReceipt {
                    trx,
                    first_sequence: transaction.first_sequence,
                    last_sequence: transaction.last_sequence,
                    acks,
                    threshold,
                    finalized,
                })
            }
            RoundOutcome::Rollback(err) => {
                self.roll_back(&mut ledger, &transaction)?;
                warn!(space, segment, trx = %trx, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    async fn commit_round(&self, ledger: &mut SegmentLedger, transaction: &Transaction) -> RoundOutcome {
        let space = transaction.space.as_str();
        let segment = transaction.segment.as_str();
        let id = transaction.trx.id;
        let mut changes = self.membership.subscribe();
        let mut changes_open = true;

        let Some(mut quorum) = self.membership.current_quorum(space, segment) else {
            return RoundOutcome::Rollback(self.unreachable(space, segment));
        };
        if quorum.contains(&self.local) {
            ledger.record_vote(&id, self.local, Vote::Ack);
        }

        let mut round = self.router.round();
        let mut sent = BTreeSet::new();
        self.send_commits(&mut round, &mut sent, &quorum, transaction);
        let deadline = Instant::now() + self.config.commit_timeout;

        loop {
            let Some(threshold) = self.config.quorum.threshold(quorum.len()) else {
                return RoundOutcome::Rollback(self.unreachable(space, segment));
            };
            let Some(tracked) = ledger.tracked(&id) else {
                return RoundOutcome::Rollback(ClusterError::UnknownTransaction(id));
            };
            if let Some((node, reason)) = tracked.veto_within(&quorum.members) {
                return RoundOutcome::Rollback(ClusterError::RolledBack {
                    trx: transaction.trx,
                    node,
                    reason,
                });
            }
            let acks = tracked.acks_within(&quorum.members);
            if acks == quorum.len() {
                return RoundOutcome::Commit { acks, threshold };
            }

            tokio::select! {
                reply = round.next(deadline) => match reply {
                    Some((node, reply)) => {
                        if !ledger.record_vote(&id, node, Vote::from_reply(&reply)) {
                            debug!(%node, trx = %transaction.trx, "vote arrived after decision");
                        }
                    }
                    None if acks >= threshold => return RoundOutcome::Commit { acks, threshold },
                    None => {
                        return RoundOutcome::Rollback(ClusterError::Timeout {
                            trx: transaction.trx,
                            acks,
                            threshold,
                        })
                    }
                },
                change = changes.recv(), if changes_open => match change {
                    Ok(MembershipEvent::QuorumChanged { snapshot, .. }) if snapshot.is_for(space, segment) => {
                        info!(
                            space,
                            segment,
                            version = snapshot.version,
                            members = snapshot.len(),
                            "quorum changed during commit round"
                        );
                        quorum = snapshot;
                        self.send_commits(&mut round, &mut sent, &quorum, transaction);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if let Some(snapshot) = self.membership.current_quorum(space, segment) {
                            quorum = snapshot;
                            self.send_commits(&mut round, &mut sent, &quorum, transaction);
                        }
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
            }
        }
    }

    fn send_commits(
        &self,
        round: &mut crate::reply::ReplyRound,
        sent: &mut BTreeSet<NodeId>,
        quorum: &QuorumSnapshot,
        transaction: &Transaction,
    ) {
        for peer in quorum.peers(self.local) {
            if !sent.insert(peer) {
                continue;
            }
            let envelope = Envelope::new(
                self.local,
                Message::Commit(Commit {
                    transaction: transaction.clone(),
                }),
            );
            if let Err(err) = round.send(self.transport.as_ref(), peer, envelope) {
                warn!(%peer, trx = %transaction.trx, error = %err, "commit request not sent");
            }
        }
    }

    async fn broadcast_finalize(&self, transaction: &Transaction) -> BTreeSet<NodeId> {
        let mut finalized = BTreeSet::new();
        let Some(quorum) = self
            .membership
            .current_quorum(&transaction.space, &transaction.segment)
        else {
            return finalized;
        };

        let mut round = self.router.round();
        for peer in quorum.peers(self.local) {
            let envelope = Envelope::new(
                self.local,
                Message::Finalize(Finalize {
                    trx: transaction.trx,
                    space: transaction.space.clone(),
                    segment: transaction.segment.clone(),
                }),
            );
            if let Err(err) = round.send(self.transport.as_ref(), peer, envelope) {
                warn!(%peer, trx = %transaction.trx, error = %err, "finalize not sent");
            }
        }

        let deadline = Instant::now() + self.config.request_timeout;
        let mut answered = 0;
        while answered < round.len() {
            let Some((node, reply)) = round.next(deadline).await else {
                break;
            };
            answered += 1;
            if reply.is_positive() {
                finalized.insert(node);
            } else {
                debug!(%node, trx = %transaction.trx, "finalize refused, left to reconciliation");
            }
        }
        finalized
    }

    /// Releases the range of `transaction` and tells the members that
    /// staged it.
    fn roll_back(&self, ledger: &mut SegmentLedger, transaction: &Transaction) -> ClusterResult<()> {
        let id = transaction.trx.id;
        let ackers: Vec<NodeId> = ledger
            .tracked(&id)
            .map(|t| t.acks.iter().copied().filter(|n| *n != self.local).collect())
            .unwrap_or_default();
        ledger.advance(&id, TransactionStatus::RolledBack)?;
        self.broadcast_rollback(transaction, &ackers);
        Ok(())
    }

    fn broadcast_rollback(&self, transaction: &Transaction, ackers: &[NodeId]) {
        for node in ackers {
            let envelope = Envelope::new(
                self.local,
                Message::Rollback(Rollback {
                    trx: transaction.trx,
                    space: transaction.space.clone(),
                    segment: transaction.segment.clone(),
                }),
            );
            if let Err(err) = self.transport.publish(*node, envelope) {
                warn!(%node, trx = %transaction.trx, error = %err, "rollback not sent");
            }
        }
    }

    fn leader_quorum(&self, space: &str, segment: &str) -> ClusterResult<Arc<QuorumSnapshot>> {
        let quorum = self
            .membership
            .current_quorum(space, segment)
            .ok_or_else(|| ClusterError::NotLeader {
                space: space.to_string(),
                segment: segment.to_string(),
                leader: None,
            })?;
        if quorum.leader != self.local {
            return Err(ClusterError::NotLeader {
                space: space.to_string(),
                segment: segment.to_string(),
                leader: Some(quorum.leader),
            });
        }
        if self.config.quorum.threshold(quorum.len()).is_none() {
            return Err(self.unreachable(space, segment));
        }
        Ok(quorum)
    }

    fn ledger(&self, space: &str, segment: &str) -> ClusterResult<Arc<tokio::sync::Mutex<SegmentLedger>>> {
        let key = SegmentKey::new(space, segment);
        if let Some(ledger) = self.ledgers.lock().get(&key) {
            return Ok(Arc::clone(ledger));
        }

        let last = self.store.last_entry(space, segment)?;
        let (last_sequence, last_timestamp) = last.map_or((0, i64::MIN), |e| (e.sequence, e.timestamp));
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers.entry(key).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(SegmentLedger::new(
                space,
                segment,
                last_sequence,
                last_timestamp,
                self.config.decision_history,
            )))
        });
        Ok(Arc::clone(ledger))
    }

    fn unreachable(&self, space: &str, segment: &str) -> ClusterError {
        ClusterError::QuorumUnreachable {
            space: space.to_string(),
            segment: segment.to_string(),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local", &self.local)
            .field("segments", &self.ledgers.lock().len())
            .finish()
    }
}
