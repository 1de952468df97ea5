//! Offset reconciliation.
//!
//! The leader of a segment probes each member with its committed
//! high-water mark. A member that answers `Behind` gets the missing suffix
//! replayed in batches; one that answers `Diverged` holds entries the leader
//! never committed and is only reported. Offsets a node reports about
//! itself through `Synchronize` are hints: every replay starts from what
//! the leader's store says, never from further back than the hint.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{MembershipEvent, MembershipTracker, QuorumSnapshot};
use crate::reply::ReplyRouter;
use crate::transport::Transport;
use lexlog_codec::LexKey;
use lexlog_protocol::{
    CheckSegmentOffset, CheckSpaceOffset, Entry, Envelope, Message, MessageKind, Nack, NackReason, NodeId,
    Replay, Reply, SequenceRange, TimestampWindow,
};
use lexlog_storage::{LogStore, SegmentBounds, StorageResult};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Answer to an offset probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetCheck {
    /// The node persisted exactly the probed offset.
    InSync,
    /// The node is behind; carries its own offset.
    Behind(LexKey),
    /// The node is ahead of the leader; carries its own offset.
    Diverged(LexKey),
}

impl OffsetCheck {
    /// Compares a node's own offset with the probed one.
    pub fn compare(own: LexKey, probed: &LexKey) -> Self {
        match own.cmp(probed) {
            Ordering::Equal => OffsetCheck::InSync,
            Ordering::Less => OffsetCheck::Behind(own),
            Ordering::Greater => OffsetCheck::Diverged(own),
        }
    }

    /// Reads a probe answer from a reply; `None` if the reply is not one.
    pub fn from_reply(reply: &Reply) -> Option<Self> {
        match reply {
            Reply::Ack(_) => Some(OffsetCheck::InSync),
            Reply::Nack(Nack {
                reason: NackReason::Behind,
                offset,
                ..
            }) => Some(OffsetCheck::Behind(offset.clone().unwrap_or_else(LexKey::empty))),
            Reply::Nack(Nack {
                reason: NackReason::Diverged,
                offset,
                ..
            }) => Some(OffsetCheck::Diverged(offset.clone().unwrap_or_else(LexKey::empty))),
            _ => None,
        }
    }

    /// Turns the answer into the reply for `envelope`.
    pub fn into_reply(self, envelope: &Envelope, node: NodeId) -> Reply {
        match self {
            OffsetCheck::InSync => envelope.ack(node),
            OffsetCheck::Behind(own) => envelope.nack_at(node, NackReason::Behind, own),
            OffsetCheck::Diverged(own) => envelope.nack_at(node, NackReason::Diverged, own),
        }
    }
}

/// Answers a segment offset probe from the local store.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn answer_segment_offset(
    store: &dyn LogStore,
    space: &str,
    segment: &str,
    probed: &LexKey,
) -> StorageResult<OffsetCheck> {
    Ok(OffsetCheck::compare(store.persisted_offset(space, segment)?, probed))
}

/// Answers a space offset probe from the local store.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn answer_space_offset(store: &dyn LogStore, space: &str, probed: &LexKey) -> StorageResult<OffsetCheck> {
    Ok(OffsetCheck::compare(store.persisted_space_offset(space)?, probed))
}

/// A replica found ahead of its leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// The diverging node.
    pub node: NodeId,
    /// Space name.
    pub space: String,
    /// Segment name, when the probe was per segment.
    pub segment: Option<String>,
    /// Leader's committed offset.
    pub leader: LexKey,
    /// Offset the node reported.
    pub replica: LexKey,
}

impl From<Divergence> for ClusterError {
    fn from(d: Divergence) -> Self {
        ClusterError::OffsetDivergence {
            node: d.node,
            space: d.space,
            segment: d.segment,
            leader: d.leader,
            replica: d.replica,
        }
    }
}

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Segment checks that found the member in sync.
    pub in_sync: usize,
    /// Entries replayed.
    pub replayed: usize,
    /// Segment checks that found a divergence.
    pub diverged: usize,
    /// Segment checks that failed.
    pub failed: usize,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.in_sync += other.in_sync;
        self.replayed += other.replayed;
        self.diverged += other.diverged;
        self.failed += other.failed;
    }

    fn absorb(&mut self, result: ClusterResult<ReconcileReport>) {
        match result {
            Ok(report) => self.merge(report),
            Err(ClusterError::OffsetDivergence { .. }) => self.diverged += 1,
            Err(err) => {
                warn!(error = %err, "segment reconciliation failed");
                self.failed += 1;
            }
        }
    }
}

enum ReplayAck {
    Applied(usize),
    Behind(Option<LexKey>),
}

/// Detects and repairs replicas whose offsets lag the leader's.
pub struct Reconciler {
    config: ClusterConfig,
    local: NodeId,
    store: Arc<dyn LogStore>,
    membership: Arc<MembershipTracker>,
    transport: Arc<dyn Transport>,
    router: ReplyRouter,
    divergences: Mutex<VecDeque<Divergence>>,
}

impl Reconciler {
    /// Creates a reconciler.
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
            divergences: Mutex::new(VecDeque::new()),
        }
    }

    /// Answers a segment offset probe sent to this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn answer_check_segment_offset(&self, space: &str, segment: &str, offset: &LexKey) -> ClusterResult<OffsetCheck> {
        Ok(answer_segment_offset(self.store.as_ref(), space, segment, offset)?)
    }

    /// Answers a space offset probe sent to this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn answer_check_space_offset(&self, space: &str, offset: &LexKey) -> ClusterResult<OffsetCheck> {
        Ok(answer_space_offset(self.store.as_ref(), space, offset)?)
    }

    /// Asks `node` how its copy of a segment compares to `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Unresponsive`] once retries are exhausted and
    /// [`ClusterError::Refused`] for any other NACK.
    pub async fn check_segment_offset(
        &self,
        node: NodeId,
        space: &str,
        segment: &str,
        offset: LexKey,
    ) -> ClusterResult<OffsetCheck> {
        let message = Message::CheckSegmentOffset(CheckSegmentOffset {
            space: space.to_string(),
            segment: segment.to_string(),
            offset,
        });
        self.probe(node, message).await
    }

    /// Asks `node` how its copy of a space compares to `offset`.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::check_segment_offset`].
    pub async fn check_space_offset(&self, node: NodeId, space: &str, offset: LexKey) -> ClusterResult<OffsetCheck> {
        let message = Message::CheckSpaceOffset(CheckSpaceOffset {
            space: space.to_string(),
            offset,
        });
        self.probe(node, message).await
    }

    /// Probes one member for one segment and repairs what can be repaired.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::OffsetDivergence`] if the member is ahead,
    /// or the probe or replay error.
    pub async fn catch_up_segment(&self, node: NodeId, space: &str, segment: &str) -> ClusterResult<ReconcileReport> {
        let leader = self.store.persisted_offset(space, segment)?;
        let mut report = ReconcileReport::default();
        match self.check_segment_offset(node, space, segment, leader.clone()).await? {
            OffsetCheck::InSync => report.in_sync += 1,
            OffsetCheck::Behind(replica) => {
                let after = sequence_of(&replica).unwrap_or(0);
                let through = self.store.last_sequence(space, segment)?;
                info!(space, segment, %node, after, through, "member is behind, replaying");
                report.replayed += self.replay_segment(node, space, segment, after, through).await?;
            }
            OffsetCheck::Diverged(replica) => {
                return Err(self.diverged(Divergence {
                    node,
                    space: space.to_string(),
                    segment: Some(segment.to_string()),
                    leader,
                    replica,
                }));
            }
        }
        Ok(report)
    }

    /// Replays the entries of a segment in `(after, through]` to `node`.
    ///
    /// Returns the number of entries the node accepted. If the node turns
    /// out to be missing earlier entries, replay restarts from the offset
    /// it reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the node keeps refusing.
    pub async fn replay_segment(
        &self,
        node: NodeId,
        space: &str,
        segment: &str,
        after: u64,
        through: u64,
    ) -> ClusterResult<usize> {
        let batch_size = self.config.replay_batch_size.max(1);
        let mut next = after + 1;
        let mut applied = 0;
        let mut restarts = 0;
        while next <= through {
            let batch = self.store.read_segment(
                space,
                segment,
                &SegmentBounds::Sequences(SequenceRange::between(next, through)),
                TimestampWindow::unbounded(),
                batch_size,
            )?;
            let Some(last) = batch.last().map(|e| e.sequence) else {
                break;
            };
            match self.send_replay(node, space, segment, batch).await? {
                ReplayAck::Applied(n) => {
                    applied += n;
                    next = last + 1;
                }
                ReplayAck::Behind(offset) => {
                    let resume = offset.as_ref().and_then(sequence_of).unwrap_or(0);
                    restarts += 1;
                    if resume + 1 >= next || restarts > self.config.retry.max_attempts {
                        return Err(ClusterError::Refused {
                            node,
                            route: MessageKind::Replay.route(),
                            reason: NackReason::Behind,
                        });
                    }
                    debug!(space, segment, %node, resume, "member is further behind, restarting replay");
                    next = resume + 1;
                }
            }
        }
        Ok(applied)
    }

    /// Handles a node's report of its per-space offsets.
    ///
    /// For every space holding a segment this node leads with `node` as a
    /// member, a reported offset below the leader's triggers a replay of
    /// the entries strictly after it. Segments the node turns out to be
    /// missing earlier entries of are caught up from their own offset;
    /// reported offsets above the leader's are probed per segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    pub async fn synchronize(
        &self,
        node: NodeId,
        offsets_by_space: &BTreeMap<String, LexKey>,
    ) -> ClusterResult<ReconcileReport> {
        let mut by_space: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for snapshot in self.led_segments()? {
            if snapshot.contains(&node) && node != self.local {
                by_space
                    .entry(snapshot.space.clone())
                    .or_default()
                    .push(snapshot.segment.clone());
            }
        }

        let mut report = ReconcileReport::default();
        for (space, segments) in by_space {
            let reported = offsets_by_space.get(&space).cloned().unwrap_or_else(LexKey::empty);
            let leader = self.store.persisted_space_offset(&space)?;
            match reported.cmp(&leader) {
                Ordering::Equal => report.in_sync += segments.len(),
                Ordering::Less => {
                    let replayed = self.replay_space(node, &space, &segments, &reported, &leader).await?;
                    report.merge(replayed);
                }
                Ordering::Greater => {
                    warn!(space = %space, %node, "node reports a space offset beyond the leader");
                    for segment in &segments {
                        report.absorb(self.catch_up_segment(node, &space, segment).await);
                    }
                }
            }
        }
        debug!(%node, ?report, "synchronize handled");
        Ok(report)
    }

    /// Probes every member of every segment this node leads.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let led = match self.led_segments() {
            Ok(led) => led,
            Err(err) => {
                warn!(error = %err, "cannot list led segments");
                report.failed += 1;
                return report;
            }
        };
        for snapshot in led {
            for peer in snapshot.peers(self.local) {
                report.absorb(self.catch_up_segment(peer, &snapshot.space, &snapshot.segment).await);
            }
        }
        report
    }

    /// Probes one node on every segment this node leads with it.
    pub async fn catch_up_node(&self, node: NodeId) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let led = match self.led_segments() {
            Ok(led) => led,
            Err(err) => {
                warn!(error = %err, "cannot list led segments");
                report.failed += 1;
                return report;
            }
        };
        for snapshot in led.iter().filter(|s| s.contains(&node) && node != self.local) {
            report.absorb(self.catch_up_segment(node, &snapshot.space, &snapshot.segment).await);
        }
        report
    }

    /// Divergences found so far, oldest first.
    pub fn divergences(&self) -> Vec<Divergence> {
        self.divergences.lock().iter().cloned().collect()
    }

    /// Runs periodic and membership-triggered reconciliation until
    /// `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut changes = self.membership.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    debug!(?report, "periodic reconciliation");
                }
                change = changes.recv() => match change {
                    Ok(MembershipEvent::NodeRejoined { node }) => {
                        let report = self.catch_up_node(node).await;
                        info!(%node, ?report, "caught up rejoined node");
                    }
                    Ok(MembershipEvent::QuorumChanged { .. }) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "membership events lagged, reconciling everything");
                        self.reconcile_once().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("reconciler stopped");
    }

    async fn probe(&self, node: NodeId, message: Message) -> ClusterResult<OffsetCheck> {
        let route = message.route();
        let reply = self.request(node, message).await?;
        OffsetCheck::from_reply(&reply).ok_or_else(|| refused(node, route, &reply))
    }

    async fn replay_space(
        &self,
        node: NodeId,
        space: &str,
        segments: &[String],
        after: &LexKey,
        until: &LexKey,
    ) -> ClusterResult<ReconcileReport> {
        let batch_size = self.config.replay_batch_size.max(1);
        let wanted: BTreeSet<&str> = segments.iter().map(String::as_str).collect();
        let mut skipped: BTreeSet<String> = BTreeSet::new();
        let mut fallback: BTreeSet<String> = BTreeSet::new();
        let mut report = ReconcileReport::default();
        let mut cursor = after.clone();

        loop {
            let page = self
                .store
                .read_space(space, &cursor, Some(until), TimestampWindow::unbounded(), batch_size)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.space_offset();
            let full = page.len() >= batch_size;

            let mut by_segment: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
            for entry in page {
                if wanted.contains(entry.segment.as_str()) && !skipped.contains(&entry.segment) {
                    by_segment.entry(entry.segment.clone()).or_default().push(entry);
                }
            }
            for (segment, entries) in by_segment {
                match self.send_replay(node, space, &segment, entries).await {
                    Ok(ReplayAck::Applied(n)) => report.replayed += n,
                    Ok(ReplayAck::Behind(_)) => {
                        debug!(space, segment = %segment, %node, "node lacks earlier entries, falling back");
                        skipped.insert(segment.clone());
                        fallback.insert(segment);
                    }
                    Err(err) => {
                        warn!(space, segment = %segment, %node, error = %err, "replay failed");
                        report.failed += 1;
                        skipped.insert(segment);
                    }
                }
            }
            if !full {
                break;
            }
        }

        for segment in fallback {
            report.absorb(self.catch_up_segment(node, space, &segment).await);
        }
        Ok(report)
    }

    async fn send_replay(
        &self,
        node: NodeId,
        space: &str,
        segment: &str,
        entries: Vec<Entry>,
    ) -> ClusterResult<ReplayAck> {
        let count = entries.len();
        let message = Message::Replay(Replay {
            space: space.to_string(),
            segment: segment.to_string(),
            entries,
        });
        let reply = self.request(node, message).await?;
        match &reply {
            Reply::Ack(_) | Reply::Response(_) => Ok(ReplayAck::Applied(count)),
            Reply::Nack(Nack {
                reason: NackReason::Behind,
                offset,
                ..
            }) => Ok(ReplayAck::Behind(offset.clone())),
            Reply::Nack(_) => Err(refused(node, MessageKind::Replay.route(), &reply)),
        }
    }

    /// Sends `message` until `node` gives an answer other than a timeout,
    /// with backoff between attempts.
    async fn request(&self, node: NodeId, message: Message) -> ClusterResult<Reply> {
        let route = message.route();
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let envelope = Envelope::new(self.local, message.clone());
            match self
                .router
                .request(self.transport.as_ref(), node, envelope, self.config.request_timeout)
                .await
            {
                Ok(Reply::Nack(Nack {
                    reason: NackReason::TimedOut | NackReason::Unavailable,
                    ..
                })) => debug!(%node, route, attempt, "no usable answer"),
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() => debug!(%node, route, attempt, error = %err, "request failed"),
                Err(err) => return Err(err),
            }
            attempt += 1;
            if attempt >= retry.max_attempts {
                return Err(ClusterError::Unresponsive { node, route });
            }
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        }
    }

    /// Snapshots of the segments with local data that this node leads.
    fn led_segments(&self) -> ClusterResult<Vec<Arc<QuorumSnapshot>>> {
        let mut led = Vec::new();
        for space in self.store.spaces()? {
            for segment in self.store.segments(&space)? {
                if let Some(snapshot) = self.membership.current_quorum(&space, &segment) {
                    if snapshot.leader == self.local {
                        led.push(snapshot);
                    }
                }
            }
        }
        Ok(led)
    }

    fn diverged(&self, divergence: Divergence) -> ClusterError {
        error!(
            node = %divergence.node,
            space = %divergence.space,
            segment = ?divergence.segment,
            leader = %divergence.leader,
            replica = %divergence.replica,
            "offset divergence"
        );
        let mut log = self.divergences.lock();
        log.push_back(divergence.clone());
        while log.len() > self.config.decision_history.max(1) {
            log.pop_front();
        }
        divergence.into()
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("local", &self.local)
            .field("divergences", &self.divergences.lock().len())
            .finish()
    }
}

/// Sequence encoded in a segment offset; `0` for the empty key.
fn sequence_of(offset: &LexKey) -> Option<u64> {
    if offset.is_empty() {
        return Some(0);
    }
    let mut reader = offset.reader();
    reader.text().ok()?;
    reader.u64().ok()
}

fn refused(node: NodeId, route: &'static str, reply: &Reply) -> ClusterError {
    let reason = match reply {
        Reply::Nack(nack) => nack.reason,
        _ => NackReason::Rejected,
    };
    ClusterError::Refused { node, route, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::membership::Assignment;
    use crate::participant::Participant;
    use crate::transport::MockTransport;
    use bytes::Bytes;
    use lexlog_protocol::{segment_offset, Transaction, Trx};
    use lexlog_storage::MemoryLogStore;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Replica {
        store: Arc<MemoryLogStore>,
        participant: Participant,
    }

    impl Replica {
        fn new() -> Arc<Self> {
            let store = Arc::new(MemoryLogStore::new());
            Arc::new(Self {
                participant: Participant::new(store.clone(), 64),
                store,
            })
        }

        fn answer(&self, node: NodeId, envelope: &Envelope) -> Option<Reply> {
            let store: &dyn LogStore = self.store.as_ref();
            match &envelope.message {
                Message::CheckSegmentOffset(c) => Some(
                    answer_segment_offset(store, &c.space, &c.segment, &c.offset)
                        .unwrap()
                        .into_reply(envelope, node),
                ),
                Message::CheckSpaceOffset(c) => Some(
                    answer_space_offset(store, &c.space, &c.offset)
                        .unwrap()
                        .into_reply(envelope, node),
                ),
                Message::Replay(r) => Some(
                    self.participant
                        .on_replay(&r.space, &r.segment, &r.entries)
                        .unwrap()
                        .into_reply(envelope, node),
                ),
                _ => None,
            }
        }
    }

    struct Harness {
        reconciler: Arc<Reconciler>,
        transport: Arc<MockTransport>,
        leader_store: Arc<MemoryLogStore>,
        membership: Arc<MembershipTracker>,
        n1: NodeId,
        n2: NodeId,
        replicas: HashMap<NodeId, Arc<Replica>>,
    }

    fn harness(retry: RetryConfig, answering: bool) -> Harness {
        let leader = NodeId::random();
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let config = ClusterConfig::new(leader)
            .with_request_timeout(Duration::from_millis(200))
            .with_replay_batch_size(2)
            .with_retry(retry);
        let membership = Arc::new(MembershipTracker::new(&config));
        membership.assign_default(Assignment::new(leader, [n1, n2]));

        let replicas: HashMap<NodeId, Arc<Replica>> =
            [(n1, Replica::new()), (n2, Replica::new())].into_iter().collect();
        let router = ReplyRouter::new();
        let transport = if answering {
            let replicas = replicas.clone();
            Arc::new(MockTransport::with_responder(router.clone(), move |target, envelope| {
                replicas.get(&target).and_then(|r| r.answer(target, envelope))
            }))
        } else {
            Arc::new(MockTransport::new())
        };
        let leader_store = Arc::new(MemoryLogStore::new());
        let reconciler = Arc::new(Reconciler::new(
            config,
            leader_store.clone(),
            membership.clone(),
            transport.clone(),
            router,
        ));
        Harness {
            reconciler,
            transport,
            leader_store,
            membership,
            n1,
            n2,
            replicas,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false)
    }

    fn entries(segment: &str, first: u64, count: usize, timestamp: i64) -> Vec<Entry> {
        let payloads = (0..count).map(|i| Bytes::from(vec![i as u8])).collect();
        Transaction::new(Trx::new(NodeId::random(), first), "orders", segment, first, timestamp, payloads).entries
    }

    fn replayed_sequences(transport: &MockTransport, node: NodeId) -> Vec<u64> {
        transport
            .published()
            .into_iter()
            .filter(|(target, _)| *target == node)
            .filter_map(|(_, envelope)| match envelope.message {
                Message::Replay(replay) => Some(replay.entries),
                _ => None,
            })
            .flatten()
            .map(|e| e.sequence)
            .collect()
    }

    #[test]
    fn offset_comparison() {
        let low = segment_offset("s1", 3);
        let high = segment_offset("s1", 5);

        assert_eq!(OffsetCheck::compare(high.clone(), &high), OffsetCheck::InSync);
        assert_eq!(OffsetCheck::compare(low.clone(), &high), OffsetCheck::Behind(low.clone()));
        assert_eq!(OffsetCheck::compare(high.clone(), &low), OffsetCheck::Diverged(high));
        assert_eq!(
            OffsetCheck::compare(LexKey::empty(), &low),
            OffsetCheck::Behind(LexKey::empty())
        );
    }

    #[test]
    fn sequence_is_read_back_from_offsets() {
        assert_eq!(sequence_of(&LexKey::empty()), Some(0));
        assert_eq!(sequence_of(&segment_offset("s1", 42)), Some(42));
    }

    #[tokio::test]
    async fn behind_member_gets_exact_suffix() {
        let h = harness(fast_retry(), true);
        let all = entries("s1", 1, 5, 10);
        h.leader_store.append("orders", "s1", &all).unwrap();
        h.replicas[&h.n1].store.append("orders", "s1", &all[..3]).unwrap();

        let report = h.reconciler.catch_up_segment(h.n1, "orders", "s1").await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(replayed_sequences(&h.transport, h.n1), vec![4, 5]);
        assert_eq!(h.replicas[&h.n1].store.last_sequence("orders", "s1").unwrap(), 5);
    }

    #[tokio::test]
    async fn member_ahead_is_reported_not_repaired() {
        let h = harness(fast_retry(), true);
        let all = entries("s1", 1, 6, 10);
        h.leader_store.append("orders", "s1", &all[..5]).unwrap();
        h.replicas[&h.n1].store.append("orders", "s1", &all).unwrap();

        let err = h.reconciler.catch_up_segment(h.n1, "orders", "s1").await.unwrap_err();

        assert!(matches!(err, ClusterError::OffsetDivergence { node, .. } if node == h.n1));
        assert_eq!(h.reconciler.divergences().len(), 1);
        assert!(replayed_sequences(&h.transport, h.n1).is_empty());
        assert_eq!(h.replicas[&h.n1].store.last_sequence("orders", "s1").unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_member_is_unresponsive_after_retries() {
        let h = harness(fast_retry(), false);
        h.leader_store.append("orders", "s1", &entries("s1", 1, 1, 10)).unwrap();

        let err = h.reconciler.catch_up_segment(h.n1, "orders", "s1").await.unwrap_err();

        assert!(matches!(
            err,
            ClusterError::Unresponsive { route: "check_segment_offset", .. }
        ));
        assert_eq!(h.transport.routes_to(h.n1).len(), 2);
    }

    #[tokio::test]
    async fn synchronize_replays_after_reported_offset() {
        let h = harness(fast_retry(), true);
        let all = entries("s1", 1, 5, 10);
        h.leader_store.append("orders", "s1", &all).unwrap();
        h.replicas[&h.n2].store.append("orders", "s1", &all[..3]).unwrap();

        let reported = BTreeMap::from([("orders".to_string(), all[2].space_offset())]);
        let report = h.reconciler.synchronize(h.n2, &reported).await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(replayed_sequences(&h.transport, h.n2), vec![4, 5]);
        assert_eq!(h.transport.routes_to(h.n2), vec!["node.replay"]);
        assert_eq!(h.replicas[&h.n2].store.last_sequence("orders", "s1").unwrap(), 5);
    }

    #[tokio::test]
    async fn synchronize_falls_back_per_segment() {
        let h = harness(fast_retry(), true);
        let s1 = entries("s1", 1, 3, 20);
        let mut s2 = entries("s2", 1, 2, 15);
        s2[1].timestamp = 25;
        h.leader_store.append("orders", "s1", &s1).unwrap();
        h.leader_store.append("orders", "s2", &s2).unwrap();
        h.replicas[&h.n2].store.append("orders", "s1", &s1).unwrap();

        let reported = BTreeMap::from([("orders".to_string(), s1[2].space_offset())]);
        let report = h.reconciler.synchronize(h.n2, &reported).await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(h.replicas[&h.n2].store.last_sequence("orders", "s2").unwrap(), 2);
        assert_eq!(h.replicas[&h.n2].store.last_sequence("orders", "s1").unwrap(), 3);
    }

    #[tokio::test]
    async fn reconcile_pass_covers_every_member() {
        let h = harness(fast_retry(), true);
        let all = entries("s1", 1, 3, 10);
        h.leader_store.append("orders", "s1", &all).unwrap();
        h.replicas[&h.n2].store.append("orders", "s1", &all).unwrap();

        let report = h.reconciler.reconcile_once().await;

        assert_eq!(
            report,
            ReconcileReport {
                in_sync: 1,
                replayed: 3,
                diverged: 0,
                failed: 0,
            }
        );
        assert_eq!(replayed_sequences(&h.transport, h.n1), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoined_node_is_caught_up_and_loop_stops_on_shutdown() {
        let h = harness(fast_retry(), true);
        h.leader_store.append("orders", "s1", &entries("s1", 1, 2, 10)).unwrap();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(h.reconciler.clone().run(shutdown));
        tokio::time::sleep(Duration::from_millis(1)).await;

        h.membership.on_heartbeat(h.n1);
        h.membership.on_shutdown(h.n1);
        h.membership.on_heartbeat(h.n1);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.replicas[&h.n1].store.last_sequence("orders", "s1").unwrap(), 2);

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
