//! Request handlers.
//!
//! Handlers turn decoded requests into calls on the replication
//! components and their results into replies. They never block the inbox:
//! each request runs in its own task.

use crate::routing::{MessageHandler, RoutingTable};
use async_trait::async_trait;
use lexlog_cluster::{
    ClusterConfig, ClusterError, ClusterResult, Coordinator, Enumerator, MembershipTracker,
    Participant, Reconciler, ReplyRouter, Transport, Vote,
};
use lexlog_protocol::{
    ClusterStatus, Envelope, LexKey, Message, MessageKind, NackReason, NodeId, Produced,
    Reconcile, Reply, ResponseBody, TransactionStatus,
};
use lexlog_storage::LogStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a handler may touch.
pub struct NodeContext {
    /// Node configuration.
    pub config: ClusterConfig,
    /// Local log.
    pub store: Arc<dyn LogStore>,
    /// Liveness and quorums.
    pub membership: Arc<MembershipTracker>,
    /// Leader side of the commit protocol.
    pub coordinator: Arc<Coordinator>,
    /// Replica side of the commit protocol.
    pub participant: Arc<Participant>,
    /// Offset repair.
    pub reconciler: Arc<Reconciler>,
    /// Correlates replies with outstanding requests.
    pub router: ReplyRouter,
    /// Outbound side of the network.
    pub transport: Arc<dyn Transport>,
}

impl NodeContext {
    /// Wires the replication components around `store` and `transport`.
    pub fn new(config: ClusterConfig, store: Arc<dyn LogStore>, transport: Arc<dyn Transport>) -> Self {
        let membership = Arc::new(MembershipTracker::new(&config));
        let router = ReplyRouter::new();
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&membership),
            Arc::clone(&transport),
            router.clone(),
        ));
        let participant = Arc::new(Participant::new(Arc::clone(&store), config.decision_history));
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&membership),
            Arc::clone(&transport),
            router.clone(),
        ));
        Self {
            config,
            store,
            membership,
            coordinator,
            participant,
            reconciler,
            router,
            transport,
        }
    }

    /// The local node.
    pub fn local(&self) -> NodeId {
        self.config.node_id
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.config.node_id)
            .finish_non_exhaustive()
    }
}

/// Builds the route table of a node.
pub fn node_routes(context: Arc<NodeContext>) -> RoutingTable {
    let local = context.local();
    RoutingTable::new(local)
        .with_handler(
            &[
                MessageKind::Commit,
                MessageKind::Finalize,
                MessageKind::Rollback,
                MessageKind::Reconcile,
            ],
            Arc::new(TransactionHandler::new(Arc::clone(&context))),
        )
        .with_handler(
            &[MessageKind::Replay, MessageKind::Synchronize],
            Arc::new(ReplicationHandler::new(Arc::clone(&context))),
        )
        .with_handler(
            &[MessageKind::CheckSegmentOffset, MessageKind::CheckSpaceOffset],
            Arc::new(OffsetHandler::new(Arc::clone(&context))),
        )
        .with_handler(
            &[
                MessageKind::NodeHeartbeat,
                MessageKind::NodeShutdown,
                MessageKind::QuorumChanged,
            ],
            Arc::new(MembershipHandler::new(Arc::clone(&context))),
        )
        .with_handler(
            &[
                MessageKind::GetStatus,
                MessageKind::Peek,
                MessageKind::GetSpaces,
                MessageKind::GetSegments,
                MessageKind::ConsumeSpace,
                MessageKind::ConsumeSegment,
                MessageKind::EnumerateSpace,
                MessageKind::EnumerateSegment,
            ],
            Arc::new(QueryHandler::new(Arc::clone(&context))),
        )
        .with_handler(&[MessageKind::Produce], Arc::new(ProduceHandler::new(context)))
}

/// NACK reason a remote caller sees for a local error.
pub fn nack_reason(err: &ClusterError) -> NackReason {
    match err {
        ClusterError::NotLeader { .. } => NackReason::NotLeader,
        ClusterError::EmptyTransaction { .. }
        | ClusterError::MalformedPayload(_)
        | ClusterError::Protocol(_) => NackReason::Malformed,
        ClusterError::RolledBack { .. }
        | ClusterError::Timeout { .. }
        | ClusterError::QuorumUnreachable { .. }
        | ClusterError::ApplyFailed { .. }
        | ClusterError::SequenceConflict { .. } => NackReason::Rejected,
        ClusterError::UnknownTransaction(_) => NackReason::Unknown,
        ClusterError::OffsetDivergence { .. } => NackReason::Diverged,
        _ => NackReason::Unavailable,
    }
}

fn refuse(envelope: &Envelope, local: NodeId, err: &ClusterError) -> Reply {
    warn!(route = envelope.route(), sender = %envelope.sender, error = %err, "request failed");
    envelope.nack(local, nack_reason(err))
}

fn vote_reply(result: ClusterResult<Vote>, envelope: &Envelope, local: NodeId) -> Reply {
    match result {
        Ok(vote) => vote.into_reply(envelope, local),
        Err(err) => refuse(envelope, local, &err),
    }
}

fn misrouted(envelope: &Envelope, local: NodeId) -> Reply {
    warn!(route = envelope.route(), "message reached the wrong handler");
    envelope.nack(local, NackReason::Rejected)
}

/// Serves the replica side of the commit protocol and `Reconcile`.
pub struct TransactionHandler {
    context: Arc<NodeContext>,
}

impl TransactionHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }

    fn reconcile(&self, envelope: &Envelope, message: &Reconcile) -> ClusterResult<Vote> {
        let status = self.context.coordinator.reconcile(
            &message.space,
            &message.segment,
            message.trx,
            envelope.sender,
        );
        match status {
            Ok(TransactionStatus::Finalized | TransactionStatus::RolledBack) => Ok(Vote::Ack),
            Ok(_) => Ok(Vote::nack(NackReason::Unavailable)),
            Err(ClusterError::UnknownTransaction(_)) => Ok(Vote::nack(NackReason::Unknown)),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MessageHandler for TransactionHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let local = self.context.local();
        let participant = &self.context.participant;
        let result = match &envelope.message {
            Message::Commit(commit) => participant.on_commit(&commit.transaction),
            Message::Finalize(finalize) => {
                participant.on_finalize(&finalize.space, &finalize.segment, &finalize.trx)
            }
            Message::Rollback(rollback) => {
                Ok(participant.on_rollback(&rollback.space, &rollback.segment, &rollback.trx))
            }
            Message::Reconcile(reconcile) => self.reconcile(envelope, reconcile),
            _ => return Some(misrouted(envelope, local)),
        };
        Some(vote_reply(result, envelope, local))
    }
}

/// Serves `Replay` and `Synchronize`.
pub struct ReplicationHandler {
    context: Arc<NodeContext>,
}

impl ReplicationHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ReplicationHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let local = self.context.local();
        let result = match &envelope.message {
            Message::Replay(replay) => {
                self.context
                    .participant
                    .on_replay(&replay.space, &replay.segment, &replay.entries)
            }
            Message::Synchronize(sync) => self
                .context
                .reconciler
                .synchronize(envelope.sender, &sync.offsets_by_space)
                .await
                .map(|report| {
                    debug!(sender = %envelope.sender, ?report, "synchronized");
                    Vote::Ack
                }),
            _ => return Some(misrouted(envelope, local)),
        };
        Some(vote_reply(result, envelope, local))
    }
}

/// Answers offset probes from segment leaders.
pub struct OffsetHandler {
    context: Arc<NodeContext>,
}

impl OffsetHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for OffsetHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let local = self.context.local();
        let reconciler = &self.context.reconciler;
        let check = match &envelope.message {
            Message::CheckSegmentOffset(check) => {
                reconciler.answer_check_segment_offset(&check.space, &check.segment, &check.offset)
            }
            Message::CheckSpaceOffset(check) => reconciler.answer_check_space_offset(&check.space, &check.offset),
            _ => return Some(misrouted(envelope, local)),
        };
        Some(match check {
            Ok(check) => check.into_reply(envelope, local),
            Err(err) => refuse(envelope, local, &err),
        })
    }
}

/// Applies liveness events.
pub struct MembershipHandler {
    context: Arc<NodeContext>,
}

impl MembershipHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for MembershipHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let membership = &self.context.membership;
        match &envelope.message {
            Message::NodeHeartbeat(heartbeat) => {
                membership.on_heartbeat(heartbeat.node);
            }
            Message::NodeShutdown(shutdown) => {
                membership.on_shutdown(shutdown.node);
            }
            Message::QuorumChanged(change) => {
                debug!(
                    node = %change.node,
                    space = %change.space,
                    segment = %change.segment,
                    version = change.version,
                    "peer announced quorum change"
                );
                membership.observe_remote_change(change.node, change.members.contains(&change.node));
            }
            _ => {
                warn!(route = envelope.route(), "message reached the wrong handler");
            }
        }
        None
    }
}

/// Serves reads from the local store.
pub struct QueryHandler {
    context: Arc<NodeContext>,
}

impl QueryHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }

    fn query(&self, message: &Message) -> ClusterResult<Option<ResponseBody>> {
        let store = &self.context.store;
        let page_size = self.context.config.page_size;
        let body = match message {
            Message::GetStatus(_) => ResponseBody::Status(ClusterStatus {
                node_count: self.context.membership.live_nodes(),
            }),
            Message::Peek(peek) => ResponseBody::Entry(store.last_entry(&peek.space, &peek.segment)?),
            Message::GetSpaces(_) => ResponseBody::Names(store.spaces()?),
            Message::GetSegments(request) => ResponseBody::Names(store.segments(&request.space)?),
            Message::ConsumeSpace(request) => {
                let mut pages = Enumerator::space(
                    Arc::clone(store),
                    request.space.clone(),
                    request.window,
                    request.offset.clone(),
                    page_size,
                );
                ResponseBody::Entries(pages.next_page()?)
            }
            Message::EnumerateSpace(request) => {
                let mut pages = Enumerator::space(
                    Arc::clone(store),
                    request.space.clone(),
                    request.window,
                    request.offset.clone(),
                    page_size,
                );
                ResponseBody::Entries(pages.next_page()?)
            }
            Message::ConsumeSegment(request) => {
                let mut pages = Enumerator::segment(
                    Arc::clone(store),
                    request.space.clone(),
                    request.segment.clone(),
                    request.sequences,
                    request.window,
                    LexKey::empty(),
                    page_size,
                );
                ResponseBody::Entries(pages.next_page()?)
            }
            Message::EnumerateSegment(request) => {
                let mut pages = Enumerator::segment(
                    Arc::clone(store),
                    request.space.clone(),
                    request.segment.clone(),
                    request.sequences,
                    request.window,
                    request.offset.clone(),
                    page_size,
                );
                ResponseBody::Entries(pages.next_page()?)
            }
            _ => return Ok(None),
        };
        Ok(Some(body))
    }
}

#[async_trait]
impl MessageHandler for QueryHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let local = self.context.local();
        Some(match self.query(&envelope.message) {
            Ok(Some(body)) => envelope.respond(local, body),
            Ok(None) => misrouted(envelope, local),
            Err(err) => refuse(envelope, local, &err),
        })
    }
}

/// Accepts appends on the segments this node leads.
pub struct ProduceHandler {
    context: Arc<NodeContext>,
}

impl ProduceHandler {
    /// Creates the handler.
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ProduceHandler {
    async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
        let local = self.context.local();
        let Message::Produce(produce) = &envelope.message else {
            return Some(misrouted(envelope, local));
        };
        let result = self
            .context
            .coordinator
            .begin_and_replicate(&produce.space, &produce.segment, produce.entries.clone())
            .await;
        Some(match result {
            Ok(receipt) => envelope.respond(
                local,
                ResponseBody::Produced(Produced {
                    trx: receipt.trx,
                    first_sequence: receipt.first_sequence,
                    last_sequence: receipt.last_sequence,
                }),
            ),
            Err(err) => refuse(envelope, local, &err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lexlog_cluster::{Assignment, MockTransport};
    use lexlog_protocol::{
        segment_offset, CheckSegmentOffset, Commit, Finalize, GetStatus, NodeHeartbeat, Peek,
        Produce, Transaction, Trx,
    };
    use lexlog_storage::MemoryLogStore;

    fn context(local: NodeId, peers: &[NodeId]) -> Arc<NodeContext> {
        let config = ClusterConfig::new(local);
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
        let context = NodeContext::new(config, store, transport);
        context
            .membership
            .assign_default(Assignment::new(peers.first().copied().unwrap_or(local), peers.iter().copied()));
        Arc::new(context)
    }

    fn commit(leader: NodeId) -> Transaction {
        Transaction::new(
            Trx::new(leader, 1),
            "orders",
            "s1",
            1,
            10,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        )
    }

    #[tokio::test]
    async fn commit_and_finalize_reach_the_store() {
        let local = NodeId::random();
        let leader = NodeId::random();
        let context = context(local, &[leader, local]);
        let routes = node_routes(Arc::clone(&context));
        let transaction = commit(leader);

        let staged = Envelope::new(
            leader,
            Message::Commit(Commit {
                transaction: transaction.clone(),
            }),
        );
        assert!(routes.dispatch(&staged).await.unwrap().is_positive());
        assert_eq!(context.participant.staged_count("orders", "s1"), 1);

        let finalize = Envelope::new(
            leader,
            Message::Finalize(Finalize {
                trx: transaction.trx,
                space: "orders".into(),
                segment: "s1".into(),
            }),
        );
        assert!(routes.dispatch(&finalize).await.unwrap().is_positive());
        assert_eq!(context.store.last_sequence("orders", "s1").unwrap(), 2);

        let peek = Envelope::new(
            leader,
            Message::Peek(Peek {
                space: "orders".into(),
                segment: "s1".into(),
            }),
        );
        match routes.dispatch(&peek).await {
            Some(Reply::Response(response)) => match response.body {
                ResponseBody::Entry(Some(entry)) => assert_eq!(entry.sequence, 2),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn offset_probe_reports_behind() {
        let local = NodeId::random();
        let leader = NodeId::random();
        let context = context(local, &[leader, local]);
        let routes = node_routes(Arc::clone(&context));

        let probe = Envelope::new(
            leader,
            Message::CheckSegmentOffset(CheckSegmentOffset {
                space: "orders".into(),
                segment: "s1".into(),
                offset: segment_offset("s1", 4),
            }),
        );
        match routes.dispatch(&probe).await {
            Some(Reply::Nack(nack)) => {
                assert_eq!(nack.reason, NackReason::Behind);
                assert_eq!(nack.offset, Some(LexKey::empty()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_is_an_event() {
        let local = NodeId::random();
        let peer = NodeId::random();
        let context = context(local, &[local]);
        let routes = node_routes(Arc::clone(&context));

        let heartbeat = Envelope::new(peer, Message::NodeHeartbeat(NodeHeartbeat { node: peer }));
        assert!(routes.dispatch(&heartbeat).await.is_none());
        assert_eq!(context.membership.live_nodes(), 2);

        let status = Envelope::new(peer, Message::GetStatus(GetStatus::default()));
        match routes.dispatch(&status).await {
            Some(Reply::Response(response)) => {
                assert_eq!(response.body, ResponseBody::Status(ClusterStatus { node_count: 2 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn produce_on_a_follower_is_refused_with_not_leader() {
        let local = NodeId::random();
        let leader = NodeId::random();
        let context = context(local, &[leader, local]);
        let routes = node_routes(context);

        let produce = Envelope::new(
            leader,
            Message::Produce(Produce {
                space: "orders".into(),
                segment: "s1".into(),
                entries: vec![Bytes::from_static(b"x")],
            }),
        );
        match routes.dispatch(&produce).await {
            Some(Reply::Nack(nack)) => assert_eq!(nack.reason, NackReason::NotLeader),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn every_route_is_served() {
        let local = NodeId::random();
        let routes = node_routes(context(local, &[local]));
        assert!(routes.unhandled().is_empty());
    }

    #[test]
    fn errors_map_to_nack_reasons() {
        assert_eq!(
            nack_reason(&ClusterError::NotLeader {
                space: "orders".into(),
                segment: "s1".into(),
                leader: None,
            }),
            NackReason::NotLeader
        );
        assert_eq!(nack_reason(&ClusterError::Cancelled), NackReason::Unavailable);
        assert_eq!(
            nack_reason(&ClusterError::QuorumUnreachable {
                space: "orders".into(),
                segment: "s1".into(),
            }),
            NackReason::Rejected
        );
        assert_eq!(
            nack_reason(&ClusterError::MalformedPayload("empty".into())),
            NackReason::Malformed
        );
    }
}
