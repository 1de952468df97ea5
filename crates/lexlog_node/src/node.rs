//! A running LexLog node.
//!
//! [`NodeBuilder::start`] attaches the node to a [`MemoryNetwork`] and
//! spawns its background tasks:
//!
//! - the inbox loop, which decodes frames, hands replies to the reply
//!   router and runs each request in its own task
//! - heartbeats to every known peer
//! - the liveness sweep, which also asks leaders about transactions
//!   staged for too long
//! - `QuorumChanged` announcements for segments this node leads
//! - the reconciler
//! - a one-shot `Synchronize` to every peer
//!
//! All tasks stop when the shutdown signal flips.

use crate::error::{NodeError, NodeResult};
use crate::handlers::{node_routes, NodeContext};
use crate::network::{Frame, Inbound, Inbox, MemoryNetwork};
use crate::routing::RoutingTable;
use bytes::Bytes;
use lexlog_cluster::{
    Assignment, ClusterConfig, ClusterError, Coordinator, Delivery, MembershipEvent,
    MembershipTracker, Reconciler, Transport,
};
use lexlog_protocol::{
    Envelope, LexKey, Message, Nack, NackReason, NodeHeartbeat, NodeId, NodeShutdown, Produce, Produced,
    QuorumChanged, Reconcile, Reply, ResponseBody, Synchronize,
};
use lexlog_storage::{LogStore, MemoryLogStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configures and starts a [`Node`].
pub struct NodeBuilder {
    config: ClusterConfig,
    store: Option<Arc<dyn LogStore>>,
    assignments: Vec<(String, String, Assignment)>,
    default_assignment: Option<Assignment>,
}

impl NodeBuilder {
    /// Starts from a configuration.
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            store: None,
            assignments: Vec::new(),
            default_assignment: None,
        }
    }

    /// Uses an existing store instead of a fresh in-memory one.
    pub fn with_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Assigns one segment.
    pub fn assign(mut self, space: impl Into<String>, segment: impl Into<String>, assignment: Assignment) -> Self {
        self.assignments.push((space.into(), segment.into(), assignment));
        self
    }

    /// Assignment for every segment without an explicit one.
    pub fn assign_default(mut self, assignment: Assignment) -> Self {
        self.default_assignment = Some(assignment);
        self
    }

    /// Attaches the node to `network` and spawns its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self, network: &MemoryNetwork) -> Node {
        let local = self.config.node_id;
        let (transport, inbox) = network.attach(local);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryLogStore::new()));
        let context = Arc::new(NodeContext::new(self.config, store, transport));

        if let Some(assignment) = self.default_assignment {
            context.membership.assign_default(assignment);
        }
        for (space, segment, assignment) in self.assignments {
            context.membership.assign(&space, &segment, assignment);
        }

        let routes = Arc::new(node_routes(Arc::clone(&context)));
        let (shutdown, signal) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(inbox_loop(
                Arc::clone(&context),
                Arc::clone(&routes),
                inbox,
                signal.clone(),
            )),
            tokio::spawn(heartbeat_loop(Arc::clone(&context), signal.clone())),
            tokio::spawn(sweep_loop(Arc::clone(&context), signal.clone())),
            tokio::spawn(announce_loop(Arc::clone(&context), signal.clone())),
            tokio::spawn(Arc::clone(&context.reconciler).run(signal)),
            tokio::spawn(synchronize_with_peers(Arc::clone(&context))),
        ];

        info!(node = %local, peers = context.membership.peers().len(), "node started");
        Node {
            context,
            routes,
            network: network.clone(),
            shutdown,
            tasks,
        }
    }
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("node", &self.config.node_id)
            .field("assignments", &self.assignments.len())
            .field("default_assignment", &self.default_assignment.is_some())
            .finish()
    }
}

/// A node attached to a network.
///
/// Dropping a node aborts its tasks without telling its peers; call
/// [`Node::stop`] to leave the cluster gracefully.
pub struct Node {
    context: Arc<NodeContext>,
    routes: Arc<RoutingTable>,
    network: MemoryNetwork,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Shorthand for [`NodeBuilder::new`].
    pub fn builder(config: ClusterConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Identity of this node.
    pub fn id(&self) -> NodeId {
        self.context.local()
    }

    /// Local log.
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.context.store
    }

    /// Liveness and quorums as seen by this node.
    pub fn membership(&self) -> &Arc<MembershipTracker> {
        &self.context.membership
    }

    /// Leader side of the commit protocol.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.context.coordinator
    }

    /// Offset repair.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.context.reconciler
    }

    /// Shared handler context.
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    /// Route table serving inbound requests.
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Appends `payloads` to a segment.
    ///
    /// Runs the commit locally when this node leads the segment and
    /// forwards the request to the leader otherwise.
    ///
    /// # Errors
    ///
    /// Returns the commit error, or [`NodeError::Rejected`] if the leader
    /// refused a forwarded request or never answered it. Check
    /// [`NodeError::commit_outcome`] before retrying: an unanswered forward
    /// may still have committed.
    pub async fn produce(&self, space: &str, segment: &str, payloads: Vec<Bytes>) -> NodeResult<Produced> {
        let local = self.id();
        match self
            .context
            .coordinator
            .begin_and_replicate(space, segment, payloads.clone())
            .await
        {
            Ok(receipt) => Ok(Produced {
                trx: receipt.trx,
                first_sequence: receipt.first_sequence,
                last_sequence: receipt.last_sequence,
            }),
            Err(ClusterError::NotLeader {
                leader: Some(leader),
                ..
            }) if leader != local => {
                debug!(space, segment, %leader, "forwarding produce to leader");
                self.forward_produce(leader, space, segment, payloads).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn forward_produce(
        &self,
        leader: NodeId,
        space: &str,
        segment: &str,
        payloads: Vec<Bytes>,
    ) -> NodeResult<Produced> {
        let message = Message::Produce(Produce {
            space: space.to_string(),
            segment: segment.to_string(),
            entries: payloads,
        });
        let route = message.route();
        let config = &self.context.config;
        let timeout = config.commit_timeout + config.request_timeout * 2;
        match self.request_within(leader, message, timeout).await? {
            Reply::Response(response) => match response.body {
                ResponseBody::Produced(produced) => Ok(produced),
                _ => Err(NodeError::UnexpectedReply { node: leader, route }),
            },
            Reply::Nack(nack) => Err(NodeError::Rejected {
                node: nack.node,
                route,
                reason: nack.reason,
            }),
            Reply::Ack(_) => Err(NodeError::UnexpectedReply { node: leader, route }),
        }
    }

    /// Sends a request to `target` and waits for its reply.
    ///
    /// A missing reply comes back as a `TimedOut` NACK.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be published.
    pub async fn request(&self, target: NodeId, message: Message) -> NodeResult<Reply> {
        let timeout = self.context.config.request_timeout;
        self.request_within(target, message, timeout).await
    }

    async fn request_within(&self, target: NodeId, message: Message, timeout: Duration) -> NodeResult<Reply> {
        let envelope = Envelope::new(self.id(), message);
        let reply = self
            .context
            .router
            .request(self.context.transport.as_ref(), target, envelope, timeout)
            .await?;
        Ok(reply)
    }

    /// Leaves the cluster: announces the departure, stops every task and
    /// detaches from the network.
    pub async fn stop(mut self) {
        let local = self.id();
        for peer in self.context.membership.peers() {
            let envelope = Envelope::new(local, Message::NodeShutdown(NodeShutdown { node: local }));
            if let Err(err) = self.context.transport.publish(peer, envelope) {
                debug!(%peer, error = %err, "shutdown notice not delivered");
            }
        }
        let _ = self.shutdown.send(true);
        self.network.detach(local);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!(node = %local, "node stopped");
    }

    /// Stops abruptly, as a crash would: peers are not told.
    pub fn abort(mut self) {
        let local = self.id();
        self.network.detach(local);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        warn!(node = %local, "node aborted");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

async fn inbox_loop(
    context: Arc<NodeContext>,
    routes: Arc<RoutingTable>,
    mut inbox: Inbox,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let bytes = tokio::select! {
            _ = shutdown.changed() => break,
            bytes = inbox.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                continue;
            }
        };
        match frame.open() {
            Ok(Inbound::Reply(reply)) => {
                let (id, node) = (reply.id(), reply.node());
                if context.router.deliver(reply) == Delivery::Late {
                    debug!(%id, %node, "ignoring late reply");
                }
            }
            Ok(Inbound::Request(envelope)) => {
                let context = Arc::clone(&context);
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    if let Some(reply) = routes.dispatch(&envelope).await {
                        if let Err(err) = context.transport.reply(envelope.sender, reply) {
                            debug!(route = envelope.route(), sender = %envelope.sender, error = %err, "reply not delivered");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(route = %frame.route, sender = %frame.sender, error = %err, "malformed frame");
                if frame.expects_reply() {
                    let nack = Reply::Nack(Nack {
                        id: frame.id,
                        node: context.local(),
                        reason: NackReason::Malformed,
                        offset: None,
                    });
                    if let Err(err) = context.transport.reply(frame.sender, nack) {
                        debug!(sender = %frame.sender, error = %err, "nack not delivered");
                    }
                }
            }
        }
    }
    debug!(node = %context.local(), "inbox closed");
}

async fn heartbeat_loop(context: Arc<NodeContext>, mut shutdown: watch::Receiver<bool>) {
    let local = context.local();
    let mut ticker = tokio::time::interval(context.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for peer in context.membership.peers() {
                    let envelope = Envelope::new(local, Message::NodeHeartbeat(NodeHeartbeat { node: local }));
                    if let Err(err) = context.transport.publish(peer, envelope) {
                        debug!(%peer, error = %err, "heartbeat not delivered");
                    }
                }
            }
        }
    }
}

async fn sweep_loop(context: Arc<NodeContext>, mut shutdown: watch::Receiver<bool>) {
    let local = context.local();
    let stale_after = context.config.commit_timeout * 2;
    let mut ticker = tokio::time::interval(context.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                context.membership.sweep();
                for transaction in context.participant.stale(stale_after) {
                    let leader = transaction.trx.node;
                    info!(trx = %transaction.trx, %leader, "asking leader about stale transaction");
                    let envelope = Envelope::new(
                        local,
                        Message::Reconcile(Reconcile {
                            trx: transaction.trx,
                            space: transaction.space.clone(),
                            segment: transaction.segment.clone(),
                        }),
                    );
                    if let Err(err) = context.transport.publish(leader, envelope) {
                        debug!(%leader, error = %err, "reconcile request not delivered");
                    }
                }
            }
        }
    }
}

async fn announce_loop(context: Arc<NodeContext>, mut shutdown: watch::Receiver<bool>) {
    let local = context.local();
    let mut changes = context.membership.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = changes.recv() => event,
        };
        let (node, snapshot) = match event {
            Ok(MembershipEvent::QuorumChanged { node, snapshot }) => (node, snapshot),
            Ok(MembershipEvent::NodeRejoined { .. }) => continue,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "membership announcements lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if snapshot.leader != local {
            continue;
        }
        let announcement = QuorumChanged {
            node,
            space: snapshot.space.clone(),
            segment: snapshot.segment.clone(),
            members: snapshot.members.iter().copied().collect(),
            version: snapshot.version,
        };
        for peer in context.membership.peers() {
            let envelope = Envelope::new(local, Message::QuorumChanged(announcement.clone()));
            if let Err(err) = context.transport.publish(peer, envelope) {
                debug!(%peer, error = %err, "quorum announcement not delivered");
            }
        }
    }
}

async fn synchronize_with_peers(context: Arc<NodeContext>) {
    let local = context.local();
    let offsets = match persisted_offsets(context.store.as_ref()) {
        Ok(offsets) => offsets,
        Err(err) => {
            warn!(error = %err, "cannot read persisted offsets");
            return;
        }
    };
    for peer in context.membership.peers() {
        let envelope = Envelope::new(
            local,
            Message::Synchronize(Synchronize {
                offsets_by_space: offsets.clone(),
            }),
        );
        match context
            .router
            .request(context.transport.as_ref(), peer, envelope, context.config.commit_timeout)
            .await
        {
            Ok(reply) if reply.is_positive() => debug!(%peer, "synchronized"),
            Ok(reply) => debug!(%peer, ?reply, "synchronize refused"),
            Err(err) => debug!(%peer, error = %err, "synchronize not delivered"),
        }
    }
}

fn persisted_offsets(store: &dyn LogStore) -> NodeResult<BTreeMap<String, LexKey>> {
    let mut offsets = BTreeMap::new();
    for space in store.spaces()? {
        let offset = store.persisted_space_offset(&space)?;
        offsets.insert(space, offset);
    }
    Ok(offsets)
}
