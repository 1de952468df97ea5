//! Quorum membership and failure detection.
//!
//! The tracker owns one versioned [`QuorumSnapshot`] per segment. Snapshots
//! are immutable and shared through `Arc`; every membership change builds a
//! new snapshot and swaps it in under the write lock, so a reader either
//! sees the old quorum or the new one, never a mix.
//!
//! Which nodes *belong* to a segment is decided elsewhere and handed in as
//! an [`Assignment`]. The tracker only decides which of them are currently
//! counted: alive and suspect nodes are, down and departed nodes are not.

use crate::config::ClusterConfig;
use lexlog_protocol::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// A `(space, segment)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
}

impl SegmentKey {
    /// Creates a key.
    pub fn new(space: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            segment: segment.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.space, self.segment)
    }
}

/// The nodes that replicate a segment and the one that leads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Node that assigns sequences and drives commits.
    pub leader: NodeId,
    /// Every replica, leader included.
    pub members: BTreeSet<NodeId>,
}

impl Assignment {
    /// Creates an assignment; the leader is always a member.
    pub fn new(leader: NodeId, replicas: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: BTreeSet<NodeId> = replicas.into_iter().collect();
        members.insert(leader);
        Self { leader, members }
    }
}

/// The nodes currently required to agree for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumSnapshot {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Incremented on every change.
    pub version: u64,
    /// Segment leader.
    pub leader: NodeId,
    /// Counted members.
    pub members: BTreeSet<NodeId>,
}

impl QuorumSnapshot {
    /// Returns true if `node` is counted.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Number of counted members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if nobody is counted.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Counted members other than `local`.
    pub fn peers(&self, local: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |node| *node != local)
    }

    /// Returns true if this snapshot describes `space/segment`.
    pub fn is_for(&self, space: &str, segment: &str) -> bool {
        self.space == space && self.segment == segment
    }
}

/// Liveness of a remote node as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeats arrive on time.
    Alive,
    /// Heartbeats are late; the node still counts.
    Suspect,
    /// Silent past the grace period; removed from every quorum.
    Down,
    /// Announced its own shutdown.
    Left,
}

impl Liveness {
    /// Returns true if nodes in this state count towards quorums.
    pub fn is_counted(&self) -> bool {
        matches!(self, Liveness::Alive | Liveness::Suspect)
    }
}

/// A membership change other components react to.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A segment's quorum changed because `node` left or came back.
    QuorumChanged {
        /// The node whose liveness changed.
        node: NodeId,
        /// The new quorum.
        snapshot: Arc<QuorumSnapshot>,
    },
    /// A node that was down or gone heartbeats again.
    NodeRejoined {
        /// The returning node.
        node: NodeId,
    },
}

#[derive(Debug)]
struct NodeRecord {
    liveness: Liveness,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<NodeId, NodeRecord>,
    assignments: HashMap<SegmentKey, Assignment>,
    default_assignment: Option<Assignment>,
    snapshots: HashMap<SegmentKey, Arc<QuorumSnapshot>>,
}

impl State {
    fn assignment_for(&self, key: &SegmentKey) -> Option<&Assignment> {
        self.assignments
            .get(key)
            .or(self.default_assignment.as_ref())
    }

    fn is_counted(&self, local: NodeId, node: &NodeId) -> bool {
        *node == local
            || self
                .nodes
                .get(node)
                .is_some_and(|record| record.liveness.is_counted())
    }

    fn build_snapshot(&self, local: NodeId, key: &SegmentKey, version: u64) -> Option<QuorumSnapshot> {
        let assignment = self.assignment_for(key)?;
        Some(QuorumSnapshot {
            space: key.space.clone(),
            segment: key.segment.clone(),
            version,
            leader: assignment.leader,
            members: assignment
                .members
                .iter()
                .copied()
                .filter(|node| self.is_counted(local, node))
                .collect(),
        })
    }

    fn register(&mut self, node: NodeId, now: Instant) {
        self.nodes.entry(node).or_insert(NodeRecord {
            liveness: Liveness::Alive,
            last_seen: now,
        });
    }

    /// Rebuilds every snapshot whose assignment lists `node`.
    fn refresh_quorums_of(&mut self, local: NodeId, node: NodeId) -> Vec<MembershipEvent> {
        let affected: Vec<SegmentKey> = self
            .snapshots
            .keys()
            .filter(|key| {
                self.assignment_for(key)
                    .is_some_and(|assignment| assignment.members.contains(&node))
            })
            .cloned()
            .collect();

        let mut events = Vec::new();
        for key in affected {
            let version = self.snapshots.get(&key).map_or(0, |s| s.version) + 1;
            if let Some(snapshot) = self.build_snapshot(local, &key, version) {
                let snapshot = Arc::new(snapshot);
                self.snapshots.insert(key, Arc::clone(&snapshot));
                events.push(MembershipEvent::QuorumChanged { node, snapshot });
            }
        }
        events
    }
}

/// Tracks node liveness and the quorum of every segment.
#[derive(Debug)]
pub struct MembershipTracker {
    local: NodeId,
    suspect_after: Duration,
    down_after: Duration,
    state: RwLock<State>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipTracker {
    /// Creates a tracker for the local node.
    pub fn new(config: &ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local: config.node_id,
            suspect_after: config.suspect_after,
            down_after: config.down_after,
            state: RwLock::new(State::default()),
            events,
        }
    }

    /// The local node.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Subscribes to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Registers a known peer as alive.
    pub fn add_node(&self, node: NodeId) {
        if node != self.local {
            self.state.write().register(node, Instant::now());
        }
    }

    /// Assigns the members and leader of a segment.
    ///
    /// Members not seen before are registered as alive.
    pub fn assign(&self, space: &str, segment: &str, assignment: Assignment) {
        let key = SegmentKey::new(space, segment);
        let events = {
            let mut state = self.state.write();
            let now = Instant::now();
            for node in &assignment.members {
                if *node != self.local {
                    state.register(*node, now);
                }
            }
            state.assignments.insert(key.clone(), assignment);

            let previous = state.snapshots.get(&key).cloned();
            let version = previous.as_ref().map_or(0, |s| s.version) + 1;
            match state.build_snapshot(self.local, &key, version) {
                Some(snapshot) => {
                    let changed = previous.as_ref().is_some_and(|p| {
                        p.members != snapshot.members || p.leader != snapshot.leader
                    });
                    let snapshot = Arc::new(snapshot);
                    state.snapshots.insert(key, Arc::clone(&snapshot));
                    if changed {
                        vec![MembershipEvent::QuorumChanged {
                            node: snapshot.leader,
                            snapshot,
                        }]
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            }
        };
        self.publish(events);
    }

    /// Assignment used by every segment without an explicit one.
    pub fn assign_default(&self, assignment: Assignment) {
        let mut state = self.state.write();
        let now = Instant::now();
        for node in &assignment.members {
            if *node != self.local {
                state.register(*node, now);
            }
        }
        state.default_assignment = Some(assignment);
    }

    /// Atomic snapshot of the quorum of a segment.
    ///
    /// Returns `None` if the segment has no assignment.
    pub fn current_quorum(&self, space: &str, segment: &str) -> Option<Arc<QuorumSnapshot>> {
        let key = SegmentKey::new(space, segment);
        if let Some(snapshot) = self.state.read().snapshots.get(&key) {
            return Some(Arc::clone(snapshot));
        }

        let mut state = self.state.write();
        if let Some(snapshot) = state.snapshots.get(&key) {
            return Some(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(state.build_snapshot(self.local, &key, 1)?);
        state.snapshots.insert(key, Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Every materialized snapshot.
    pub fn snapshots(&self) -> Vec<Arc<QuorumSnapshot>> {
        self.state.read().snapshots.values().cloned().collect()
    }

    /// Liveness of a remote node; `None` if the node is unknown.
    pub fn liveness(&self, node: &NodeId) -> Option<Liveness> {
        self.state.read().nodes.get(node).map(|r| r.liveness)
    }

    /// Every known remote node, whatever its liveness.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.state.read().nodes.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Number of counted nodes, the local one included.
    pub fn live_nodes(&self) -> usize {
        1 + self
            .state
            .read()
            .nodes
            .values()
            .filter(|r| r.liveness.is_counted())
            .count()
    }

    /// Records a heartbeat received now.
    pub fn on_heartbeat(&self, node: NodeId) -> Vec<MembershipEvent> {
        self.on_heartbeat_at(node, Instant::now())
    }

    /// Records a heartbeat received at `now`.
    pub fn on_heartbeat_at(&self, node: NodeId, now: Instant) -> Vec<MembershipEvent> {
        if node == self.local {
            return Vec::new();
        }
        let events = {
            let mut state = self.state.write();
            let previous = state.nodes.get(&node).map(|r| r.liveness);
            state.nodes.insert(
                node,
                NodeRecord {
                    liveness: Liveness::Alive,
                    last_seen: now,
                },
            );
            match previous {
                Some(Liveness::Down | Liveness::Left) => {
                    info!(node = %node, "node rejoined");
                    let mut events = state.refresh_quorums_of(self.local, node);
                    events.push(MembershipEvent::NodeRejoined { node });
                    events
                }
                Some(Liveness::Suspect) => {
                    debug!(node = %node, "suspect node is alive again");
                    Vec::new()
                }
                None => {
                    info!(node = %node, "discovered node");
                    state.refresh_quorums_of(self.local, node)
                }
                Some(Liveness::Alive) => Vec::new(),
            }
        };
        self.publish(events.clone());
        events
    }

    /// Applies failure detection against the current time.
    pub fn sweep(&self) -> Vec<MembershipEvent> {
        self.sweep_at(Instant::now())
    }

    /// Applies failure detection as of `now`.
    ///
    /// Silent nodes become suspect after `suspect_after` and down after
    /// `down_after`; only the second step changes quorums.
    pub fn sweep_at(&self, now: Instant) -> Vec<MembershipEvent> {
        let events = {
            let mut state = self.state.write();
            let mut newly_down = Vec::new();
            for (node, record) in state.nodes.iter_mut() {
                if !record.liveness.is_counted() {
                    continue;
                }
                let silence = now.saturating_duration_since(record.last_seen);
                if silence >= self.down_after {
                    warn!(node = %node, silence_ms = silence.as_millis() as u64, "node declared down");
                    record.liveness = Liveness::Down;
                    newly_down.push(*node);
                } else if silence >= self.suspect_after && record.liveness == Liveness::Alive {
                    info!(node = %node, silence_ms = silence.as_millis() as u64, "node is suspect");
                    record.liveness = Liveness::Suspect;
                }
            }
            newly_down.sort();
            newly_down
                .into_iter()
                .flat_map(|node| state.refresh_quorums_of(self.local, node))
                .collect::<Vec<_>>()
        };
        self.publish(events.clone());
        events
    }

    /// Removes a node that announced its shutdown from every quorum.
    pub fn on_shutdown(&self, node: NodeId) -> Vec<MembershipEvent> {
        if node == self.local {
            return Vec::new();
        }
        let events = {
            let mut state = self.state.write();
            let now = Instant::now();
            let record = state.nodes.entry(node).or_insert(NodeRecord {
                liveness: Liveness::Left,
                last_seen: now,
            });
            let was_counted = record.liveness.is_counted();
            record.liveness = Liveness::Left;
            if was_counted {
                info!(node = %node, "node left the cluster");
                state.refresh_quorums_of(self.local, node)
            } else {
                Vec::new()
            }
        };
        self.publish(events.clone());
        events
    }

    /// Applies a membership hint announced by another node.
    ///
    /// A peer that no longer counts `node` only makes it suspect here; the
    /// local sweep decides whether it is really down.
    pub fn observe_remote_change(&self, node: NodeId, counted_remotely: bool) {
        if node == self.local || counted_remotely {
            return;
        }
        let mut state = self.state.write();
        if let Some(record) = state.nodes.get_mut(&node) {
            if record.liveness == Liveness::Alive {
                debug!(node = %node, "peer reports node missing, marking suspect");
                record.liveness = Liveness::Suspect;
            }
        }
    }

    fn publish(&self, events: Vec<MembershipEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}
