//! Message kinds and their static routes.

use crate::model::RequestId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix shared by every reply route.
pub const REPLY_PREFIX: &str = "reply.";

/// The closed set of message kinds a node can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Cluster status request.
    GetStatus,
    /// Last entry of a segment.
    Peek,
    /// Producer append.
    Produce,
    /// Read a page of a space.
    ConsumeSpace,
    /// Read a page of a segment.
    ConsumeSegment,
    /// List spaces.
    GetSpaces,
    /// List segments of a space.
    GetSegments,
    /// Paginated space traversal.
    EnumerateSpace,
    /// Paginated segment traversal.
    EnumerateSegment,
    /// Space offset probe.
    CheckSpaceOffset,
    /// Segment offset probe.
    CheckSegmentOffset,
    /// Stage a transaction.
    Commit,
    /// Apply a staged transaction.
    Finalize,
    /// Discard a staged transaction.
    Rollback,
    /// Ask the leader to replay a decision.
    Reconcile,
    /// Push a missing suffix of a segment.
    Replay,
    /// Per-space persisted offsets of a node.
    Synchronize,
    /// Membership change announcement.
    QuorumChanged,
    /// Liveness signal.
    NodeHeartbeat,
    /// Explicit departure.
    NodeShutdown,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 20] = [
        MessageKind::GetStatus,
        MessageKind::Peek,
        MessageKind::Produce,
        MessageKind::ConsumeSpace,
        MessageKind::ConsumeSegment,
        MessageKind::GetSpaces,
        MessageKind::GetSegments,
        MessageKind::EnumerateSpace,
        MessageKind::EnumerateSegment,
        MessageKind::CheckSpaceOffset,
        MessageKind::CheckSegmentOffset,
        MessageKind::Commit,
        MessageKind::Finalize,
        MessageKind::Rollback,
        MessageKind::Reconcile,
        MessageKind::Replay,
        MessageKind::Synchronize,
        MessageKind::QuorumChanged,
        MessageKind::NodeHeartbeat,
        MessageKind::NodeShutdown,
    ];

    /// Returns the static route for this kind.
    pub fn route(&self) -> &'static str {
        match self {
            MessageKind::GetStatus => "get_node_count",
            MessageKind::Peek => "peek",
            MessageKind::Produce => "produce",
            MessageKind::ConsumeSpace => "consume_space",
            MessageKind::ConsumeSegment => "consume_segment",
            MessageKind::GetSpaces => "get_spaces",
            MessageKind::GetSegments => "get_segments",
            MessageKind::EnumerateSpace => "enumerate_space",
            MessageKind::EnumerateSegment => "enumerate_segment",
            MessageKind::CheckSpaceOffset => "check_space_offset",
            MessageKind::CheckSegmentOffset => "check_segment_offset",
            MessageKind::Commit => "trx.commit",
            MessageKind::Finalize => "trx.finalize",
            MessageKind::Rollback => "trx.rollback",
            MessageKind::Reconcile => "trx.reconcile",
            MessageKind::Replay => "node.replay",
            MessageKind::Synchronize => "node.synchronize",
            MessageKind::QuorumChanged => "node.quorum_changed",
            MessageKind::NodeHeartbeat => "node.healthcheck",
            MessageKind::NodeShutdown => "node.shutdown",
        }
    }

    /// Looks up the kind served on `route`.
    pub fn from_route(route: &str) -> Option<MessageKind> {
        MessageKind::ALL.iter().copied().find(|kind| kind.route() == route)
    }

    /// Returns true for fire-and-forget events that never get a reply.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            MessageKind::QuorumChanged | MessageKind::NodeHeartbeat | MessageKind::NodeShutdown
        )
    }
}

/// Reply route for a request id.
pub fn reply_route(id: RequestId) -> String {
    format!("{REPLY_PREFIX}{id}")
}

/// Extracts the request id from a reply route.
pub fn parse_reply_route(route: &str) -> Option<RequestId> {
    route
        .strip_prefix(REPLY_PREFIX)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(RequestId)
}
