//! Protocol messages.

use crate::model::{
    Entry, NodeId, RequestId, SequenceRange, TimestampWindow, Transaction, Trx,
};
use crate::route::{reply_route, MessageKind};
use bytes::Bytes;
use lexlog_codec::LexKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Asks a node how many live nodes it knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatus {}

/// Answer to [`GetStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Number of live nodes, including the responder.
    pub node_count: usize,
}

/// Reads the last entry of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peek {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
}

/// Appends payloads to a segment through its leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Produce {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Opaque payloads, in order.
    pub entries: Vec<Bytes>,
}

/// Reads a page of a space after an offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeSpace {
    /// Space name.
    pub space: String,
    /// Timestamp bounds.
    pub window: TimestampWindow,
    /// Resume after this offset; empty for the beginning.
    pub offset: LexKey,
}

/// Reads a page of a segment by sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeSegment {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Sequence bounds.
    pub sequences: SequenceRange,
    /// Timestamp bounds.
    pub window: TimestampWindow,
}

/// Lists the spaces a node holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSpaces {}

/// Lists the segments of a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegments {
    /// Space name.
    pub space: String,
}

/// Paginated traversal of a space in offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerateSpace {
    /// Space name.
    pub space: String,
    /// Timestamp bounds.
    pub window: TimestampWindow,
    /// Resumption cursor; empty for the beginning.
    pub offset: LexKey,
}

/// Paginated traversal of a segment in offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerateSegment {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Sequence bounds.
    pub sequences: SequenceRange,
    /// Timestamp bounds.
    pub window: TimestampWindow,
    /// Resumption cursor; empty for the beginning.
    pub offset: LexKey,
}

/// Asks whether a node has persisted a space up to `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpaceOffset {
    /// Space name.
    pub space: String,
    /// Space offset to compare against.
    pub offset: LexKey,
}

/// Asks whether a node has persisted a segment up to `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSegmentOffset {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Segment offset to compare against.
    pub offset: LexKey,
}

/// Asks a replica to durably stage a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// The record, framed as an opaque `d` payload.
    #[serde(with = "crate::payload")]
    pub transaction: Transaction,
}

/// Tells a replica to apply a staged transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    /// Transaction identity.
    pub trx: Trx,
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
}

/// Tells a replica to discard a staged transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollback {
    /// Transaction identity.
    pub trx: Trx,
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
}

/// Asks the leader to replay its decision for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconcile {
    /// Transaction identity.
    pub trx: Trx,
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
}

/// Pushes committed entries a replica is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Entries in sequence order.
    pub entries: Vec<Entry>,
}

/// A node's report of the furthest offset it persisted per space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronize {
    /// Space name to persisted space offset.
    pub offsets_by_space: BTreeMap<String, LexKey>,
}

/// Announces a new quorum for a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumChanged {
    /// Node whose state changed.
    pub node: NodeId,
    /// Space name.
    pub space: String,
    /// Segment name.
    pub segment: String,
    /// Members after the change.
    pub members: Vec<NodeId>,
    /// Snapshot version on the announcing node.
    pub version: u64,
}

/// Liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    /// Sending node.
    pub node: NodeId,
}

/// Explicit departure notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShutdown {
    /// Departing node.
    pub node: NodeId,
}

/// Every message a node can receive on a static route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// See [`GetStatus`].
    GetStatus(GetStatus),
    /// See [`Peek`].
    Peek(Peek),
    /// See [`Produce`].
    Produce(Produce),
    /// See [`ConsumeSpace`].
    ConsumeSpace(ConsumeSpace),
    /// See [`ConsumeSegment`].
    ConsumeSegment(ConsumeSegment),
    /// See [`GetSpaces`].
    GetSpaces(GetSpaces),
    /// See [`GetSegments`].
    GetSegments(GetSegments),
    /// See [`EnumerateSpace`].
    EnumerateSpace(EnumerateSpace),
    /// See [`EnumerateSegment`].
    EnumerateSegment(EnumerateSegment),
    /// See [`CheckSpaceOffset`].
    CheckSpaceOffset(CheckSpaceOffset),
    /// See [`CheckSegmentOffset`].
    CheckSegmentOffset(CheckSegmentOffset),
    /// See [`Commit`].
    Commit(Commit),
    /// See [`Finalize`].
    Finalize(Finalize),
    /// See [`Rollback`].
    Rollback(Rollback),
    /// See [`Reconcile`].
    Reconcile(Reconcile),
    /// See [`Replay`].
    Replay(Replay),
    /// See [`Synchronize`].
    Synchronize(Synchronize),
    /// See [`QuorumChanged`].
    QuorumChanged(QuorumChanged),
    /// See [`NodeHeartbeat`].
    NodeHeartbeat(NodeHeartbeat),
    /// See [`NodeShutdown`].
    NodeShutdown(NodeShutdown),
}

impl Message {
    /// Returns the kind tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::GetStatus(_) => MessageKind::GetStatus,
            Message::Peek(_) => MessageKind::Peek,
            Message::Produce(_) => MessageKind::Produce,
            Message::ConsumeSpace(_) => MessageKind::ConsumeSpace,
            Message::ConsumeSegment(_) => MessageKind::ConsumeSegment,
            Message::GetSpaces(_) => MessageKind::GetSpaces,
            Message::GetSegments(_) => MessageKind::GetSegments,
            Message::EnumerateSpace(_) => MessageKind::EnumerateSpace,
            Message::EnumerateSegment(_) => MessageKind::EnumerateSegment,
            Message::CheckSpaceOffset(_) => MessageKind::CheckSpaceOffset,
            Message::CheckSegmentOffset(_) => MessageKind::CheckSegmentOffset,
            Message::Commit(_) => MessageKind::Commit,
            Message::Finalize(_) => MessageKind::Finalize,
            Message::Rollback(_) => MessageKind::Rollback,
            Message::Reconcile(_) => MessageKind::Reconcile,
            Message::Replay(_) => MessageKind::Replay,
            Message::Synchronize(_) => MessageKind::Synchronize,
            Message::QuorumChanged(_) => MessageKind::QuorumChanged,
            Message::NodeHeartbeat(_) => MessageKind::NodeHeartbeat,
            Message::NodeShutdown(_) => MessageKind::NodeShutdown,
        }
    }

    /// Returns the static route of this message.
    pub fn route(&self) -> &'static str {
        self.kind().route()
    }
}

/// A request as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request identity, echoed by the reply.
    pub id: RequestId,
    /// Sending node.
    pub sender: NodeId,
    /// Payload.
    pub message: Message,
}

impl Envelope {
    /// Wraps a message with a fresh request id.
    pub fn new(sender: NodeId, message: Message) -> Self {
        Self {
            id: RequestId::random(),
            sender,
            message,
        }
    }

    /// Static route of the payload.
    pub fn route(&self) -> &'static str {
        self.message.route()
    }

    /// Route the reply to this request travels on.
    pub fn reply_route(&self) -> String {
        reply_route(self.id)
    }

    /// Builds the ACK for this request.
    pub fn ack(&self, node: NodeId) -> Reply {
        Reply::Ack(Ack { id: self.id, node })
    }

    /// Builds a NACK for this request.
    pub fn nack(&self, node: NodeId, reason: NackReason) -> Reply {
        Reply::Nack(Nack {
            id: self.id,
            node,
            reason,
            offset: None,
        })
    }

    /// Builds a NACK that reports the responder's own offset.
    pub fn nack_at(&self, node: NodeId, reason: NackReason, offset: LexKey) -> Reply {
        Reply::Nack(Nack {
            id: self.id,
            node,
            reason,
            offset: Some(offset),
        })
    }

    /// Builds a data response for this request.
    pub fn respond(&self, node: NodeId, body: ResponseBody) -> Reply {
        Reply::Response(Response {
            id: self.id,
            node,
            body,
        })
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// The request was refused by policy.
    Rejected,
    /// The request conflicts with already committed state.
    Conflict,
    /// The responder has not persisted far enough.
    Behind,
    /// The responder holds history the requester never committed.
    Diverged,
    /// The responder knows nothing about the referenced transaction.
    Unknown,
    /// No reply arrived in time.
    TimedOut,
    /// The responder does not lead the segment.
    NotLeader,
    /// The request could not be decoded.
    Malformed,
    /// The responder could not serve the request right now.
    Unavailable,
}

/// Positive reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Responding node.
    pub node: NodeId,
}

/// Negative reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nack {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Responding node.
    pub node: NodeId,
    /// Why the request was refused.
    pub reason: NackReason,
    /// Responder's own offset, for offset probes and gaps.
    pub offset: Option<LexKey>,
}

/// A page of entries plus the cursor to resume after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPage {
    /// Entries in offset order.
    pub entries: Vec<Entry>,
    /// Offset of the last entry returned, or the request cursor if none.
    pub cursor: LexKey,
    /// Whether another page may follow.
    pub has_more: bool,
}

/// Summary of a committed producer append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Produced {
    /// Transaction identity.
    pub trx: Trx,
    /// First assigned sequence.
    pub first_sequence: u64,
    /// Last assigned sequence.
    pub last_sequence: u64,
}

/// Data carried by a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Cluster status.
    Status(ClusterStatus),
    /// A single entry, if any.
    Entry(Option<Entry>),
    /// A page of entries.
    Entries(EntryPage),
    /// Space or segment names.
    Names(Vec<String>),
    /// A committed append.
    Produced(Produced),
}

/// Positive reply that carries data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Responding node.
    pub node: NodeId,
    /// Payload.
    pub body: ResponseBody,
}

/// Any reply, always delivered on `reply.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// See [`Ack`].
    Ack(Ack),
    /// See [`Nack`].
    Nack(Nack),
    /// See [`Response`].
    Response(Response),
}

impl Reply {
    /// Id of the request being answered.
    pub fn id(&self) -> RequestId {
        match self {
            Reply::Ack(ack) => ack.id,
            Reply::Nack(nack) => nack.id,
            Reply::Response(response) => response.id,
        }
    }

    /// Responding node.
    pub fn node(&self) -> NodeId {
        match self {
            Reply::Ack(ack) => ack.node,
            Reply::Nack(nack) => nack.node,
            Reply::Response(response) => response.node,
        }
    }

    /// Reply route derived from the request id.
    pub fn route(&self) -> String {
        reply_route(self.id())
    }

    /// Returns true for ACKs and data responses.
    pub fn is_positive(&self) -> bool {
        !matches!(self, Reply::Nack(_))
    }

    /// Synthesizes the NACK that stands in for a reply that never came.
    pub fn timed_out(id: RequestId, node: NodeId) -> Self {
        Reply::Nack(Nack {
            id,
            node,
            reason: NackReason::TimedOut,
            offset: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::segment_offset;
    use lexlog_codec::{from_cbor, to_cbor};

    fn commit_envelope() -> Envelope {
        let sender = NodeId::random();
        let trx = Trx::new(sender, 1);
        let tx = Transaction::new(
            trx,
            "orders",
            "s1",
            10,
            1_000,
            vec![
                Bytes::from_static(b"e1"),
                Bytes::from_static(b"e2"),
                Bytes::from_static(b"e3"),
            ],
        );
        Envelope::new(sender, Message::Commit(Commit { transaction: tx }))
    }

    #[test]
    fn commit_envelope_roundtrip() {
        let envelope = commit_envelope();
        let bytes = to_cbor(&envelope).unwrap();
        let decoded: Envelope = from_cbor(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.route(), "trx.commit");
    }

    #[test]
    fn commit_with_empty_payload_is_rejected() {
        #[derive(Serialize)]
        struct Wire {
            d: Bytes,
        }
        #[derive(Serialize)]
        enum FakeMessage {
            Commit { transaction: Wire },
        }
        #[derive(Serialize)]
        struct FakeEnvelope {
            id: RequestId,
            sender: NodeId,
            message: FakeMessage,
        }

        let fake = FakeEnvelope {
            id: RequestId::random(),
            sender: NodeId::random(),
            message: FakeMessage::Commit {
                transaction: Wire { d: Bytes::new() },
            },
        };
        let bytes = to_cbor(&fake).unwrap();
        let err = from_cbor::<Envelope>(&bytes).unwrap_err();
        assert!(err.to_string().contains("compressed data is empty"));
    }

    #[test]
    fn replies_echo_request_identity() {
        let envelope = commit_envelope();
        let responder = NodeId::random();

        let ack = envelope.ack(responder);
        assert_eq!(ack.id(), envelope.id);
        assert_eq!(ack.node(), responder);
        assert_eq!(ack.route(), envelope.reply_route());
        assert!(ack.is_positive());

        let nack = envelope.nack_at(responder, NackReason::Behind, segment_offset("s1", 4));
        assert!(!nack.is_positive());
        match nack {
            Reply::Nack(n) => {
                assert_eq!(n.reason, NackReason::Behind);
                assert_eq!(n.offset, Some(segment_offset("s1", 4)));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn reply_roundtrip() {
        let envelope = Envelope::new(
            NodeId::random(),
            Message::GetSpaces(GetSpaces::default()),
        );
        let reply = envelope.respond(
            NodeId::random(),
            ResponseBody::Names(vec!["orders".into()]),
        );
        let bytes = to_cbor(&reply).unwrap();
        assert_eq!(from_cbor::<Reply>(&bytes).unwrap(), reply);
    }

    #[test]
    fn every_message_reports_its_kind() {
        let node = NodeId::random();
        let message = Message::NodeHeartbeat(NodeHeartbeat { node });
        assert_eq!(message.kind(), MessageKind::NodeHeartbeat);
        assert!(message.kind().is_event());
        assert_eq!(message.route(), "node.healthcheck");
    }
}
