//! In-process pub/sub network.
//!
//! Every node attaches an inbox to a shared [`MemoryNetwork`]. Frames are
//! CBOR encoded when published and decoded by the receiving node, so the
//! payload codec runs exactly where a real transport would run it.

use bytes::Bytes;
use lexlog_cluster::{ClusterError, ClusterResult, Transport};
use lexlog_codec::{from_cbor, to_cbor, CodecResult};
use lexlog_protocol::{
    parse_reply_route, Envelope, MessageKind, NodeId, ProtocolError, ProtocolResult, Reply,
    RequestId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A routed unit on the wire.
///
/// The header is readable even when the body is not, so a receiver can
/// always NACK a request it failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Static route or `reply.<id>`.
    pub route: String,
    /// Request identity.
    pub id: RequestId,
    /// Publishing node.
    pub sender: NodeId,
    /// CBOR encoded [`Envelope`] or [`Reply`].
    pub body: Bytes,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A request on a static route.
    Request(Envelope),
    /// A reply on `reply.<id>`.
    Reply(Reply),
}

impl Frame {
    /// Frames a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn request(envelope: &Envelope) -> CodecResult<Self> {
        Ok(Self {
            route: envelope.route().to_string(),
            id: envelope.id,
            sender: envelope.sender,
            body: Bytes::from(to_cbor(envelope)?),
        })
    }

    /// Frames a reply sent by `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be encoded.
    pub fn reply(sender: NodeId, reply: &Reply) -> CodecResult<Self> {
        Ok(Self {
            route: reply.route(),
            id: reply.id(),
            sender,
            body: Bytes::from(to_cbor(reply)?),
        })
    }

    /// Encodes the whole frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    pub fn encode(&self) -> CodecResult<Bytes> {
        Ok(Bytes::from(to_cbor(self)?))
    }

    /// Decodes a frame header and its raw body.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a frame.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }

    /// Returns true if the frame is a request that expects a reply.
    pub fn expects_reply(&self) -> bool {
        MessageKind::from_route(&self.route).is_some_and(|kind| !kind.is_event())
    }

    /// Decodes the body according to the route.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownRoute`] for a route no node serves and
    /// [`ProtocolError::MalformedPayload`] if the body does not decode or
    /// does not match the header.
    pub fn open(&self) -> ProtocolResult<Inbound> {
        if let Some(id) = parse_reply_route(&self.route) {
            let reply: Reply = from_cbor(&self.body).map_err(malformed)?;
            if reply.id() != id {
                return Err(ProtocolError::MalformedPayload(format!(
                    "reply {} travelled on {}",
                    reply.id(),
                    self.route
                )));
            }
            return Ok(Inbound::Reply(reply));
        }

        let kind = MessageKind::from_route(&self.route)
            .ok_or_else(|| ProtocolError::UnknownRoute(self.route.clone()))?;
        let envelope: Envelope = from_cbor(&self.body).map_err(malformed)?;
        if envelope.message.kind() != kind || envelope.id != self.id {
            return Err(ProtocolError::MalformedPayload(format!(
                "{} frame carries {}",
                self.route,
                envelope.route()
            )));
        }
        Ok(Inbound::Request(envelope))
    }
}

fn malformed(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::MalformedPayload(err.to_string())
}

/// Receiving end of an attached node.
pub type Inbox = mpsc::UnboundedReceiver<Bytes>;

#[derive(Debug, Default)]
struct Links {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Bytes>>,
    isolated: HashSet<NodeId>,
}

/// Shared in-memory network connecting the nodes of one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<RwLock<Links>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `node`, replacing any previous inbox it had.
    pub fn attach(&self, node: NodeId) -> (MemoryTransport, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.write().inboxes.insert(node, tx);
        let transport = MemoryTransport {
            network: self.clone(),
            local: node,
        };
        (transport, rx)
    }

    /// Detaches `node`; frames sent to it fail from now on.
    pub fn detach(&self, node: NodeId) {
        self.links.write().inboxes.remove(&node);
    }

    /// Returns true if `node` has an inbox.
    pub fn is_attached(&self, node: NodeId) -> bool {
        self.links.read().inboxes.contains_key(&node)
    }

    /// Silently drops every frame to or from `node`.
    pub fn isolate(&self, node: NodeId) {
        self.links.write().isolated.insert(node);
    }

    /// Ends the isolation of `node`.
    pub fn heal(&self, node: NodeId) {
        self.links.write().isolated.remove(&node);
    }

    /// Delivers a frame from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns a retryable transport error if `to` is not attached.
    pub fn send(&self, from: NodeId, to: NodeId, frame: &Frame) -> ClusterResult<()> {
        let bytes = frame.encode().map_err(ProtocolError::from)?;
        let links = self.links.read();
        if links.isolated.contains(&from) || links.isolated.contains(&to) {
            debug!(%from, %to, route = %frame.route, "dropping frame across partition");
            return Ok(());
        }
        let inbox = links
            .inboxes
            .get(&to)
            .ok_or_else(|| ClusterError::transport_retryable(format!("{to} is not attached")))?;
        inbox
            .send(bytes)
            .map_err(|_| ClusterError::transport_retryable(format!("{to} stopped listening")))
    }
}

/// A node's handle on the [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: NodeId,
}

impl MemoryTransport {
    /// The node this transport publishes as.
    pub fn local(&self) -> NodeId {
        self.local
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, target: NodeId, envelope: Envelope) -> ClusterResult<()> {
        let frame = Frame::request(&envelope).map_err(ProtocolError::from)?;
        self.network.send(self.local, target, &frame)
    }

    fn reply(&self, target: NodeId, reply: Reply) -> ClusterResult<()> {
        let frame = Frame::reply(self.local, &reply).map_err(ProtocolError::from)?;
        self.network.send(self.local, target, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexlog_protocol::{GetSpaces, Message, NodeHeartbeat};

    fn envelope(sender: NodeId) -> Envelope {
        Envelope::new(sender, Message::GetSpaces(GetSpaces::default()))
    }

    #[tokio::test]
    async fn request_and_reply_cross_the_network() {
        let network = MemoryNetwork::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let (ta, mut inbox_a) = network.attach(a);
        let (tb, mut inbox_b) = network.attach(b);

        let request = envelope(a);
        ta.publish(b, request.clone()).unwrap();
        let frame = Frame::decode(&inbox_b.recv().await.unwrap()).unwrap();
        assert_eq!(frame.route, "get_spaces");
        assert!(frame.expects_reply());
        assert_eq!(frame.open().unwrap(), Inbound::Request(request.clone()));

        tb.reply(a, request.ack(b)).unwrap();
        let frame = Frame::decode(&inbox_a.recv().await.unwrap()).unwrap();
        assert_eq!(frame.route, request.reply_route());
        assert_eq!(frame.open().unwrap(), Inbound::Reply(request.ack(b)));
    }

    #[test]
    fn unattached_target_is_a_retryable_error() {
        let network = MemoryNetwork::new();
        let a = NodeId::random();
        let (ta, _inbox) = network.attach(a);

        let err = ta.publish(NodeId::random(), envelope(a)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn isolated_nodes_lose_frames() {
        let network = MemoryNetwork::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let (ta, _inbox_a) = network.attach(a);
        let (_tb, mut inbox_b) = network.attach(b);

        network.isolate(b);
        ta.publish(b, envelope(a)).unwrap();
        assert!(inbox_b.try_recv().is_err());

        network.heal(b);
        ta.publish(b, envelope(a)).unwrap();
        assert!(inbox_b.try_recv().is_ok());
    }

    #[test]
    fn mismatched_route_is_malformed() {
        let sender = NodeId::random();
        let mut frame = Frame::request(&envelope(sender)).unwrap();
        frame.route = "peek".into();
        assert!(matches!(frame.open(), Err(ProtocolError::MalformedPayload(_))));

        frame.route = "nowhere".into();
        assert!(matches!(frame.open(), Err(ProtocolError::UnknownRoute(_))));
    }

    #[test]
    fn garbage_body_is_malformed_but_header_survives() {
        let sender = NodeId::random();
        let mut frame = Frame::request(&envelope(sender)).unwrap();
        frame.body = Bytes::from_static(&[0xff, 0x00, 0x13]);

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender, sender);
        assert!(matches!(decoded.open(), Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn events_expect_no_reply() {
        let node = NodeId::random();
        let frame = Frame::request(&Envelope::new(node, Message::NodeHeartbeat(NodeHeartbeat { node }))).unwrap();
        assert!(!frame.expects_reply());
    }
}
