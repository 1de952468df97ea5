//! Transport abstraction for cluster messages.

use crate::error::{ClusterError, ClusterResult};
use crate::reply::ReplyRouter;
use lexlog_protocol::{Envelope, NodeId, Reply};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Delivers requests and replies between nodes.
///
/// Both operations are fire-and-forget: the transport hands the message to
/// the network and returns. Replies come back through
/// [`ReplyRouter::deliver`] on the receiving side.
pub trait Transport: Send + Sync {
    /// Publishes a request on its static route at `target`.
    fn publish(&self, target: NodeId, envelope: Envelope) -> ClusterResult<()>;

    /// Sends a reply on its `reply.<id>` route at `target`.
    fn reply(&self, target: NodeId, reply: Reply) -> ClusterResult<()>;
}

type Responder = dyn Fn(NodeId, &Envelope) -> Option<Reply> + Send + Sync;

/// A transport for tests that records traffic and can answer requests.
pub struct MockTransport {
    connected: AtomicBool,
    published: Mutex<Vec<(NodeId, Envelope)>>,
    replies: Mutex<Vec<(NodeId, Reply)>>,
    responder: Option<(ReplyRouter, Box<Responder>)>,
}

impl MockTransport {
    /// Creates a transport that records but never answers.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            responder: None,
        }
    }

    /// Creates a transport that answers each request with `responder` and
    /// delivers the answer to `router`.
    pub fn with_responder<F>(router: ReplyRouter, responder: F) -> Self
    where
        F: Fn(NodeId, &Envelope) -> Option<Reply> + Send + Sync + 'static,
    {
        Self {
            responder: Some((router, Box::new(responder))),
            ..Self::new()
        }
    }

    /// Every request published so far.
    pub fn published(&self) -> Vec<(NodeId, Envelope)> {
        self.published.lock().clone()
    }

    /// Routes of requests published to `target`, in order.
    pub fn routes_to(&self, target: NodeId) -> Vec<&'static str> {
        self.published
            .lock()
            .iter()
            .filter(|(node, _)| *node == target)
            .map(|(_, envelope)| envelope.route())
            .collect()
    }

    /// Every reply sent so far.
    pub fn replies(&self) -> Vec<(NodeId, Reply)> {
        self.replies.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn check_connected(&self) -> ClusterResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::transport_retryable("not connected"))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.connected)
            .field("published", &self.published.lock().len())
            .field("replies", &self.replies.lock().len())
            .finish()
    }
}

impl Transport for MockTransport {
    fn publish(&self, target: NodeId, envelope: Envelope) -> ClusterResult<()> {
        self.check_connected()?;
        let answer = self
            .responder
            .as_ref()
            .and_then(|(router, respond)| respond(target, &envelope).map(|reply| (router, reply)));
        self.published.lock().push((target, envelope));
        if let Some((router, reply)) = answer {
            router.deliver(reply);
        }
        Ok(())
    }

    fn reply(&self, target: NodeId, reply: Reply) -> ClusterResult<()> {
        self.check_connected()?;
        self.replies.lock().push((target, reply));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexlog_protocol::{Message, NodeHeartbeat};

    fn heartbeat(node: NodeId) -> Envelope {
        Envelope::new(node, Message::NodeHeartbeat(NodeHeartbeat { node }))
    }

    #[test]
    fn mock_transport_records_traffic() {
        let local = NodeId::random();
        let peer = NodeId::random();
        let transport = MockTransport::new();

        transport.publish(peer, heartbeat(local)).unwrap();
        let envelope = heartbeat(local);
        transport.reply(peer, envelope.ack(local)).unwrap();

        assert_eq!(transport.routes_to(peer), vec!["node.healthcheck"]);
        assert_eq!(transport.replies().len(), 1);
    }

    #[test]
    fn mock_transport_not_connected_error() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let result = transport.publish(NodeId::random(), heartbeat(NodeId::random()));
        assert!(matches!(result, Err(ClusterError::Transport { retryable: true, .. })));
        assert!(transport.published().is_empty());
    }
}
