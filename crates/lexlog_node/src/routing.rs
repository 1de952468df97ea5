//! Static route table.
//!
//! Every inbound request is dispatched by its [`MessageKind`] to exactly one
//! [`MessageHandler`]. The table is built once when the node starts.

use async_trait::async_trait;
use lexlog_protocol::{Envelope, MessageKind, NackReason, NodeId, Reply};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Serves one or more message kinds.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a request; events return `None`.
    async fn handle(&self, envelope: &Envelope) -> Option<Reply>;
}

/// Maps message kinds to their handlers.
pub struct RoutingTable {
    local: NodeId,
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl RoutingTable {
    /// Creates an empty table for `local`.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            handlers: HashMap::new(),
        }
    }

    /// Routes `kinds` to `handler`, replacing earlier registrations.
    pub fn with_handler(mut self, kinds: &[MessageKind], handler: Arc<dyn MessageHandler>) -> Self {
        for kind in kinds {
            self.handlers.insert(*kind, Arc::clone(&handler));
        }
        self
    }

    /// Returns true if `kind` has a handler.
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Kinds without a handler.
    pub fn unhandled(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.handles(*kind))
            .collect()
    }

    /// Dispatches a request to its handler.
    ///
    /// A request nobody serves is refused; an unserved event is dropped.
    pub async fn dispatch(&self, envelope: &Envelope) -> Option<Reply> {
        let kind = envelope.message.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(envelope).await,
            None if kind.is_event() => None,
            None => {
                warn!(route = kind.route(), sender = %envelope.sender, "no handler for route");
                Some(envelope.nack(self.local, NackReason::Rejected))
            }
        }
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<&'static str> = self.handlers.keys().map(|k| k.route()).collect();
        routes.sort_unstable();
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("routes", &routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexlog_protocol::{GetSpaces, Message, NodeHeartbeat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, envelope: &Envelope) -> Option<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(envelope.ack(envelope.sender))
        }
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let local = NodeId::random();
        let handler = Arc::new(Counting::default());
        let table = RoutingTable::new(local).with_handler(&[MessageKind::GetSpaces], handler.clone());

        let envelope = Envelope::new(NodeId::random(), Message::GetSpaces(GetSpaces::default()));
        let reply = table.dispatch(&envelope).await.unwrap();

        assert!(reply.is_positive());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(table.handles(MessageKind::GetSpaces));
        assert!(table.unhandled().contains(&MessageKind::Peek));
    }

    #[tokio::test]
    async fn unserved_request_is_refused() {
        let local = NodeId::random();
        let table = RoutingTable::new(local);
        let envelope = Envelope::new(NodeId::random(), Message::GetSpaces(GetSpaces::default()));

        match table.dispatch(&envelope).await {
            Some(Reply::Nack(nack)) => {
                assert_eq!(nack.reason, NackReason::Rejected);
                assert_eq!(nack.node, local);
                assert_eq!(nack.id, envelope.id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unserved_event_is_dropped() {
        let table = RoutingTable::new(NodeId::random());
        let node = NodeId::random();
        let envelope = Envelope::new(node, Message::NodeHeartbeat(NodeHeartbeat { node }));
        assert!(table.dispatch(&envelope).await.is_none());
    }
}
