//! Correlation of outbound requests with their replies.
//!
//! Every request carries a fresh [`RequestId`] and its reply travels on
//! `reply.<id>`. The [`ReplyRouter`] maps pending ids to the round waiting
//! for them; a reply that finds no waiter is late and gets dropped.

use crate::error::ClusterResult;
use crate::transport::Transport;
use lexlog_protocol::{Envelope, NodeId, Reply, RequestId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// What happened to an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A round was waiting for it.
    Delivered,
    /// Nobody waits for this id anymore.
    Late,
}

/// Routes inbound replies to the rounds waiting for them.
#[derive(Debug, Clone, Default)]
pub struct ReplyRouter {
    pending: Arc<Mutex<HashMap<RequestId, mpsc::UnboundedSender<Reply>>>>,
}

impl ReplyRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a round that can wait on several requests at once.
    pub fn round(&self) -> ReplyRound {
        let (tx, rx) = mpsc::unbounded_channel();
        ReplyRound {
            router: self.clone(),
            targets: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Hands a reply to its waiting round.
    ///
    /// Each request id is answered at most once; duplicates and replies to
    /// cancelled rounds are reported as [`Delivery::Late`].
    pub fn deliver(&self, reply: Reply) -> Delivery {
        let waiter = self.pending.lock().remove(&reply.id());
        match waiter {
            Some(tx) if tx.send(reply).is_ok() => Delivery::Delivered,
            _ => Delivery::Late,
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends one request and waits for its reply.
    ///
    /// A missing reply is reported as a `TimedOut` NACK from `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the request.
    pub async fn request(
        &self,
        transport: &dyn Transport,
        target: NodeId,
        envelope: Envelope,
        timeout: Duration,
    ) -> ClusterResult<Reply> {
        let id = envelope.id;
        let mut round = self.round();
        round.send(transport, target, envelope)?;
        let reply = round
            .next(Instant::now() + timeout)
            .await
            .map(|(_, reply)| reply)
            .unwrap_or_else(|| Reply::timed_out(id, target));
        Ok(reply)
    }

    fn register(&self, id: RequestId, tx: mpsc::UnboundedSender<Reply>) {
        self.pending.lock().insert(id, tx);
    }

    fn cancel<'a>(&self, ids: impl IntoIterator<Item = &'a RequestId>) {
        let mut pending = self.pending.lock();
        for id in ids {
            pending.remove(id);
        }
    }
}

/// A set of outstanding requests whose replies share one channel.
///
/// Dropping the round cancels every request it still waits for, so replies
/// arriving afterwards are ignored.
#[derive(Debug)]
pub struct ReplyRound {
    router: ReplyRouter,
    targets: HashMap<RequestId, NodeId>,
    tx: mpsc::UnboundedSender<Reply>,
    rx: mpsc::UnboundedReceiver<Reply>,
}

impl ReplyRound {
    /// Registers the request and publishes it to `target`.
    ///
    /// # Errors
    ///
    /// Returns the transport error; the request is then not awaited.
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        target: NodeId,
        envelope: Envelope,
    ) -> ClusterResult<RequestId> {
        let id = envelope.id;
        self.router.register(id, self.tx.clone());
        self.targets.insert(id, target);
        if let Err(err) = transport.publish(target, envelope) {
            self.router.cancel([&id]);
            self.targets.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Waits for the next reply, returning `None` once `deadline` passes.
    ///
    /// Replies are attributed to the node the request was sent to.
    pub async fn next(&mut self, deadline: Instant) -> Option<(NodeId, Reply)> {
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(reply)) => match self.targets.get(&reply.id()) {
                    Some(node) => return Some((*node, reply)),
                    None => debug!(id = %reply.id(), "dropping reply for a foreign request"),
                },
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Number of requests sent through this round.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Drop for ReplyRound {
    fn drop(&mut self) {
        self.router.cancel(self.targets.keys());
    }
}
