//! Error types for cluster operations.

use lexlog_codec::LexKey;
use lexlog_protocol::{NackReason, NodeId, ProtocolError, TransactionStatus, Trx};
use lexlog_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Whether a failed append may still have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The leader decided against the transaction; no replica applies it.
    NotApplied,
    /// The transaction may or may not have been applied.
    Unknown,
}

/// Errors that can occur during cluster operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A reserved range overlaps a committed transaction.
    #[error("sequence conflict on {space}/{segment}: [{first}, {last}] overlaps a committed range")]
    SequenceConflict {
        /// Space name.
        space: String,
        /// Segment name.
        segment: String,
        /// First sequence of the offending range.
        first: u64,
        /// Last sequence of the offending range.
        last: u64,
    },

    /// Not enough members are alive to reach the commit threshold.
    #[error("quorum unreachable for {space}/{segment}")]
    QuorumUnreachable {
        /// Space name.
        space: String,
        /// Segment name.
        segment: String,
    },

    /// The commit round ended without enough ACKs.
    #[error("transaction {trx} timed out with {acks} of {threshold} acks")]
    Timeout {
        /// Transaction identity.
        trx: Trx,
        /// Distinct ACKs from current members.
        acks: usize,
        /// ACKs that were required.
        threshold: usize,
    },

    /// A member vetoed the transaction.
    #[error("transaction {trx} rolled back: {node} replied {reason:?}")]
    RolledBack {
        /// Transaction identity.
        trx: Trx,
        /// The vetoing member.
        node: NodeId,
        /// Why the member refused.
        reason: NackReason,
    },

    /// The leader could not apply a transaction its quorum agreed on; the
    /// transaction was rolled back.
    #[error("{trx} not applied on the leader: {source}")]
    ApplyFailed {
        /// Transaction identity.
        trx: Trx,
        /// Why the local append failed.
        #[source]
        source: StorageError,
    },

    /// A replica holds history the leader never committed.
    #[error("offset divergence on {node} for {space}: leader at {leader}, node at {replica}")]
    OffsetDivergence {
        /// The diverging node.
        node: NodeId,
        /// Space name.
        space: String,
        /// Segment name, if the probe was per segment.
        segment: Option<String>,
        /// Leader's committed offset.
        leader: LexKey,
        /// Offset the node reported.
        replica: LexKey,
    },

    /// A transaction payload could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A producer asked to append nothing.
    #[error("empty transaction for {space}/{segment}")]
    EmptyTransaction {
        /// Space name.
        space: String,
        /// Segment name.
        segment: String,
    },

    /// The local node does not lead the segment.
    #[error("not the leader of {space}/{segment}")]
    NotLeader {
        /// Space name.
        space: String,
        /// Segment name.
        segment: String,
        /// The current leader, if one is assigned.
        leader: Option<NodeId>,
    },

    /// A transaction id is not known to this node.
    #[error("unknown transaction {0}")]
    UnknownTransaction(Uuid),

    /// A transaction was asked to make an illegal transition.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: TransactionStatus,
        /// Requested status.
        to: TransactionStatus,
    },

    /// A request got no reply in time.
    #[error("{node} did not answer {route}")]
    Unresponsive {
        /// Target node.
        node: NodeId,
        /// Route of the request.
        route: &'static str,
    },

    /// A request was refused for a reason the caller cannot act on.
    #[error("{node} refused {route}: {reason:?}")]
    Refused {
        /// Refusing node.
        node: NodeId,
        /// Route of the request.
        route: &'static str,
        /// Reason given.
        reason: NackReason,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClusterError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Transport { retryable, .. } => *retryable,
            ClusterError::Timeout { .. }
            | ClusterError::QuorumUnreachable { .. }
            | ClusterError::ApplyFailed { .. }
            | ClusterError::Unresponsive { .. } => true,
            _ => false,
        }
    }

    /// Classifies a failed append for the producer.
    pub fn commit_outcome(&self) -> CommitOutcome {
        match self {
            ClusterError::SequenceConflict { .. }
            | ClusterError::QuorumUnreachable { .. }
            | ClusterError::Timeout { .. }
            | ClusterError::RolledBack { .. }
            | ClusterError::ApplyFailed { .. }
            | ClusterError::MalformedPayload(_)
            | ClusterError::EmptyTransaction { .. }
            | ClusterError::NotLeader { .. }
            | ClusterError::Protocol(_) => CommitOutcome::NotApplied,
            _ => CommitOutcome::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trx() -> Trx {
        Trx::new(NodeId::random(), 1)
    }

    #[test]
    fn retryable_errors() {
        assert!(ClusterError::transport_retryable("connection lost").is_retryable());
        assert!(!ClusterError::transport_fatal("bad frame").is_retryable());
        assert!(ClusterError::Timeout {
            trx: trx(),
            acks: 1,
            threshold: 2
        }
        .is_retryable());
        assert!(ClusterError::QuorumUnreachable {
            space: "orders".into(),
            segment: "s1".into()
        }
        .is_retryable());
        assert!(!ClusterError::SequenceConflict {
            space: "orders".into(),
            segment: "s1".into(),
            first: 1,
            last: 2
        }
        .is_retryable());
        assert!(!ClusterError::MalformedPayload("empty".into()).is_retryable());
        assert!(!ClusterError::Cancelled.is_retryable());
    }

    #[test]
    fn commit_outcomes() {
        let vetoed = ClusterError::RolledBack {
            trx: trx(),
            node: NodeId::random(),
            reason: NackReason::Conflict,
        };
        assert_eq!(vetoed.commit_outcome(), CommitOutcome::NotApplied);
        assert_eq!(
            ClusterError::Timeout {
                trx: trx(),
                acks: 0,
                threshold: 2
            }
            .commit_outcome(),
            CommitOutcome::NotApplied
        );
        assert_eq!(
            ClusterError::Storage(StorageError::Closed).commit_outcome(),
            CommitOutcome::Unknown
        );
        assert_eq!(
            ClusterError::Unresponsive {
                node: NodeId::random(),
                route: "produce"
            }
            .commit_outcome(),
            CommitOutcome::Unknown
        );
    }

    #[test]
    fn error_display() {
        let err = ClusterError::QuorumUnreachable {
            space: "orders".into(),
            segment: "s1".into(),
        };
        assert_eq!(err.to_string(), "quorum unreachable for orders/s1");
    }
}
