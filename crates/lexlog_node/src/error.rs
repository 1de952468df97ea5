//! Error types for the node crate.

use lexlog_cluster::{ClusterError, CommitOutcome};
use lexlog_codec::CodecError;
use lexlog_protocol::{NackReason, NodeId, ProtocolError};
use lexlog_storage::StorageError;
use thiserror::Error;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors surfaced by a running node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Replication error.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Frame encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A remote node refused a request.
    #[error("{node} refused {route}: {reason:?}")]
    Rejected {
        /// Refusing node.
        node: NodeId,
        /// Route of the request.
        route: &'static str,
        /// Reason given.
        reason: NackReason,
    },

    /// A remote node answered with an unexpected body.
    #[error("unexpected reply to {route} from {node}")]
    UnexpectedReply {
        /// Answering node.
        node: NodeId,
        /// Route of the request.
        route: &'static str,
    },
}

impl NodeError {
    /// Returns true if retrying the operation may succeed.
    ///
    /// A refusal whose commit outcome is unknown is never retryable: the
    /// leader may have applied the transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Cluster(err) => err.is_retryable(),
            NodeError::Rejected { reason, .. } => {
                matches!(reason, NackReason::Rejected | NackReason::NotLeader)
            }
            _ => false,
        }
    }

    /// Classifies a failed produce.
    ///
    /// A forwarded produce that got no answer, or whose leader failed for a
    /// reason it could not name, may still have been committed.
    pub fn commit_outcome(&self) -> CommitOutcome {
        match self {
            NodeError::Cluster(err) => err.commit_outcome(),
            NodeError::Rejected { reason, .. } => match reason {
                NackReason::TimedOut | NackReason::Unavailable | NackReason::Unknown => {
                    CommitOutcome::Unknown
                }
                NackReason::Rejected
                | NackReason::Conflict
                | NackReason::Behind
                | NackReason::Diverged
                | NackReason::NotLeader
                | NackReason::Malformed => CommitOutcome::NotApplied,
            },
            _ => CommitOutcome::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(reason: NackReason) -> NodeError {
        NodeError::Rejected {
            node: NodeId::random(),
            route: "produce",
            reason,
        }
    }

    #[test]
    fn retryable_errors() {
        assert!(rejected(NackReason::NotLeader).is_retryable());
        assert!(rejected(NackReason::Rejected).is_retryable());
        assert!(!rejected(NackReason::TimedOut).is_retryable());
        assert!(!rejected(NackReason::Unavailable).is_retryable());
        assert!(!rejected(NackReason::Malformed).is_retryable());
        assert!(NodeError::Cluster(ClusterError::transport_retryable("down")).is_retryable());
        assert!(!NodeError::Cluster(ClusterError::Cancelled).is_retryable());
    }

    #[test]
    fn commit_outcomes() {
        assert_eq!(rejected(NackReason::TimedOut).commit_outcome(), CommitOutcome::Unknown);
        assert_eq!(rejected(NackReason::Unavailable).commit_outcome(), CommitOutcome::Unknown);
        assert_eq!(rejected(NackReason::Rejected).commit_outcome(), CommitOutcome::NotApplied);
        assert_eq!(rejected(NackReason::NotLeader).commit_outcome(), CommitOutcome::NotApplied);
        assert_eq!(rejected(NackReason::Malformed).commit_outcome(), CommitOutcome::NotApplied);
        assert_eq!(
            NodeError::Cluster(ClusterError::EmptyTransaction {
                space: "orders".into(),
                segment: "s1".into(),
            })
            .commit_outcome(),
            CommitOutcome::NotApplied
        );
        assert_eq!(
            NodeError::Storage(StorageError::Closed).commit_outcome(),
            CommitOutcome::Unknown
        );
    }

    #[test]
    fn cluster_errors_display_transparently() {
        let err = NodeError::from(ClusterError::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled");
    }
}
