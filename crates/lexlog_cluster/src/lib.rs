//! # LexLog Cluster
//!
//! Replication protocol for the LexLog segmented log.
//!
//! This crate provides:
//! - Request/reply correlation over any [`Transport`]
//! - Liveness tracking and per-segment quorum snapshots
//! - The leader-side quorum commit [`Coordinator`]
//! - The replica-side [`Participant`]
//! - The offset [`Reconciler`] that repairs lagging replicas
//! - Lazy, restartable space and segment [`Enumerator`]s
//!
//! ## Architecture
//!
//! A write is owned by the leader of its segment:
//! 1. The leader reserves a contiguous sequence range
//! 2. Every member of the current quorum stages the transaction and votes
//! 3. Enough ACKs commit it; any NACK rolls it back
//! 4. The decision is broadcast, and replicas that miss it are caught up
//!    later by the reconciler
//!
//! ## Key Invariants
//!
//! - Committed ranges on a segment are disjoint and gap-free
//! - A producer only sees success after quorum commit
//! - Terminal transaction states never change
//! - Replay never sends an entry at or before the offset a replica reported
//! - A replica ahead of its leader is reported, never rewritten

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

mod config;
mod coordinator;
mod enumerate;
mod error;
mod ledger;
mod membership;
mod participant;
mod reconciler;
mod reply;
mod transport;

pub use config::{ClusterConfig, QuorumPolicy, RetryConfig};
pub use coordinator::{CommitReceipt, Coordinator};
pub use enumerate::Enumerator;
pub use error::{ClusterError, ClusterResult, CommitOutcome};
pub use ledger::{Decision, SegmentLedger, TrackedTransaction, Vote};
pub use membership::{
    Assignment, Liveness, MembershipEvent, MembershipTracker, QuorumSnapshot, SegmentKey,
};
pub use participant::{Participant, StagedTransaction};
pub use reconciler::{
    answer_segment_offset, answer_space_offset, Divergence, OffsetCheck, ReconcileReport, Reconciler,
};
pub use reply::{Delivery, ReplyRound, ReplyRouter};
pub use transport::{MockTransport, Transport};
