//! # LexLog Protocol
//!
//! Wire contract for the LexLog replicated log.
//!
//! This crate provides:
//! - The data model (`Entry`, `Transaction`, `Trx`, node and request ids)
//! - Every request and event message, tagged by a closed [`MessageKind`]
//! - Static routes per kind and `reply.<id>` reply routes
//! - The opaque compressed `d` payload used for transaction records
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod model;
pub mod payload;
mod route;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Ack, CheckSegmentOffset, CheckSpaceOffset, ClusterStatus, Commit, ConsumeSegment,
    ConsumeSpace, EntryPage, EnumerateSegment, EnumerateSpace, Envelope, Finalize, GetSegments,
    GetSpaces, GetStatus, Message, Nack, NackReason, NodeHeartbeat, NodeShutdown, Peek, Produce,
    Produced, QuorumChanged, Reconcile, Replay, Reply, Response, ResponseBody, Rollback,
    Synchronize,
};
pub use model::{
    now_millis, segment_offset, space_offset, Entry, NodeId, RequestId, SequenceRange,
    TimestampWindow, Transaction, TransactionStatus, Trx,
};
pub use route::{parse_reply_route, reply_route, MessageKind, REPLY_PREFIX};

pub use lexlog_codec::LexKey;
