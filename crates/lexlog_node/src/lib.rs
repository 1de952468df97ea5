//! # LexLog Node
//!
//! A LexLog node wired to an in-process pub/sub network.
//!
//! This crate provides:
//! - [`MemoryNetwork`], an in-process fabric carrying CBOR frames between nodes
//! - A static [`RoutingTable`] dispatching requests to [`MessageHandler`]s
//! - [`Node`], which runs the replication components and their background tasks
//! - Tracing setup for binaries and tests
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frame   ┌──────────────┐  Envelope  ┌──────────────┐
//! │ network  │ ───────▶ │  inbox loop  │ ─────────▶ │ RoutingTable │
//! └──────────┘          └──────┬───────┘            └──────┬───────┘
//!                              │ Reply                     │
//!                              ▼                           ▼
//!                       ┌──────────────┐            ┌──────────────┐
//!                       │ ReplyRouter  │            │   handlers   │
//!                       └──────────────┘            └──────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! - Every request gets exactly one reply, events get none
//! - A request that cannot be decoded is NACKed as malformed
//! - Requests never wait on each other in the inbox

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

mod error;
mod handlers;
mod network;
mod node;
mod routing;
mod telemetry;

pub use error::{NodeError, NodeResult};
pub use handlers::{
    nack_reason, node_routes, MembershipHandler, NodeContext, OffsetHandler, ProduceHandler,
    QueryHandler, ReplicationHandler, TransactionHandler,
};
pub use network::{Frame, Inbound, Inbox, MemoryNetwork, MemoryTransport};
pub use node::{Node, NodeBuilder};
pub use routing::{MessageHandler, RoutingTable};
pub use telemetry::{init_tracing, try_init_tracing};
