//! # LexLog Storage
//!
//! Segment log storage for LexLog.
//!
//! This crate defines the interface the replication layer expects from a
//! durable log engine, plus an in-memory implementation used by nodes in
//! tests and ephemeral deployments.
//!
//! ## Design Principles
//!
//! - Segments are append-only and gap-free: an append must continue at
//!   `last_sequence + 1`
//! - Offsets are [`LexKey`]s; reads by offset compare keys byte-wise
//! - Stores must be `Send + Sync` for concurrent access
//! - Stores know nothing about transactions, quorums or staging
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use lexlog_protocol::{NodeId, Transaction, Trx};
//! use lexlog_storage::{LogStore, MemoryLogStore};
//!
//! let store = MemoryLogStore::new();
//! let tx = Transaction::new(
//!     Trx::new(NodeId::random(), 1),
//!     "orders",
//!     "s1",
//!     1,
//!     1_000,
//!     vec![Bytes::from_static(b"hello")],
//! );
//! assert_eq!(store.append("orders", "s1", &tx.entries).unwrap(), (1, 1));
//! assert_eq!(store.last_sequence("orders", "s1").unwrap(), 1);
//! ```
//!
//! [`LexKey`]: lexlog_codec::LexKey

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

mod error;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryLogStore;
pub use store::{LogStore, SegmentBounds};
