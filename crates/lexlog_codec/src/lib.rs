//! # LexLog Codec
//!
//! Byte-level encodings shared by every LexLog crate.
//!
//! This crate provides:
//! - [`LexKey`], an order-preserving binary key used for offsets
//! - Canonical CBOR framing for wire messages
//! - LZ4 block compression for opaque transaction payloads
//!
//! ## LexKey Rules
//!
//! - Byte-wise comparison of two keys equals the logical order of the parts
//!   they were built from
//! - Text and byte parts are escaped and terminated, so a shorter prefix
//!   always sorts first
//! - Unsigned integers are fixed-width big-endian
//! - Signed integers have their sign bit flipped before big-endian encoding
//!
//! ## Usage
//!
//! ```
//! use lexlog_codec::LexKey;
//!
//! let a = LexKey::builder().text("s1").u64(9).build();
//! let b = LexKey::builder().text("s1").u64(10).build();
//! assert!(a < b);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod compress;
mod error;
mod lexkey;

pub use cbor::{from_cbor, to_cbor};
pub use compress::{compress, decompress};
pub use error::{CodecError, CodecResult};
pub use lexkey::{LexKey, LexKeyBuilder};
