//! Error types for the protocol crate.

use lexlog_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A transaction payload was empty or could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A transaction violates its structural invariants.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A route string does not name any known message kind.
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    /// Frame encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}
