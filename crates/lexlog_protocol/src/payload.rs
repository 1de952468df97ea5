//! Opaque compressed transaction payloads.
//!
//! On the wire a [`Transaction`] is a single field `d` holding the LZ4
//! compressed CBOR encoding of the record. The module doubles as a
//! `#[serde(with = "...")]` adapter so the codec only runs when a message is
//! framed for the transport.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::Transaction;
use bytes::Bytes;
use lexlog_codec::{compress, decompress, from_cbor, to_cbor};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
struct Wire {
    d: Bytes,
}

/// Encodes a transaction into its compressed payload.
///
/// # Errors
///
/// Returns an error if the record cannot be serialized.
pub fn encode_transaction(transaction: &Transaction) -> ProtocolResult<Vec<u8>> {
    let raw = to_cbor(transaction)?;
    Ok(compress(&raw))
}

/// Decodes and validates a compressed payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the payload is empty,
/// corrupt, or describes a structurally invalid transaction.
pub fn decode_transaction(d: &[u8]) -> ProtocolResult<Transaction> {
    if d.is_empty() {
        return Err(ProtocolError::MalformedPayload(
            "compressed data is empty".into(),
        ));
    }
    let raw = decompress(d).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    let transaction: Transaction =
        from_cbor(&raw).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    transaction
        .validate()
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    Ok(transaction)
}

/// Serde adapter: writes a transaction as `{ "d": <payload> }`.
pub fn serialize<S: Serializer>(transaction: &Transaction, serializer: S) -> Result<S::Ok, S::Error> {
    let d = encode_transaction(transaction).map_err(S::Error::custom)?;
    Wire { d: Bytes::from(d) }.serialize(serializer)
}

/// Serde adapter: reads a transaction from `{ "d": <payload> }`.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Transaction, D::Error> {
    let wire = Wire::deserialize(deserializer)?;
    decode_transaction(&wire.d).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeId, Trx};

    fn sample() -> Transaction {
        let trx = Trx::new(NodeId::random(), 7);
        let payloads = vec![Bytes::from_static(b"e1"), Bytes::from_static(b"e2")];
        Transaction::new(trx, "orders", "s1", 1, 1_700_000_000_000, payloads)
    }

    #[test]
    fn payload_roundtrip() {
        let tx = sample();
        let d = encode_transaction(&tx).unwrap();
        assert_eq!(decode_transaction(&d).unwrap(), tx);
    }

    #[test]
    fn empty_payload_is_malformed() {
        let err = decode_transaction(&[]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MalformedPayload("compressed data is empty".into())
        );
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = decode_transaction(&[0x03, 0, 0, 0, 0x30, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn invalid_record_is_malformed() {
        let mut tx = sample();
        tx.last_sequence = 9;
        let d = encode_transaction(&tx).unwrap();
        assert!(matches!(
            decode_transaction(&d),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
