//! CBOR framing for wire messages.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for an empty slice and
/// [`CodecError::DecodingFailed`] for anything that does not parse as `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LexKey;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        space: String,
        offset: LexKey,
    }

    #[test]
    fn struct_with_key_roundtrip() {
        let probe = Probe {
            space: "orders".into(),
            offset: LexKey::builder().text("s1").u64(3).build(),
        };
        let bytes = to_cbor(&probe).unwrap();
        let decoded: Probe = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn empty_input_is_rejected() {
        let result: CodecResult<Probe> = from_cbor(&[]);
        assert_eq!(result.unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn garbage_is_rejected() {
        let result: CodecResult<Probe> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }
}
