//! LZ4 block compression for opaque payloads.

use crate::error::{CodecError, CodecResult};

/// Compresses a block, prefixing it with its uncompressed size.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Inflates a block produced by [`compress`].
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for an empty block and
/// [`CodecError::DecompressionFailed`] for a corrupt one.
pub fn decompress(data: &[u8]) -> CodecResult<Vec<u8>> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| CodecError::decompression_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_payload_shrinks() {
        let data = vec![7u8; 4096];
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn empty_block_is_rejected() {
        assert_eq!(decompress(&[]).unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn corrupt_block_is_rejected() {
        let result = decompress(&[0x10, 0x00, 0x00, 0x00, 0xf0]);
        assert!(matches!(result, Err(CodecError::DecompressionFailed { .. })));
    }
}
