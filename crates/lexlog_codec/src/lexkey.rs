//! Order-preserving binary keys.

use crate::error::{CodecError, CodecResult};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;
const SIGN_BIT: u64 = 1 << 63;

/// An order-preserving binary key.
///
/// Two keys built from parts of the same shape compare byte-wise in the same
/// order as the parts themselves. The empty key sorts before every other key
/// and is used as the "zero" offset.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LexKey(Vec<u8>);

impl LexKey {
    /// Returns the empty key.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Starts building a key part by part.
    #[must_use]
    pub fn builder() -> LexKeyBuilder {
        LexKeyBuilder::default()
    }

    /// Wraps bytes that are already in key form.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the key and returns its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Returns true for the zero offset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a reader over the encoded parts.
    #[must_use]
    pub fn reader(&self) -> LexKeyReader<'_> {
        LexKeyReader {
            bytes: &self.0,
            pos: 0,
        }
    }
}

impl fmt::Debug for LexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LexKey(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for LexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<Vec<u8>> for LexKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Builder for [`LexKey`].
#[derive(Debug, Default)]
pub struct LexKeyBuilder {
    buffer: Vec<u8>,
}

impl LexKeyBuilder {
    /// Appends a text part.
    #[must_use]
    pub fn text(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    /// Appends a raw byte part.
    #[must_use]
    pub fn bytes(mut self, value: &[u8]) -> Self {
        for &byte in value {
            if byte == ESCAPE {
                self.buffer.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]);
            } else {
                self.buffer.push(byte);
            }
        }
        self.buffer.extend_from_slice(&[ESCAPE, TERMINATOR]);
        self
    }

    /// Appends an unsigned integer part.
    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a signed integer part.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn i64(mut self, value: i64) -> Self {
        let flipped = (value as u64) ^ SIGN_BIT;
        self.buffer.extend_from_slice(&flipped.to_be_bytes());
        self
    }

    /// Finishes the key.
    #[must_use]
    pub fn build(self) -> LexKey {
        LexKey(self.buffer)
    }
}

/// Reads parts back out of a [`LexKey`] in the order they were written.
#[derive(Debug)]
pub struct LexKeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl LexKeyReader<'_> {
    /// Reads a text part.
    pub fn text(&mut self) -> CodecResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| CodecError::invalid_key("text part is not UTF-8"))
    }

    /// Reads a raw byte part.
    pub fn bytes(&mut self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| CodecError::invalid_key("unterminated byte part"))?;
            self.pos += 1;
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            let marker = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| CodecError::invalid_key("dangling escape"))?;
            self.pos += 1;
            match marker {
                TERMINATOR => return Ok(out),
                ESCAPED_ZERO => out.push(ESCAPE),
                other => {
                    return Err(CodecError::invalid_key(format!(
                        "unknown escape marker {other:#04x}"
                    )))
                }
            }
        }
    }

    /// Reads an unsigned integer part.
    pub fn u64(&mut self) -> CodecResult<u64> {
        let end = self.pos + 8;
        let chunk: [u8; 8] = self
            .bytes
            .get(self.pos..end)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| CodecError::invalid_key("truncated integer part"))?;
        self.pos = end;
        Ok(u64::from_be_bytes(chunk))
    }

    /// Reads a signed integer part.
    #[allow(clippy::cast_possible_wrap)]
    pub fn i64(&mut self) -> CodecResult<i64> {
        Ok((self.u64()? ^ SIGN_BIT) as i64)
    }

    /// Returns true once every byte has been consumed.
    pub fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

impl Serialize for LexKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for LexKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = LexKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<LexKey, E> {
                Ok(LexKey(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<LexKey, E> {
                Ok(LexKey(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LexKey, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(LexKey(out))
            }
        }

        deserializer.deserialize_bytes(KeyVisitor)
    }
}
