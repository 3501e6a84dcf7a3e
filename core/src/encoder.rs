//! Canonical value encoding.
//!
//! `encode`/`decode` are pure and stateless: every stored value in the
//! engine passes through here exactly once on the way in and once on the
//! way out. The format is a tag-prefixed TLV: `[tag: u8][payload...]`,
//! with lists and maps recursively encoding their element count followed
//! by each encoded element, so a single `decode` call both validates and
//! consumes the entire byte string.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{CResult, Error};

/// A canonically-encodable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Carried as `i128` end to end; see module docs on the engine's
    /// numeric representation.
    Int(i128),
    /// `scale` is the number of digits after the decimal point;
    /// `unscaled` is the full signed mantissa (`unscaled / 10^scale`).
    Decimal { scale: u32, unscaled: i128 },
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Ordered so the encoding is deterministic; insertion order is
    /// preserved across encode/decode round trips.
    Map(Vec<(String, Value)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Decimal = 3,
    Str = 4,
    Bytes = 5,
    List = 6,
    Map = 7,
}

impl Tag {
    fn from_u8(b: u8) -> CResult<Tag> {
        Ok(match b {
            0 => Tag::Null,
            1 => Tag::Bool,
            2 => Tag::Int,
            3 => Tag::Decimal,
            4 => Tag::Str,
            5 => Tag::Bytes,
            6 => Tag::List,
            7 => Tag::Map,
            other => return Err(Error::EncoderError(format!("unknown tag byte: {other}"))),
        })
    }
}

/// Encodes a value into its canonical byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value);
    buf
}

/// Decodes a value, requiring the entire input to be consumed.
pub fn decode(bytes: &[u8]) -> CResult<Value> {
    let mut cursor = Cursor::new(bytes);
    let value = read_value(&mut cursor)?;
    if (cursor.position() as usize) != bytes.len() {
        return Err(Error::EncoderError("trailing garbage after decoded value".to_string()));
    }
    Ok(value)
}

/// The encoded `Tag::Null` tombstone, used by `CacheDriver` to mark a key
/// for deletion at commit time. Never collides with a genuine string value
/// equal to `"null"`, which encodes under `Tag::Str`.
pub fn null_bytes() -> Vec<u8> {
    encode(&Value::Null)
}

pub fn is_null(bytes: &[u8]) -> bool {
    bytes.first() == Some(&(Tag::Null as u8))
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(Tag::Null as u8),
        Value::Bool(b) => {
            buf.push(Tag::Bool as u8);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::Int(n) => {
            buf.push(Tag::Int as u8);
            write_signed_magnitude(buf, *n);
        }
        Value::Decimal { scale, unscaled } => {
            buf.push(Tag::Decimal as u8);
            buf.write_u32::<BigEndian>(*scale).expect("write to Vec never fails");
            write_signed_magnitude(buf, *unscaled);
        }
        Value::Str(s) => {
            buf.push(Tag::Str as u8);
            write_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(Tag::Bytes as u8);
            write_len(buf, b.len());
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.push(Tag::List as u8);
            write_len(buf, items.len());
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Map(entries) => {
            buf.push(Tag::Map as u8);
            write_len(buf, entries.len());
            for (k, v) in entries {
                write_len(buf, k.len());
                buf.extend_from_slice(k.as_bytes());
                write_value(buf, v);
            }
        }
    }
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> CResult<Value> {
    let tag = Tag::from_u8(read_u8(cursor)?)?;
    Ok(match tag {
        Tag::Null => Value::Null,
        Tag::Bool => Value::Bool(read_u8(cursor)? != 0),
        Tag::Int => Value::Int(read_signed_magnitude(cursor)?),
        Tag::Decimal => {
            let scale = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::EncoderError(e.to_string()))?;
            let unscaled = read_signed_magnitude(cursor)?;
            Value::Decimal { scale, unscaled }
        }
        Tag::Str => {
            let len = read_len(cursor)?;
            let bytes = read_exact(cursor, len)?;
            Value::Str(String::from_utf8(bytes).map_err(|e| Error::EncoderError(e.to_string()))?)
        }
        Tag::Bytes => {
            let len = read_len(cursor)?;
            Value::Bytes(read_exact(cursor, len)?)
        }
        Tag::List => {
            let len = read_len(cursor)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_value(cursor)?);
            }
            Value::List(items)
        }
        Tag::Map => {
            let len = read_len(cursor)?;
            let mut entries = Vec::with_capacity(len);
            for _ in 0..len {
                let klen = read_len(cursor)?;
                let kbytes = read_exact(cursor, klen)?;
                let key = String::from_utf8(kbytes).map_err(|e| Error::EncoderError(e.to_string()))?;
                let value = read_value(cursor)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
    })
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.write_u32::<BigEndian>(len as u32).expect("write to Vec never fails");
}

fn read_len(cursor: &mut Cursor<&[u8]>) -> CResult<usize> {
    Ok(cursor.read_u32::<BigEndian>().map_err(|e| Error::EncoderError(e.to_string()))? as usize)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> CResult<u8> {
    cursor.read_u8().map_err(|_| Error::EncoderError("unexpected end of input".to_string()))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> CResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::EncoderError("unexpected end of input".to_string()))?;
    Ok(buf)
}

/// `[sign: u8][len: u8][magnitude: big-endian bytes]`. Canonical: zero is
/// always `sign=0, len=0`, never `sign=1` with an empty magnitude, and the
/// magnitude carries no leading zero byte.
fn write_signed_magnitude(buf: &mut Vec<u8>, n: i128) {
    if n == 0 {
        buf.push(0);
        buf.push(0);
        return;
    }
    let sign: u8 = if n < 0 { 1 } else { 0 };
    // i128::MIN negated overflows; widen through u128's wrapping two's
    // complement negation, which is exact for this case.
    let magnitude_u128 = if n < 0 { (n as u128).wrapping_neg() } else { n as u128 };
    let full = magnitude_u128.to_be_bytes();
    let first_nonzero = full.iter().position(|b| *b != 0).unwrap_or(full.len() - 1);
    let trimmed = &full[first_nonzero..];
    buf.push(sign);
    buf.push(trimmed.len() as u8);
    buf.extend_from_slice(trimmed);
}

fn read_signed_magnitude(cursor: &mut Cursor<&[u8]>) -> CResult<i128> {
    let sign = read_u8(cursor)?;
    let len = read_u8(cursor)? as usize;
    if len > 16 {
        return Err(Error::EncoderError("magnitude wider than 128 bits".to_string()));
    }
    let bytes = read_exact(cursor, len)?;
    let mut full = [0u8; 16];
    full[16 - len..].copy_from_slice(&bytes);
    let magnitude = u128::from_be_bytes(full);
    let value = match sign {
        0 => magnitude as i128,
        1 => (magnitude.wrapping_neg()) as i128,
        other => return Err(Error::EncoderError(format!("invalid sign byte: {other}"))),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let bytes = encode(&v);
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn roundtrips_scalars() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(-1));
        roundtrip(Value::Int(i128::MAX));
        roundtrip(Value::Int(i128::MIN));
        roundtrip(Value::Str("null".to_string()));
        roundtrip(Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn roundtrips_decimal() {
        roundtrip(Value::Decimal { scale: 8, unscaled: -123456 });
        roundtrip(Value::Decimal { scale: 0, unscaled: 0 });
    }

    #[test]
    fn roundtrips_nested_collections() {
        roundtrip(Value::List(vec![Value::Int(1), Value::Null, Value::Bool(false)]));
        roundtrip(Value::Map(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::List(vec![Value::Str("x".to_string())])),
        ]));
    }

    #[test]
    fn null_tombstone_never_collides_with_string_null() {
        let tombstone = null_bytes();
        let string_null = encode(&Value::Str("null".to_string()));
        assert_ne!(tombstone, string_null);
        assert!(is_null(&tombstone));
        assert!(!is_null(&string_null));
    }

    #[test]
    fn zero_is_canonical_not_negative_zero() {
        let encoded = encode(&Value::Int(0));
        // sign byte, len byte
        assert_eq!(&encoded[1..3], &[0u8, 0u8]);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = encode(&Value::Int(5));
        bytes.push(0xFF);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = encode(&Value::Str("hello".to_string()));
        assert!(decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
