//! Attribute encodings: storage serialization (the bytes that land inside
//! an `'o'` record's value) and index encoding (the order-preserving bytes
//! used inside `'i'` record keys).
//!
//! spec.md §3, "Encodings": integers are sign-flipped big-endian so
//! lexicographic order matches signed order; floats prefix the
//! little-endian IEEE-754 bytes with a big-endian 64-bit hash so scans
//! cluster by hash while exact-match lookups stay possible; strings pass
//! through untouched; composites index by element (list/set) or key (map).

use crate::error::{EngineError, EngineResult};
use crate::types::{AttributeType, OrdValue, PrimitiveType, Value};

/// Whether a type's index encoding has a fixed byte width. Callers that
/// need to delimit a variable-width encoded value inside a longer key (the
/// `'i'` record per spec.md §3) append a `u32` length only when neither the
/// value encoding nor the key encoding is fixed-size.
pub fn is_fixed_size(ty: AttributeType) -> bool {
    match ty {
        AttributeType::Int64 | AttributeType::Timestamp | AttributeType::Float => true,
        AttributeType::String => false,
        AttributeType::List(_) | AttributeType::Set(_) | AttributeType::Map(_) => false,
    }
}

fn primitive_fixed_size(ty: PrimitiveType) -> bool {
    !matches!(ty, PrimitiveType::String)
}

/// Order-preserving encoding of a single scalar `Value`, used both for
/// primary-key ranges (attr 0) and for secondary index entries.
pub fn index_encoding(value: &Value) -> Vec<u8> {
    match value {
        Value::Int(v) => encode_i64_ordered(*v).to_vec(),
        Value::Timestamp(v) => encode_i64_ordered(*v).to_vec(),
        Value::Float(v) => encode_f64_ordered(*v),
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::List(_) | Value::Set(_) | Value::Map(_) => {
            panic!("index_encoding called on a container; encode elements individually")
        }
    }
}

pub fn index_encoding_ord(value: &OrdValue) -> Vec<u8> {
    match value {
        OrdValue::Int(v) => encode_i64_ordered(*v).to_vec(),
        OrdValue::FloatBits(bytes) => bytes.clone(),
        OrdValue::Str(s) => s.as_bytes().to_vec(),
    }
}

fn encode_i64_ordered(v: i64) -> [u8; 8] {
    ((v as u64) ^ 0x8000_0000_0000_0000u64).to_be_bytes()
}

fn decode_i64_ordered(bytes: &[u8; 8]) -> i64 {
    (u64::from_be_bytes(*bytes) ^ 0x8000_0000_0000_0000u64) as i64
}

fn encode_f64_ordered(v: f64) -> Vec<u8> {
    let le = v.to_le_bytes();
    let hash = blake3::hash(&le);
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&hash.as_bytes()[..8]);
    out.extend_from_slice(&le);
    out
}

/// Inverts `index_encoding` for the scalar types whose encoding is
/// reversible (everything but float, whose hash prefix is one-way — the
/// trailing little-endian bytes are still the original float, so those
/// are recovered instead). Used to recover a primary key from an index
/// entry's trailing key bytes during a search scan.
pub fn index_encoding_to_value(bytes: &[u8], ty: AttributeType) -> Value {
    match ty {
        AttributeType::Int64 => {
            let arr: [u8; 8] = bytes.try_into().unwrap_or([0; 8]);
            Value::Int(decode_i64_ordered(&arr))
        }
        AttributeType::Timestamp => {
            let arr: [u8; 8] = bytes.try_into().unwrap_or([0; 8]);
            Value::Timestamp(decode_i64_ordered(&arr))
        }
        AttributeType::Float => {
            let le: [u8; 8] = bytes.get(8..16).and_then(|s| s.try_into().ok()).unwrap_or([0; 8]);
            Value::Float(f64::from_le_bytes(le))
        }
        AttributeType::String => Value::Str(String::from_utf8_lossy(bytes).into_owned()),
        AttributeType::List(_) | AttributeType::Set(_) | AttributeType::Map(_) => {
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Converts an `OrdValue` (used as set elements / map keys) into an
/// order-preserving encoding, matching `index_encoding`'s float handling.
pub fn ord_value_of(value: &Value) -> Option<OrdValue> {
    match value {
        Value::Int(v) => Some(OrdValue::Int(*v)),
        Value::Str(s) => Some(OrdValue::Str(s.clone())),
        Value::Float(v) => Some(OrdValue::FloatBits(encode_f64_ordered(*v))),
        _ => None,
    }
}

/// Serializes one attribute's value for storage inside an `'o'` record:
/// `len ‖ bytes`. The declared type tells `decode_attr` how to parse the
/// bytes back; no type tag is stored on disk.
pub fn encode_attr(value: &Value, out: &mut Vec<u8>) {
    let mut body = Vec::new();
    encode_attr_body(value, &mut body);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
}

fn encode_attr_body(value: &Value, body: &mut Vec<u8>) {
    match value {
        Value::Str(s) => body.extend_from_slice(s.as_bytes()),
        Value::Int(v) => body.extend_from_slice(&v.to_be_bytes()),
        Value::Timestamp(v) => body.extend_from_slice(&v.to_be_bytes()),
        Value::Float(v) => body.extend_from_slice(&v.to_le_bytes()),
        Value::List(items) => {
            body.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_attr(item, body);
            }
        }
        Value::Set(items) => {
            body.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                let v = ord_value_to_value(item);
                encode_attr(&v, body);
            }
        }
        Value::Map(items) => {
            body.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for (k, v) in items {
                encode_attr(&ord_value_to_value(k), body);
                encode_attr(v, body);
            }
        }
    }
}

fn ord_value_to_value(v: &OrdValue) -> Value {
    match v {
        OrdValue::Str(s) => Value::Str(s.clone()),
        OrdValue::Int(i) => Value::Int(*i),
        OrdValue::FloatBits(bytes) => {
            let le: [u8; 8] = bytes[8..16].try_into().unwrap_or([0; 8]);
            Value::Float(f64::from_le_bytes(le))
        }
    }
}

/// Reads one `len ‖ bytes` attribute from the front of `buf`, returning the
/// decoded value and the number of bytes consumed.
pub fn decode_attr(ty: AttributeType, buf: &[u8]) -> EngineResult<(Value, usize)> {
    if buf.len() < 4 {
        return Err(bad_encoding("truncated attribute length"));
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let body_start = 4;
    let body_end = body_start
        .checked_add(len)
        .ok_or_else(|| bad_encoding("attribute length overflow"))?;
    if buf.len() < body_end {
        return Err(bad_encoding("truncated attribute body"));
    }
    let body = &buf[body_start..body_end];
    let value = decode_attr_body(ty, body)?;
    Ok((value, body_end))
}

fn decode_attr_body(ty: AttributeType, body: &[u8]) -> EngineResult<Value> {
    match ty {
        AttributeType::String => Ok(Value::Str(
            String::from_utf8(body.to_vec()).map_err(|e| bad_encoding(&e.to_string()))?,
        )),
        AttributeType::Int64 => {
            let bytes: [u8; 8] = body
                .try_into()
                .map_err(|_| bad_encoding("int64 attribute wrong width"))?;
            Ok(Value::Int(i64::from_be_bytes(bytes)))
        }
        AttributeType::Timestamp => {
            let bytes: [u8; 8] = body
                .try_into()
                .map_err(|_| bad_encoding("timestamp attribute wrong width"))?;
            Ok(Value::Timestamp(i64::from_be_bytes(bytes)))
        }
        AttributeType::Float => {
            let bytes: [u8; 8] = body
                .try_into()
                .map_err(|_| bad_encoding("float attribute wrong width"))?;
            Ok(Value::Float(f64::from_le_bytes(bytes)))
        }
        AttributeType::List(elem) => {
            let mut items = Vec::new();
            let count = read_u32(body, 0)?;
            let mut pos = 4;
            for _ in 0..count {
                let (v, used) = decode_attr(primitive_as_attr(elem), &body[pos..])?;
                items.push(v);
                pos += used;
            }
            Ok(Value::List(items))
        }
        AttributeType::Set(elem) => {
            let mut items = std::collections::BTreeSet::new();
            let count = read_u32(body, 0)?;
            let mut pos = 4;
            for _ in 0..count {
                let (v, used) = decode_attr(primitive_as_attr(elem), &body[pos..])?;
                pos += used;
                if let Some(ord) = ord_value_of(&v) {
                    items.insert(ord);
                }
            }
            Ok(Value::Set(items))
        }
        AttributeType::Map(key_ty) => {
            let mut items = std::collections::BTreeMap::new();
            let count = read_u32(body, 0)?;
            let mut pos = 4;
            for _ in 0..count {
                let (k, used) = decode_attr(primitive_as_attr(key_ty), &body[pos..])?;
                pos += used;
                // Map values are themselves untyped in this expansion's
                // minimal schema surface; stored as strings unless the
                // caller's schema narrows further.
                let (v, used2) = decode_attr(AttributeType::String, &body[pos..])?;
                pos += used2;
                if let Some(ord) = ord_value_of(&k) {
                    items.insert(ord, v);
                }
            }
            Ok(Value::Map(items))
        }
    }
}

fn primitive_as_attr(p: PrimitiveType) -> AttributeType {
    match p {
        PrimitiveType::String => AttributeType::String,
        PrimitiveType::Int64 => AttributeType::Int64,
        PrimitiveType::Float => AttributeType::Float,
    }
}

fn read_u32(buf: &[u8], at: usize) -> EngineResult<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .ok_or_else(|| bad_encoding("truncated length prefix"))
}

fn bad_encoding(reason: &str) -> EngineError {
    EngineError::BadEncoding {
        region: 0,
        key_hex: String::new(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn int_ordering_matches_signed_order() {
        let a = index_encoding(&Value::Int(-5));
        let b = index_encoding(&Value::Int(3));
        assert!(a < b);
        let c = index_encoding(&Value::Int(i64::MIN));
        let d = index_encoding(&Value::Int(i64::MAX));
        assert!(c < d);
    }

    #[test]
    fn attr_round_trip_scalar() {
        for v in [Value::Int(42), Value::Str("hi".into()), Value::Float(3.5)] {
            let ty = match &v {
                Value::Int(_) => AttributeType::Int64,
                Value::Str(_) => AttributeType::String,
                Value::Float(_) => AttributeType::Float,
                _ => unreachable!(),
            };
            let mut buf = Vec::new();
            encode_attr(&v, &mut buf);
            let (decoded, used) = decode_attr(ty, &buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, buf.len());
        }
    }

    proptest! {
        #[test]
        fn int_encoding_round_trips(v in any::<i64>()) {
            let enc = encode_i64_ordered(v);
            prop_assert_eq!(decode_i64_ordered(&enc), v);
        }

        #[test]
        fn int_order_preserving(a in any::<i64>(), b in any::<i64>()) {
            let ea = encode_i64_ordered(a);
            let eb = encode_i64_ordered(b);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }
    }
}
