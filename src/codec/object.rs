//! Serialization of an `'o'` record's value: `version ‖ count ‖ (len ‖ bytes)*`
//! for every attribute beyond the primary key (spec.md §3).

use crate::error::{EngineError, EngineResult};
use crate::types::{AttributeType, Value};

pub fn encode(version: u64, attrs: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    for attr in attrs {
        crate::codec::value::encode_attr(attr, &mut out);
    }
    out
}

/// Decodes the object record body given the schema's secondary attribute
/// types (attribute 0, the primary key, is not stored redundantly in the
/// value — it is already the key).
pub fn decode(bytes: &[u8], attr_types: &[AttributeType]) -> EngineResult<(u64, Vec<Value>)> {
    if bytes.len() < 10 {
        return Err(EngineError::BadEncoding {
            region: 0,
            key_hex: String::new(),
            reason: "object record shorter than version+count header".into(),
        });
    }
    let version = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let count = u16::from_be_bytes(bytes[8..10].try_into().unwrap()) as usize;
    let mut attrs = Vec::with_capacity(count);
    let mut pos = 10;
    for i in 0..count {
        let ty = *attr_types.get(i).ok_or_else(|| EngineError::BadEncoding {
            region: 0,
            key_hex: String::new(),
            reason: format!("schema has no type for attribute {i}"),
        })?;
        let (value, used) = crate::codec::value::decode_attr(ty, &bytes[pos..])?;
        attrs.push(value);
        pos += used;
    }
    Ok((version, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let attrs = vec![Value::Str("hello".into()), Value::Int(7)];
        let types = [AttributeType::String, AttributeType::Int64];
        let bytes = encode(42, &attrs);
        let (version, decoded) = decode(&bytes, &types).unwrap();
        assert_eq!(version, 42);
        assert_eq!(decoded, attrs);
    }
}
