//! On-disk key layout (spec.md §3, "On-disk key layout").
//!
//! Five record classes share one flat keyspace, distinguished by a leading
//! discriminator byte:
//!
//! ```text
//! 'o' region:varint ‖ encoded_internal_key           -> object record
//! 'i' region:varint ‖ index:varint ‖ value ‖ key[len] -> index entry
//! 'I' region:varint ‖ index:varint                    -> usability marker
//! 'c' region:u64be  ‖ checkpoint_no:u64be             -> checkpoint record
//! 'v' region:u64be  ‖ version:u64be                   -> version/ack record
//! ```
//!
//! `region`/`index` inside `'o'`/`'i'`/`'I'` use varints because those
//! records are scanned by prefix far more often than by exact key, and a
//! varint keeps small region ids cheap; `'c'`/`'v'` use fixed-width
//! big-endian integers because the checkpointer and retransmitter routinely
//! range-scan *all* regions in id order and a fixed width keeps that scan a
//! single comparison instead of a varint decode per candidate.

use crate::ids::{IndexId, RegionId, Version};

pub const CLASS_OBJECT: u8 = b'o';
pub const CLASS_INDEX: u8 = b'i';
pub const CLASS_INDEX_MARKER: u8 = b'I';
pub const CLASS_CHECKPOINT: u8 = b'c';
pub const CLASS_VERSION: u8 = b'v';

pub fn object_key(region: RegionId, encoded_internal_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 10 + encoded_internal_key.len());
    out.push(CLASS_OBJECT);
    crate::codec::varint::encode(region.get(), &mut out);
    out.extend_from_slice(encoded_internal_key);
    out
}

/// Prefix covering every object record of one region; used for
/// whole-region scans (`region_iterator`).
pub fn object_region_prefix(region: RegionId) -> Vec<u8> {
    let mut out = vec![CLASS_OBJECT];
    crate::codec::varint::encode(region.get(), &mut out);
    out
}

/// Splits an `'o'` key back into its region and encoded internal key.
pub fn decode_object_key(key: &[u8]) -> Option<(RegionId, &[u8])> {
    if key.first() != Some(&CLASS_OBJECT) {
        return None;
    }
    let (region, used) = crate::codec::varint::decode(&key[1..])?;
    Some((RegionId::new(region), &key[1 + used..]))
}

pub fn index_key(
    region: RegionId,
    index: IndexId,
    encoded_value: &[u8],
    encoded_key: &[u8],
    value_fixed: bool,
    key_fixed: bool,
) -> Vec<u8> {
    let mut out = vec![CLASS_INDEX];
    crate::codec::varint::encode(region.get(), &mut out);
    crate::codec::varint::encode(index.get(), &mut out);
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(encoded_key);
    if !value_fixed && !key_fixed {
        out.extend_from_slice(&(encoded_key.len() as u32).to_be_bytes());
    }
    out
}

/// Prefix covering every index entry for one `(region, index)` pair.
pub fn index_prefix(region: RegionId, index: IndexId) -> Vec<u8> {
    let mut out = vec![CLASS_INDEX];
    crate::codec::varint::encode(region.get(), &mut out);
    crate::codec::varint::encode(index.get(), &mut out);
    out
}

/// Prefix covering index entries for one `(region, index)` whose value
/// encoding starts with `value_prefix` — the building block for range
/// scans (`range_index_iterator`).
pub fn index_value_prefix(region: RegionId, index: IndexId, value_prefix: &[u8]) -> Vec<u8> {
    let mut out = index_prefix(region, index);
    out.extend_from_slice(value_prefix);
    out
}

pub fn index_marker_key(region: RegionId, index: IndexId) -> Vec<u8> {
    let mut out = vec![CLASS_INDEX_MARKER];
    crate::codec::varint::encode(region.get(), &mut out);
    crate::codec::varint::encode(index.get(), &mut out);
    out
}

pub fn checkpoint_key(region: RegionId, checkpoint_no: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(CLASS_CHECKPOINT);
    out.extend_from_slice(&region.get().to_be_bytes());
    out.extend_from_slice(&checkpoint_no.to_be_bytes());
    out
}

pub fn checkpoint_region_prefix(region: RegionId) -> Vec<u8> {
    let mut out = vec![CLASS_CHECKPOINT];
    out.extend_from_slice(&region.get().to_be_bytes());
    out
}

pub fn decode_checkpoint_key(key: &[u8]) -> Option<(RegionId, u64)> {
    if key.len() != 17 || key[0] != CLASS_CHECKPOINT {
        return None;
    }
    let region = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let checkpoint_no = u64::from_be_bytes(key[9..17].try_into().ok()?);
    Some((RegionId::new(region), checkpoint_no))
}

pub fn version_key(region: RegionId, version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(CLASS_VERSION);
    out.extend_from_slice(&region.get().to_be_bytes());
    out.extend_from_slice(&version.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_round_trips_region() {
        let key = object_key(RegionId::new(7), b"abc");
        let (region, internal) = decode_object_key(&key).unwrap();
        assert_eq!(region, RegionId::new(7));
        assert_eq!(internal, b"abc");
    }

    #[test]
    fn object_keys_order_by_encoded_internal_key_within_a_region() {
        let a = object_key(RegionId::new(1), &crate::codec::value::index_encoding(
            &crate::types::Value::Int(1),
        ));
        let b = object_key(RegionId::new(1), &crate::codec::value::index_encoding(
            &crate::types::Value::Int(2),
        ));
        assert!(a < b);
    }

    #[test]
    fn checkpoint_key_round_trips() {
        let key = checkpoint_key(RegionId::new(3), 9);
        assert_eq!(decode_checkpoint_key(&key), Some((RegionId::new(3), 9)));
    }
}
