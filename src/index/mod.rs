//! Index info / iterator building blocks (component D, spec.md §4.D).
//!
//! `index_changes` computes the set of `'i'`-record puts and deletes a
//! mutation requires; containers (list/set/map) are diffed element-wise so
//! only the symmetric difference of old and new elements is touched.

use std::collections::BTreeSet;

use crate::codec::value;
use crate::ids::IndexId;
use crate::types::{AttributeType, PrimitiveType, Value};

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub id: IndexId,
    /// Attribute position this index is built over (0 = primary key, but
    /// the primary key is never indexed through this path — only
    /// secondary attributes are).
    pub attr: usize,
    pub ty: AttributeType,
}

impl IndexSpec {
    /// Whether the *element* encoding (for containers, one element; for
    /// scalars, the value itself) is fixed-width.
    pub fn element_fixed(&self) -> bool {
        match self.ty {
            AttributeType::List(p) | AttributeType::Set(p) | AttributeType::Map(p) => {
                !matches!(p, PrimitiveType::String)
            }
            other => value::is_fixed_size(other),
        }
    }
}

#[derive(Debug, Default)]
pub struct IndexChange {
    /// Full `'i'`-record keys to delete.
    pub deletes: Vec<Vec<u8>>,
    /// Full `'i'`-record keys to put (value is always empty).
    pub puts: Vec<Vec<u8>>,
}

/// Computes the index entries that must change for attribute `spec.attr`
/// going from `old` to `new`. `key_encoded`/`key_fixed` describe the
/// primary key's own encoding, appended after the indexed value in every
/// entry (spec.md §3's `'i'` layout).
pub fn index_changes(
    spec: &IndexSpec,
    region: crate::ids::RegionId,
    key_encoded: &[u8],
    key_fixed: bool,
    old: Option<&Value>,
    new: Option<&Value>,
) -> IndexChange {
    let mut change = IndexChange::default();
    let value_fixed = spec.element_fixed();

    let is_container = matches!(spec.ty, AttributeType::List(_) | AttributeType::Set(_) | AttributeType::Map(_));

    if is_container {
        let old_elems = old.map(container_elements).unwrap_or_default();
        let new_elems = new.map(container_elements).unwrap_or_default();
        for elem in old_elems.difference(&new_elems) {
            change.deletes.push(crate::codec::key::index_key(
                region, spec.id, elem, key_encoded, value_fixed, key_fixed,
            ));
        }
        for elem in new_elems.difference(&old_elems) {
            change.puts.push(crate::codec::key::index_key(
                region, spec.id, elem, key_encoded, value_fixed, key_fixed,
            ));
        }
        return change;
    }

    let old_enc = old.map(value::index_encoding);
    let new_enc = new.map(value::index_encoding);
    if old_enc == new_enc {
        return change;
    }
    if let Some(enc) = old_enc {
        change.deletes.push(crate::codec::key::index_key(
            region, spec.id, &enc, key_encoded, value_fixed, key_fixed,
        ));
    }
    if let Some(enc) = new_enc {
        change.puts.push(crate::codec::key::index_key(
            region, spec.id, &enc, key_encoded, value_fixed, key_fixed,
        ));
    }
    change
}

fn container_elements(value: &Value) -> BTreeSet<Vec<u8>> {
    match value {
        Value::List(items) => items.iter().map(value::index_encoding).collect(),
        Value::Set(items) => items.iter().map(value::index_encoding_ord).collect(),
        Value::Map(items) => items.keys().map(value::index_encoding_ord).collect(),
        scalar => std::iter::once(value::index_encoding(scalar)).collect(),
    }
}

/// An inclusive encoded-bound range used by `range_index_iterator`.
#[derive(Debug, Clone, Default)]
pub struct Range {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
}

/// A single-point check usable by `iterator_from_check`: either an
/// equality match or a container `CONTAINS`.
#[derive(Debug, Clone)]
pub enum PointCheck {
    Equals(Vec<u8>),
    Contains(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RegionId;

    #[test]
    fn scalar_change_emits_delete_and_put() {
        let spec = IndexSpec {
            id: IndexId::new(1),
            attr: 1,
            ty: AttributeType::Int64,
        };
        let change = index_changes(
            &spec,
            RegionId::new(0),
            b"k",
            true,
            Some(&Value::Int(1)),
            Some(&Value::Int(2)),
        );
        assert_eq!(change.deletes.len(), 1);
        assert_eq!(change.puts.len(), 1);
    }

    #[test]
    fn container_change_is_symmetric_difference() {
        let spec = IndexSpec {
            id: IndexId::new(2),
            attr: 1,
            ty: AttributeType::List(PrimitiveType::Int64),
        };
        let old = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let new = Value::List(vec![Value::Int(2), Value::Int(3)]);
        let change = index_changes(&spec, RegionId::new(0), b"k", true, Some(&old), Some(&new));
        assert_eq!(change.deletes.len(), 1); // 1 removed
        assert_eq!(change.puts.len(), 1); // 3 added
    }
}
