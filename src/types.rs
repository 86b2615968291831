//! Attribute value model and the external type-validation/predicate
//! interface.
//!
//! spec.md §1 scopes data-type validation and predicate evaluation out of
//! the core: "specified only as an interface the core calls." This module
//! is that interface plus a concrete implementation of the primitive types
//! spec.md §3 names explicitly (string, integer, float, list, set, map,
//! timestamp), since the core needs *some* implementation to be testable
//! end-to-end (spec.md §8, scenarios S1-S6).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(i64),
    List(Vec<Value>),
    Set(BTreeSet<OrdValue>),
    Map(BTreeMap<OrdValue, Value>),
}

/// A `Value` restricted to the orderable primitives usable as set elements
/// or map keys. Containers of containers are rejected at validation time,
/// matching the original's `coercion`/`index_*` split by primitive kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrdValue {
    Str(String),
    Int(i64),
    /// Floats are ordered via their order-preserving encoding so that
    /// `BTreeSet`/`BTreeMap` ordering agrees with `index_encoding` ordering.
    FloatBits(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Int64,
    Float,
    Timestamp,
    List(PrimitiveType),
    Set(PrimitiveType),
    Map(PrimitiveType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    String,
    Int64,
    Float,
}

/// A region's schema: attribute 0 is always the primary key; the remaining
/// entries are secondary attributes in declaration order (spec.md §3,
/// "Schema").
#[derive(Debug, Clone)]
pub struct Schema {
    pub key_type: AttributeType,
    pub attributes: Vec<AttributeType>,
}

impl Schema {
    pub fn attribute_count(&self) -> usize {
        1 + self.attributes.len()
    }
}

/// Validates a value against its declared attribute type. Ingress failures
/// are `WRONG_TYPE` per spec.md §7 and are dropped, not retried.
pub fn validate(ty: AttributeType, value: &Value) -> EngineResult<()> {
    let ok = match (ty, value) {
        (AttributeType::String, Value::Str(_)) => true,
        (AttributeType::Int64, Value::Int(_)) => true,
        (AttributeType::Float, Value::Float(_)) => true,
        (AttributeType::Timestamp, Value::Timestamp(_)) => true,
        (AttributeType::List(elem), Value::List(items)) => {
            items.iter().all(|v| primitive_matches(elem, v))
        }
        (AttributeType::Set(elem), Value::Set(items)) => {
            items.iter().all(|v| ord_primitive_matches(elem, v))
        }
        (AttributeType::Map(key_ty), Value::Map(items)) => {
            items.keys().all(|k| ord_primitive_matches(key_ty, k))
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::WrongType(format!(
            "value {:?} does not match declared type {:?}",
            value, ty
        )))
    }
}

fn primitive_matches(ty: PrimitiveType, v: &Value) -> bool {
    matches!(
        (ty, v),
        (PrimitiveType::String, Value::Str(_))
            | (PrimitiveType::Int64, Value::Int(_))
            | (PrimitiveType::Float, Value::Float(_))
    )
}

fn ord_primitive_matches(ty: PrimitiveType, v: &OrdValue) -> bool {
    matches!(
        (ty, v),
        (PrimitiveType::String, OrdValue::Str(_))
            | (PrimitiveType::Int64, OrdValue::Int(_))
            | (PrimitiveType::Float, OrdValue::FloatBits(_))
    )
}

/// One predicate clause in a client `key_change` (spec.md §4.E/F,
/// "Fresh / conditional / overwrite").
#[derive(Debug, Clone)]
pub enum Check {
    Equals { attr: usize, value: Value },
    LessEqual { attr: usize, value: Value },
    GreaterEqual { attr: usize, value: Value },
    Contains { attr: usize, value: OrdValue },
}

/// Evaluates every check against the current attribute vector. `old` is
/// `None` when the key does not exist yet.
pub fn checks_pass(checks: &[Check], old: Option<&[Value]>) -> bool {
    checks.iter().all(|c| check_passes(c, old))
}

fn check_passes(check: &Check, old: Option<&[Value]>) -> bool {
    let Some(attrs) = old else { return false };
    let get = |attr: usize| attrs.get(attr);
    match check {
        Check::Equals { attr, value } => get(*attr) == Some(value),
        Check::LessEqual { attr, value } => {
            get(*attr).map(|v| compare(v, value)) == Some(std::cmp::Ordering::Less)
                || get(*attr) == Some(value)
        }
        Check::GreaterEqual { attr, value } => {
            get(*attr).map(|v| compare(v, value)) == Some(std::cmp::Ordering::Greater)
                || get(*attr) == Some(value)
        }
        Check::Contains { attr, value } => match get(*attr) {
            Some(Value::List(items)) => items.iter().any(|v| ord_value_eq(v, value)),
            Some(Value::Set(items)) => items.contains(value),
            _ => false,
        },
    }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}

fn ord_value_eq(v: &Value, o: &OrdValue) -> bool {
    match (v, o) {
        (Value::Str(a), OrdValue::Str(b)) => a == b,
        (Value::Int(a), OrdValue::Int(b)) => a == b,
        _ => false,
    }
}

/// A single mutating function applied to an attribute (e.g. `set`,
/// `int_add`). spec.md describes `funcs` only at the interface level; this
/// expansion implements the handful needed for the testable scenarios.
#[derive(Debug, Clone)]
pub enum Func {
    Set { attr: usize, value: Value },
    IntAdd { attr: usize, delta: i64 },
}

pub fn apply_funcs(attrs: &mut Vec<Value>, funcs: &[Func]) -> EngineResult<()> {
    for f in funcs {
        match f {
            Func::Set { attr, value } => {
                ensure_len(attrs, *attr);
                attrs[*attr] = value.clone();
            }
            Func::IntAdd { attr, delta } => {
                ensure_len(attrs, *attr);
                match &mut attrs[*attr] {
                    Value::Int(v) => *v += delta,
                    other => {
                        return Err(EngineError::WrongType(format!(
                            "int_add on non-int attribute {:?}",
                            other
                        )))
                    }
                }
            }
        }
    }
    Ok(())
}

fn ensure_len(attrs: &mut Vec<Value>, idx: usize) {
    while attrs.len() <= idx {
        attrs.push(Value::Int(0));
    }
}
