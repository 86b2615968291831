//! Per-key replication state (component E, spec.md §3 "Per-key state" and
//! §4.E).
//!
//! One `KeyState` exists per `(region_id, key)` with any outstanding
//! operation. Entries live in a concurrent map and are held alive by
//! `Arc` for the duration of any operation referencing them — ordinary
//! reference counting stands in for the original's quiescence-based
//! arena (spec.md §9, "Cyclic ownership").

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::EngineResult;
use crate::ids::{RegionId, Version};
use crate::types::Value;

/// One client mutation or inbound `CHAIN_OP`, as it flows through a key's
/// `blocked` → `committable` pipeline (spec.md §3).
#[derive(Debug, Clone)]
pub struct KeyOperation {
    pub prev_version: Version,
    pub this_version: Version,
    pub has_value: bool,
    pub is_fresh: bool,
    pub value: Option<Vec<Value>>,
    /// Non-`None` only for a subspace-crossing op (`CHAIN_SUBSPACE`).
    pub prev_region: Option<RegionId>,
    pub this_old_region: Option<RegionId>,
    pub this_new_region: Option<RegionId>,
    pub next_region: Option<RegionId>,
    applied: bool,
    pub sent_to: bool,
    pub acked: bool,
}

impl KeyOperation {
    pub fn simple(prev_version: Version, this_version: Version, value: Option<Vec<Value>>, is_fresh: bool) -> Self {
        KeyOperation {
            prev_version,
            this_version,
            has_value: value.is_some(),
            is_fresh,
            value,
            prev_region: None,
            this_old_region: None,
            this_new_region: None,
            next_region: None,
            applied: false,
            sent_to: false,
            acked: false,
        }
    }

    pub fn is_subspace_change(&self) -> bool {
        self.this_old_region.is_some() && self.this_new_region.is_some() && self.this_old_region != self.this_new_region
    }
}

#[derive(Default)]
pub struct KeyState {
    pub old_value: Option<Vec<Value>>,
    pub old_version: Version,
    pub committable: VecDeque<KeyOperation>,
    pub blocked: VecDeque<KeyOperation>,
    pub deferred: VecDeque<KeyOperation>,
    pub last_committed_version: Version,
}

impl KeyState {
    pub fn is_empty_and_idle(&self) -> bool {
        self.committable.iter().all(|op| op.acked) && self.blocked.is_empty() && self.deferred.is_empty()
    }
}

/// Advances one key's state machine per spec.md §4.E step 1-2: promotes
/// contiguous `blocked` ops into `committable`, then applies every
/// not-yet-applied committable op to the data layer in order. Returns the
/// ops that still need `send_message` (step 3 is the replication
/// manager's job, since it alone knows chain position).
pub fn advance(
    state: &mut KeyState,
    layer: &crate::datalayer::Datalayer,
    region: RegionId,
    key: &Value,
) -> EngineResult<Vec<KeyOperation>> {
    loop {
        let pos = state
            .blocked
            .iter()
            .position(|op| op.prev_version == state.last_committed_version);
        let Some(pos) = pos else { break };
        let op = state.blocked.remove(pos).unwrap();
        state.last_committed_version = op.this_version;
        state.committable.push_back(op);
    }

    let mut ready = Vec::new();
    for op in state.committable.iter_mut() {
        if !op.applied {
            if op.has_value {
                layer.overput(
                    region,
                    key,
                    if op.is_fresh { None } else { state.old_value.as_deref() },
                    op.value.as_ref().expect("has_value implies a value"),
                    op.this_version,
                )?;
                state.old_value = op.value.clone();
            } else {
                layer.del(region, key, state.old_value.as_deref())?;
                state.old_value = None;
            }
            state.old_version = op.this_version;
            op.applied = true;
        }
        if !op.sent_to {
            ready.push(op.clone());
        }
    }
    if let Some(last) = state.committable.back() {
        state.last_committed_version = last.this_version;
    }
    Ok(ready)
}

/// Removes every acked op up through the first not-yet-acked one, so the
/// `committable` queue never grows unbounded on a healthy chain.
pub fn reap_acked(state: &mut KeyState) -> Vec<Version> {
    let mut collected = Vec::new();
    while let Some(front) = state.committable.front() {
        if front.acked {
            collected.push(state.committable.pop_front().unwrap().this_version);
        } else {
            break;
        }
    }
    collected
}

pub type KeyId = (RegionId, Vec<u8>);

/// Concurrent map of live key states, keyed by `(region, key_bytes)`
/// (spec.md §5, "lock-free find + per-entry mutex for mutation").
#[derive(Default)]
pub struct KeyStateTable {
    states: DashMap<KeyId, Arc<Mutex<KeyState>>>,
}

impl KeyStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, region: RegionId, key_bytes: Vec<u8>) -> Arc<Mutex<KeyState>> {
        self.states
            .entry((region, key_bytes))
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
            .clone()
    }

    pub fn get(&self, region: RegionId, key_bytes: &[u8]) -> Option<Arc<Mutex<KeyState>>> {
        self.states.get(&(region, key_bytes.to_vec())).map(|e| e.clone())
    }

    /// Drops a key's state once nothing references it and it has no
    /// pending work, so idle keys don't pin memory forever.
    pub fn remove_if_idle(&self, region: RegionId, key_bytes: &[u8]) {
        let id: KeyId = (region, key_bytes.to_vec());
        let should_remove = self
            .states
            .get(&id)
            .map(|e| Arc::strong_count(&e) <= 2 && e.lock().is_empty_and_idle())
            .unwrap_or(false);
        if should_remove {
            self.states.remove(&id);
        }
    }

    pub fn keys_for_region(&self, region: RegionId) -> Vec<Vec<u8>> {
        self.states
            .iter()
            .filter(|e| e.key().0 == region)
            .map(|e| e.key().1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalayer::Datalayer;
    use crate::types::{AttributeType, Schema};

    #[test]
    fn promotes_contiguous_blocked_ops_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let region = RegionId::new(1);
        layer.register_schema(
            region,
            Schema {
                key_type: AttributeType::Int64,
                attributes: vec![AttributeType::Int64],
            },
        );
        let key = Value::Int(7);

        let mut state = KeyState::default();
        // v2 arrives before v1 — should stay blocked until v1 lands.
        state.blocked.push_back(KeyOperation::simple(1, 2, Some(vec![Value::Int(20)]), false));
        let ready = advance(&mut state, &layer, region, &key).unwrap();
        assert!(ready.is_empty());
        assert!(state.committable.is_empty());

        state.blocked.push_back(KeyOperation::simple(0, 1, Some(vec![Value::Int(10)]), true));
        let ready = advance(&mut state, &layer, region, &key).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].this_version, 1);
        assert_eq!(ready[1].this_version, 2);

        let (attrs, version) = layer.get(region, &key).unwrap();
        assert_eq!(version, 2);
        assert_eq!(attrs, vec![Value::Int(20)]);
    }
}
