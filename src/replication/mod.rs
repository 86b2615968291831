//! Replication manager (component F, spec.md §4.E/§4.F).
//!
//! Owns every key's per-key state, the per-region version generator, and
//! the routing decisions that drive a mutation down its chain (or across a
//! subspace change) to the tail and back.

pub mod chain;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bus::MessageBus;
use crate::coordinator::ConfigService;
use crate::datalayer::{Datalayer, Timestamp};
use crate::error::{EngineError, EngineResult};
use crate::idgen::IdGenCol;
use crate::ids::{RegionId, Version, VirtualServerId};
use crate::keystate::{self, KeyOperation, KeyStateTable};
use crate::types::{Check, Func, Value};
use crate::wire::Message;
use crate::worker::Worker;

use chain::RouteDecision;

/// A client `key_change` request (spec.md §4.E, "Fresh / conditional /
/// overwrite").
#[derive(Debug, Clone, Default)]
pub struct KeyChange {
    pub erase: bool,
    pub fail_if_not_found: bool,
    pub fail_if_found: bool,
    pub checks: Vec<Check>,
    pub funcs: Vec<Func>,
}

struct InstalledRoute {
    chain: Vec<VirtualServerId>,
    position: usize,
    next_region: Option<RegionId>,
}

pub struct ReplicationManager {
    layer: Arc<Datalayer>,
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<dyn ConfigService>,
    self_vs: VirtualServerId,
    idgen: IdGenCol,
    keystates: KeyStateTable,
    routes: DashMap<RegionId, InstalledRoute>,
    region_heads: DashMap<RegionId, VirtualServerId>,
    stable: DashMap<RegionId, Version>,
    checkpoint_num: AtomicU64,
    pending_timestamps: Mutex<Vec<(RegionId, u64, Timestamp)>>,
}

impl ReplicationManager {
    pub fn new(
        layer: Arc<Datalayer>,
        bus: Arc<dyn MessageBus>,
        coordinator: Arc<dyn ConfigService>,
        self_vs: VirtualServerId,
    ) -> Self {
        Self {
            layer,
            bus,
            coordinator,
            self_vs,
            idgen: IdGenCol::new(),
            keystates: KeyStateTable::new(),
            routes: DashMap::new(),
            region_heads: DashMap::new(),
            stable: DashMap::new(),
            checkpoint_num: AtomicU64::new(0),
            pending_timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Installs (or replaces) the chain this node sees for `region`
    /// (spec.md §4.H, `adopt`, fired from a `reconfigure` event). Also
    /// records this region's head so other regions' tail-of-chain ops can
    /// find it during a subspace change.
    pub fn install_route(&self, region: RegionId, chain_members: Vec<VirtualServerId>, next_region: Option<RegionId>) {
        let position = chain_members.iter().position(|v| *v == self.self_vs).unwrap_or(0);
        if let Some(&head) = chain_members.first() {
            self.region_heads.insert(region, head);
        }
        self.routes.insert(
            region,
            InstalledRoute {
                chain: chain_members,
                position,
                next_region,
            },
        );
        self.idgen.adopt(&[region]);
    }

    pub fn is_point_leader(&self, region: RegionId) -> bool {
        self.routes.get(&region).map(|r| r.position == 0).unwrap_or(false)
    }

    pub fn point_led_regions(&self) -> Vec<RegionId> {
        self.routes
            .iter()
            .filter(|e| e.value().position == 0)
            .map(|e| *e.key())
            .collect()
    }

    /// Point-leader entry point for a client mutation (spec.md §2's data
    /// flow diagram, §4.E "Fresh / conditional / overwrite").
    pub fn client_atomic(&self, region: RegionId, key: &Value, change: KeyChange) -> EngineResult<()> {
        if !self.is_point_leader(region) {
            return Err(EngineError::Reconfigure);
        }
        let key_bytes = crate::codec::value::index_encoding(key);
        let state_handle = self.keystates.get_or_create(region, key_bytes.clone());

        let existing = match self.layer.get(region, key) {
            Ok((attrs, version)) => Some((attrs, version)),
            Err(EngineError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if change.fail_if_found && existing.is_some() {
            return Err(EngineError::CmpFail);
        }
        if change.fail_if_not_found && existing.is_none() {
            return Err(EngineError::CmpFail);
        }
        let old_attrs = existing.as_ref().map(|(a, _)| a.clone());
        if !crate::types::checks_pass(&change.checks, old_attrs.as_deref()) {
            return Err(EngineError::CmpFail);
        }

        let is_fresh = existing.is_none();
        let value = if change.erase {
            None
        } else {
            let mut attrs = old_attrs.clone().unwrap_or_default();
            crate::types::apply_funcs(&mut attrs, &change.funcs)?;
            Some(attrs)
        };

        let prev_version = {
            let state = state_handle.lock();
            state.last_committed_version
        };
        let this_version = self.idgen.next(region);
        let op = KeyOperation::simple(prev_version, this_version, value, is_fresh);
        {
            let mut state = state_handle.lock();
            state.committable.push_back(op);
        }
        self.drive(region, key, &key_bytes, &state_handle)
    }

    /// Replica entry point for an inbound `CHAIN_OP`.
    pub fn handle_chain_op(
        &self,
        region: RegionId,
        key: &Value,
        prev_version: Version,
        this_version: Version,
        is_fresh: bool,
        value: Option<Vec<Value>>,
    ) -> EngineResult<()> {
        let key_bytes = crate::codec::value::index_encoding(key);
        let state_handle = self.keystates.get_or_create(region, key_bytes.clone());
        {
            let mut state = state_handle.lock();
            let op = KeyOperation::simple(prev_version, this_version, value, is_fresh);
            if op.prev_version == state.last_committed_version {
                state.committable.push_back(op);
            } else {
                state.blocked.push_back(op);
            }
        }
        self.drive(region, key, &key_bytes, &state_handle)
    }

    /// Replica entry point for an inbound `CHAIN_SUBSPACE` (spec.md §4.F,
    /// routing table rows 4-5).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_chain_subspace(
        &self,
        region: RegionId,
        key: &Value,
        prev_version: Version,
        this_version: Version,
        value: Option<Vec<Value>>,
        prev_region: RegionId,
        this_old_region: RegionId,
        this_new_region: RegionId,
        next_region: RegionId,
    ) -> EngineResult<()> {
        let key_bytes = crate::codec::value::index_encoding(key);
        let state_handle = self.keystates.get_or_create(region, key_bytes.clone());
        {
            let mut state = state_handle.lock();
            let mut op = KeyOperation::simple(prev_version, this_version, value, false);
            op.prev_region = Some(prev_region);
            op.this_old_region = Some(this_old_region);
            op.this_new_region = Some(this_new_region);
            op.next_region = Some(next_region);
            if op.prev_version == state.last_committed_version {
                state.committable.push_back(op);
            } else {
                state.blocked.push_back(op);
            }
        }
        self.drive(region, key, &key_bytes, &state_handle)
    }

    /// Inbound `CHAIN_ACK`: marks the op acked and, if terminal here,
    /// collects it and/or forwards the ack further upstream.
    pub fn handle_chain_ack(&self, region: RegionId, key_bytes: Vec<u8>, version: Version) -> EngineResult<()> {
        self.ack_and_propagate(region, &key_bytes, version)
    }

    fn drive(
        &self,
        region: RegionId,
        key: &Value,
        key_bytes: &[u8],
        state_handle: &Arc<Mutex<crate::keystate::KeyState>>,
    ) -> EngineResult<()> {
        let ready = {
            let mut state = state_handle.lock();
            keystate::advance(&mut state, &self.layer, region, key)?
        };
        for op in ready {
            self.send_message(region, key_bytes, &op)?;
            let mut state = state_handle.lock();
            if let Some(entry) = state.committable.iter_mut().find(|o| o.this_version == op.this_version) {
                entry.sent_to = true;
            }
        }
        self.keystates.remove_if_idle(region, key_bytes);
        Ok(())
    }

    fn send_message(&self, region: RegionId, key_bytes: &[u8], op: &KeyOperation) -> EngineResult<()> {
        let route = self
            .routes
            .get(&region)
            .ok_or(EngineError::Reconfigure)?;
        let is_subspace_change = op.is_subspace_change();
        let in_old_region = is_subspace_change && op.this_old_region == Some(region);
        let next_head = op
            .next_region
            .and_then(|r| self.region_heads.get(&r).map(|h| *h));

        let decision = chain::decide_route(&route.chain, route.position, is_subspace_change, in_old_region, next_head);
        let encoded_value = encode_values(op.value.as_deref());

        match decision {
            // Crossing the tail of the old region's chain into the new
            // region's head (chain.rs's "tail of old region, crossing"
            // row): the new region has never seen this key, so it must
            // arrive there as a fresh put, not a continuation of the old
            // region's version sequence.
            RouteDecision::ForwardOp(to) if in_old_region => self.bus.send(
                to,
                Message::ChainOp {
                    is_fresh: true,
                    has_value: op.has_value,
                    prev_version: 0,
                    this_version: op.this_version,
                    key: key_bytes.to_vec(),
                    value: encoded_value,
                },
            ),
            RouteDecision::ForwardOp(to) => self.bus.send(
                to,
                Message::ChainOp {
                    is_fresh: op.is_fresh,
                    has_value: op.has_value,
                    prev_version: op.prev_version,
                    this_version: op.this_version,
                    key: key_bytes.to_vec(),
                    value: encoded_value,
                },
            ),
            RouteDecision::ForwardSubspace(to) => self.bus.send(
                to,
                Message::ChainSubspace {
                    prev_version: op.prev_version,
                    this_version: op.this_version,
                    key: key_bytes.to_vec(),
                    value: encoded_value,
                    prev_region: op.prev_region.unwrap_or(region),
                    this_old_region: op.this_old_region.unwrap_or(region),
                    this_new_region: op.this_new_region.unwrap_or(region),
                    next_region: op.next_region.unwrap_or(region),
                },
            ),
            RouteDecision::Ack => self.ack_and_propagate(region, key_bytes, op.this_version),
        }
    }

    fn ack_and_propagate(&self, region: RegionId, key_bytes: &[u8], version: Version) -> EngineResult<()> {
        if let Some(state_handle) = self.keystates.get(region, key_bytes) {
            let collected = {
                let mut state = state_handle.lock();
                if let Some(op) = state.committable.iter_mut().find(|o| o.this_version == version) {
                    op.acked = true;
                }
                keystate::reap_acked(&mut state)
            };
            for v in collected {
                self.idgen.collect(region, v);
            }
            self.keystates.remove_if_idle(region, key_bytes);
        }
        if let Some(route) = self.routes.get(&region) {
            if route.position > 0 {
                let prev = route.chain[route.position - 1];
                return self.bus.send(
                    prev,
                    Message::ChainAck {
                        this_version: version,
                        key: key_bytes.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    /// One retransmitter cycle for `region` (spec.md §4.F, "Retransmitter"
    /// steps 1-3): closes version gaps no live op still occupies, then
    /// checks whether the region's collected lower bound has advanced.
    pub fn retransmit_region(&self, region: RegionId) {
        let peeked = self.idgen.peek(region);
        let mut live = BTreeSet::new();
        for key_bytes in self.keystates.keys_for_region(region) {
            if let Some(state_handle) = self.keystates.get(region, &key_bytes) {
                let state = state_handle.lock();
                live.extend(state.committable.iter().map(|o| o.this_version));
                live.extend(state.blocked.iter().map(|o| o.this_version));
            }
        }
        self.idgen.close_gaps(region, peeked, &live);
        self.check_stable(region);
    }

    fn check_stable(&self, region: RegionId) {
        let lower = self.idgen.lower_bound(region);
        let advanced = {
            let mut entry = self.stable.entry(region).or_insert(0);
            let advanced = lower >= *entry;
            if advanced {
                *entry = lower;
            }
            advanced
        };
        if advanced {
            let checkpoint_num = self.checkpoint_num.load(Ordering::Acquire);
            self.coordinator.report_stable(region, lower, checkpoint_num);
        }
    }

    /// Coordinator-driven checkpoint bracket (spec.md §4.F, "Checkpoints").
    pub fn begin_checkpoint(&self, n: u64) -> EngineResult<()> {
        self.checkpoint_num.store(n, Ordering::Release);
        let mut pending = self.pending_timestamps.lock();
        let regions: Vec<RegionId> = self.point_led_regions();
        for region in regions {
            let ts = self.layer.current_timestamp()?;
            pending.push((region, n, ts));
            let stable_at = self.idgen.peek(region).saturating_sub(1);
            self.stable.insert(region, stable_at);
        }
        Ok(())
    }

    pub fn end_checkpoint(&self, n: u64) -> EngineResult<()> {
        let to_materialize: Vec<(RegionId, u64, Timestamp)> = {
            let mut pending = self.pending_timestamps.lock();
            let (ready, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(_, cp, _)| *cp <= n);
            *pending = rest;
            ready
        };
        for (region, checkpoint_no, _ts) in to_materialize {
            self.layer.create_checkpoint(region, checkpoint_no)?;
        }
        Ok(())
    }
}

fn encode_values(value: Option<&[Value]>) -> Vec<Vec<u8>> {
    match value {
        None => Vec::new(),
        Some(attrs) => attrs
            .iter()
            .map(|v| {
                let mut buf = Vec::new();
                crate::codec::value::encode_attr(v, &mut buf);
                buf
            })
            .collect(),
    }
}

/// Background worker driving `retransmit_region` across every point-led
/// region on a fixed cadence (spec.md §4.F, "Retransmitter").
pub struct RetransmitterWorker {
    manager: Arc<ReplicationManager>,
    interval: std::time::Duration,
    pending: Vec<RegionId>,
}

impl RetransmitterWorker {
    pub fn new(manager: Arc<ReplicationManager>, interval: std::time::Duration) -> Self {
        Self {
            manager,
            interval,
            pending: Vec::new(),
        }
    }
}

impl Worker for RetransmitterWorker {
    fn thread_name(&self) -> &'static str {
        "retransmitter"
    }

    fn have_work(&self) -> bool {
        true
    }

    fn copy_work(&mut self) {
        self.pending = self.manager.point_led_regions();
    }

    fn do_work(&mut self) {
        std::thread::sleep(self.interval);
        for region in self.pending.drain(..) {
            self.manager.retransmit_region(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::coordinator::NullConfigService;
    use crate::types::{AttributeType, Schema};

    fn setup(region: RegionId) -> (Arc<ReplicationManager>, Arc<Datalayer>, VirtualServerId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let layer = Arc::new(layer);
        layer.register_schema(
            region,
            Schema {
                key_type: AttributeType::Int64,
                attributes: vec![AttributeType::String, AttributeType::Int64],
            },
        );
        let bus = Arc::new(LoopbackBus::new());
        let coordinator = Arc::new(NullConfigService);
        let self_vs = VirtualServerId::new(1);
        let manager = Arc::new(ReplicationManager::new(layer.clone(), bus, coordinator, self_vs));
        manager.install_route(region, vec![self_vs], None);
        (manager, layer, self_vs, dir)
    }

    #[test]
    fn single_replica_put_commits_and_collects() {
        let region = RegionId::new(1);
        let (manager, layer, _vs, _dir) = setup(region);
        let key = Value::Int(1);
        let change = KeyChange {
            funcs: vec![
                Func::Set { attr: 0, value: Value::Str("1".into()) },
                Func::Set { attr: 1, value: Value::Int(42) },
            ],
            ..Default::default()
        };
        manager.client_atomic(region, &key, change).unwrap();

        let (attrs, version) = layer.get(region, &key).unwrap();
        assert_eq!(version, 1);
        assert_eq!(attrs, vec![Value::Str("1".into()), Value::Int(42)]);
        assert_eq!(manager.idgen.lower_bound(region), 2);
    }

    #[test]
    fn conditional_overwrite_then_cmpfail() {
        let region = RegionId::new(1);
        let (manager, layer, _vs, _dir) = setup(region);
        let key = Value::Int(1);
        manager
            .client_atomic(
                region,
                &key,
                KeyChange {
                    funcs: vec![
                        Func::Set { attr: 0, value: Value::Str("1".into()) },
                        Func::Set { attr: 1, value: Value::Int(42) },
                    ],
                    ..Default::default()
                },
            )
            .unwrap();

        manager
            .client_atomic(
                region,
                &key,
                KeyChange {
                    checks: vec![Check::Equals { attr: 0, value: Value::Str("1".into()) }],
                    funcs: vec![Func::Set { attr: 0, value: Value::Str("2".into()) }],
                    ..Default::default()
                },
            )
            .unwrap();

        let err = manager
            .client_atomic(
                region,
                &key,
                KeyChange {
                    checks: vec![Check::Equals { attr: 0, value: Value::Str("1".into()) }],
                    funcs: vec![Func::Set { attr: 0, value: Value::Str("3".into()) }],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::CmpFail));

        let (attrs, _) = layer.get(region, &key).unwrap();
        assert_eq!(attrs, vec![Value::Str("2".into()), Value::Int(42)]);
    }
}
