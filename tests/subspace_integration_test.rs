//! S4 from spec.md §8: a subspace change reroutes a key from one region's
//! chain into another's, and both regions end up agreeing on the result.
//!
//! This exercises the full `CHAIN_SUBSPACE` data flow: the old region's
//! (single-node) chain applies the crossing op locally, then the tail of
//! that chain forwards a fresh `CHAIN_OP` into the new region's head —
//! delivered here over a real `LoopbackBus` channel, same as the wire would.

use std::sync::Arc;

use chainstore::bus::LoopbackBus;
use chainstore::coordinator::NullConfigService;
use chainstore::datalayer::Datalayer;
use chainstore::ids::{RegionId, VirtualServerId};
use chainstore::replication::ReplicationManager;
use chainstore::types::{AttributeType, Schema, Value};
use chainstore::wire::Message;

#[test]
fn s4_subspace_change_moves_key_between_regions() {
    let old_region = RegionId::new(1);
    let new_region = RegionId::new(2);
    let vs = VirtualServerId::new(1);

    let dir = tempfile::tempdir().unwrap();
    let (layer, _) = Datalayer::open(dir.path()).unwrap();
    let layer = Arc::new(layer);
    let schema = Schema {
        key_type: AttributeType::Int64,
        attributes: vec![AttributeType::String],
    };
    layer.register_schema(old_region, schema.clone());
    layer.register_schema(new_region, schema);

    let bus = Arc::new(LoopbackBus::new());
    let rx = bus.register(vs);
    let coordinator = Arc::new(NullConfigService);
    let manager = Arc::new(ReplicationManager::new(layer.clone(), bus, coordinator, vs));
    manager.install_route(old_region, vec![vs], Some(new_region));
    manager.install_route(new_region, vec![vs], None);

    let key = Value::Int(7);

    manager
        .handle_chain_op(old_region, &key, 0, 1, true, Some(vec![Value::Str("original".into())]))
        .unwrap();
    let (attrs, version) = layer.get(old_region, &key).unwrap();
    assert_eq!(version, 1);
    assert_eq!(attrs, vec![Value::Str("original".into())]);

    manager
        .handle_chain_subspace(
            old_region,
            &key,
            1,
            2,
            Some(vec![Value::Str("moved".into())]),
            old_region,
            old_region,
            new_region,
            new_region,
        )
        .unwrap();

    // The old region's own chain applied the crossing op locally too (the
    // content is identical; cleanup of the stale old-region copy is out of
    // scope here).
    let (old_attrs, old_version) = layer.get(old_region, &key).unwrap();
    assert_eq!(old_version, 2);
    assert_eq!(old_attrs, vec![Value::Str("moved".into())]);

    // Being the tail of a single-node old-region chain, it also forwarded a
    // fresh `CHAIN_OP` to the new region's head — deliver it as a real
    // dispatch loop would.
    let forwarded = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    match forwarded {
        Message::ChainOp {
            is_fresh,
            has_value,
            prev_version,
            this_version,
            ..
        } => {
            assert!(is_fresh);
            assert!(has_value);
            assert_eq!(prev_version, 0);
            manager
                .handle_chain_op(new_region, &key, prev_version, this_version, is_fresh, Some(vec![Value::Str("moved".into())]))
                .unwrap();
        }
        other => panic!("unexpected message forwarded into the new region: {other:?}"),
    }

    let (new_attrs, new_version) = layer.get(new_region, &key).unwrap();
    assert_eq!(new_version, 2);
    assert_eq!(new_attrs, vec![Value::Str("moved".into())]);
}
