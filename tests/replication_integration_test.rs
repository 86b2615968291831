//! Integration tests for the replication manager and chain-replication
//! data flow.
//!
//! Covers scenarios S1-S3 from spec.md §8: a simple put, a conditional
//! overwrite that eventually CMPFAILs, and a chain of three replicas
//! converging on out-of-order delivery.

use std::sync::Arc;

use chainstore::bus::LoopbackBus;
use chainstore::coordinator::NullConfigService;
use chainstore::datalayer::Datalayer;
use chainstore::error::EngineError;
use chainstore::ids::{RegionId, VirtualServerId};
use chainstore::replication::{KeyChange, ReplicationManager};
use chainstore::types::{AttributeType, Check, Func, Schema, Value};

fn schema() -> Schema {
    Schema {
        key_type: AttributeType::String,
        attributes: vec![AttributeType::String, AttributeType::Int64],
    }
}

#[test]
fn s1_simple_put() {
    let dir = tempfile::tempdir().unwrap();
    let (layer, _) = Datalayer::open(dir.path()).unwrap();
    let layer = Arc::new(layer);
    let region = RegionId::new(1);
    layer.register_schema(region, schema());

    let bus = Arc::new(LoopbackBus::new());
    let vs = VirtualServerId::new(1);
    let manager = Arc::new(ReplicationManager::new(layer.clone(), bus, Arc::new(NullConfigService), vs));
    manager.install_route(region, vec![vs], None);

    let key = Value::Str("k".into());
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

    let (attrs, version) = layer.get(region, &key).unwrap();
    assert_eq!(attrs, vec![Value::Str("1".into()), Value::Int(42)]);
    assert_eq!(version, 1);
}

#[test]
fn s2_conditional_overwrite_then_cmpfail() {
    let dir = tempfile::tempdir().unwrap();
    let (layer, _) = Datalayer::open(dir.path()).unwrap();
    let layer = Arc::new(layer);
    let region = RegionId::new(1);
    layer.register_schema(region, schema());

    let bus = Arc::new(LoopbackBus::new());
    let vs = VirtualServerId::new(1);
    let manager = Arc::new(ReplicationManager::new(layer.clone(), bus, Arc::new(NullConfigService), vs));
    manager.install_route(region, vec![vs], None);

    let key = Value::Str("k".into());
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

/// S3: a three-node chain where the middle replica receives v2 before v1.
/// Since this test exercises the inbound `CHAIN_OP` path directly (no real
/// transport), it drives all three `ReplicationManager`s by hand in the
/// order a lossy network would deliver them, and asserts they still
/// converge on the same final value with the tail acking in order.
#[test]
fn s3_chain_of_three_converges_out_of_order() {
    let region = RegionId::new(1);
    let bus = Arc::new(LoopbackBus::new());
    let coordinator = Arc::new(NullConfigService);

    let vs1 = VirtualServerId::new(1);
    let vs2 = VirtualServerId::new(2);
    let vs3 = VirtualServerId::new(3);
    let chain = vec![vs1, vs2, vs3];

    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let dir3 = tempfile::tempdir().unwrap();
    let (l1, _) = Datalayer::open(dir1.path()).unwrap();
    let (l2, _) = Datalayer::open(dir2.path()).unwrap();
    let (l3, _) = Datalayer::open(dir3.path()).unwrap();
    let l1 = Arc::new(l1);
    let l2 = Arc::new(l2);
    let l3 = Arc::new(l3);
    for l in [&l1, &l2, &l3] {
        l.register_schema(region, schema());
    }

    let m1 = Arc::new(ReplicationManager::new(l1.clone(), bus.clone(), coordinator.clone(), vs1));
    let m2 = Arc::new(ReplicationManager::new(l2.clone(), bus.clone(), coordinator.clone(), vs2));
    let m3 = Arc::new(ReplicationManager::new(l3.clone(), bus.clone(), coordinator.clone(), vs3));
    for m in [&m1, &m2, &m3] {
        m.install_route(region, chain.clone(), None);
    }

    let key = Value::Str("k".into());
    let value1 = Some(vec![Value::Str("1".into()), Value::Int(1)]);
    let value2 = Some(vec![Value::Str("2".into()), Value::Int(2)]);
    let value3 = Some(vec![Value::Str("3".into()), Value::Int(3)]);

    // v2 reaches the middle replica before v1 — it must block until v1 lands.
    m2.handle_chain_op(region, &key, 1, 2, false, value2.clone()).unwrap();
    assert!(matches!(l2.get(region, &key), Err(EngineError::NotFound)));

    m1.handle_chain_op(region, &key, 0, 1, true, value1.clone()).unwrap();
    m2.handle_chain_op(region, &key, 0, 1, true, value1.clone()).unwrap();
    m1.handle_chain_op(region, &key, 1, 2, false, value2.clone()).unwrap();
    m3.handle_chain_op(region, &key, 0, 1, true, value1.clone()).unwrap();
    m3.handle_chain_op(region, &key, 1, 2, false, value2.clone()).unwrap();

    m1.handle_chain_op(region, &key, 2, 3, false, value3.clone()).unwrap();
    m2.handle_chain_op(region, &key, 2, 3, false, value3.clone()).unwrap();
    m3.handle_chain_op(region, &key, 2, 3, false, value3.clone()).unwrap();

    for l in [&l1, &l2, &l3] {
        let (attrs, version) = l.get(region, &key).unwrap();
        assert_eq!(version, 3);
        assert_eq!(attrs, vec![Value::Str("3".into()), Value::Int(3)]);
    }
}
