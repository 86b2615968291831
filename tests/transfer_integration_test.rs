//! S5 from spec.md §8: a joining replica is far enough behind the sender's
//! retained oplog window that the sender must wipe it before reloading,
//! rather than replay the gap.

use std::sync::Arc;
use std::time::Duration;

use chainstore::bus::LoopbackBus;
use chainstore::config::EngineConfig;
use chainstore::coordinator::NullConfigService;
use chainstore::datalayer::Datalayer;
use chainstore::ids::{RegionId, VirtualServerId};
use chainstore::transfer::StateTransferManager;
use chainstore::types::{AttributeType, Schema, Value};
use chainstore::wire::Message;

#[test]
fn s5_state_transfer_with_wipe() {
    let region = RegionId::new(1);
    let dir = tempfile::tempdir().unwrap();
    let (sender_layer, _) = Datalayer::open(dir.path()).unwrap();
    let sender_layer = Arc::new(sender_layer);
    sender_layer.register_schema(
        region,
        Schema {
            key_type: AttributeType::Int64,
            attributes: vec![AttributeType::String],
        },
    );

    sender_layer.put(region, &Value::Int(1), &[Value::Str("a".into())], 1).unwrap();
    sender_layer.create_checkpoint(region, 0).unwrap();
    sender_layer.put(region, &Value::Int(2), &[Value::Str("b".into())], 2).unwrap();
    sender_layer.create_checkpoint(region, 1).unwrap();
    // Collecting everything below checkpoint 1 moves the oplog's retained
    // watermark forward past timestamp 0, so a joiner reporting "I have
    // nothing" (timestamp 0) can no longer be brought up to date by replay.
    sender_layer.run_checkpoint_gc(region, 1).unwrap();

    let receiver_dir = tempfile::tempdir().unwrap();
    let (receiver_layer, _) = Datalayer::open(receiver_dir.path()).unwrap();
    let receiver_layer = Arc::new(receiver_layer);
    receiver_layer.register_schema(
        region,
        Schema {
            key_type: AttributeType::Int64,
            attributes: vec![AttributeType::String],
        },
    );

    let bus = Arc::new(LoopbackBus::new());
    let sender_vs = VirtualServerId::new(1);
    let receiver_vs = VirtualServerId::new(2);
    let sender_rx = bus.register(sender_vs);
    let receiver_rx = bus.register(receiver_vs);

    let config = EngineConfig::default();
    let sender_mgr = StateTransferManager::new(sender_layer.clone(), bus.clone(), Arc::new(NullConfigService), &config);
    let receiver_mgr = StateTransferManager::new(receiver_layer.clone(), bus.clone(), Arc::new(NullConfigService), &config);

    sender_mgr.begin_send(region, receiver_vs).unwrap();

    let hs = receiver_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let Message::XferHs { transfer_id } = hs else { panic!("expected XFER_HS, got {hs:?}") };
    receiver_mgr.handle_xfer_hs(transfer_id, sender_vs, region).unwrap();

    let hsa = sender_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let Message::XferHsa { transfer_id: tid, timestamp } = hsa else { panic!("expected XFER_HSA, got {hsa:?}") };
    assert_eq!(timestamp, 0u64.to_be_bytes().to_vec());
    sender_mgr.handle_xfer_hsa(tid, timestamp).unwrap();

    let ha = receiver_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let Message::XferHa { transfer_id: tid, wipe } = ha else { panic!("expected XFER_HA, got {ha:?}") };
    assert!(wipe, "joiner behind the retained window must be wiped before reload");
    receiver_mgr.handle_xfer_ha(tid, wipe).unwrap();

    let hw = sender_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let Message::XferHw { transfer_id: tid } = hw else { panic!("expected XFER_HW, got {hw:?}") };
    sender_mgr.handle_xfer_hw(tid).unwrap();

    for _ in 0..2 {
        let op = receiver_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let Message::XferOp { transfer_id: tid, region_id, seq_no, version, key, value, .. } = op else {
            panic!("expected XFER_OP, got {op:?}")
        };
        receiver_mgr.handle_xfer_op(tid, region_id, seq_no, version, key, value).unwrap();

        let ack = sender_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let Message::XferAck { transfer_id: tid, seq_no } = ack else { panic!("expected XFER_ACK, got {ack:?}") };
        sender_mgr.handle_xfer_ack(tid, seq_no).unwrap();
    }

    let (attrs1, version1) = receiver_layer.get(region, &Value::Int(1)).unwrap();
    assert_eq!(version1, 1);
    assert_eq!(attrs1, vec![Value::Str("a".into())]);
    let (attrs2, version2) = receiver_layer.get(region, &Value::Int(2)).unwrap();
    assert_eq!(version2, 2);
    assert_eq!(attrs2, vec![Value::Str("b".into())]);

    let count = receiver_layer.region_iterator(region).count();
    assert_eq!(count, 2, "wipe-then-reload must not leave stale or duplicate objects behind");
}
