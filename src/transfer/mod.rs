//! State-transfer protocol (component G, spec.md §4.G).
//!
//! Moves one region's objects from an existing replica to a joining node:
//! a three-phase handshake (`XFER_HS`/`XFER_HSA`/`XFER_HA`) negotiates
//! whether the sender needs to wipe the receiver's prior copy, then the
//! sender streams every object under a doubling flow-control window
//! (`XFER_OP`/`XFER_ACK`) until it catches up to the handshake's recorded
//! timestamp.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bus::MessageBus;
use crate::codec::key as keycodec;
use crate::codec::object as objectcodec;
use crate::config::EngineConfig;
use crate::coordinator::ConfigService;
use crate::datalayer::Datalayer;
use crate::error::{EngineError, EngineResult};
use crate::ids::{RegionId, TransferId, VirtualServerId};
use crate::wire::Message;

/// Sender-side state for one in-flight transfer (spec.md §4.G,
/// "Sender").
struct TransferOutState {
    region: RegionId,
    peer: VirtualServerId,
    wipe: bool,
    window: u32,
    next_seq: u64,
    in_flight: BTreeMap<u64, ()>,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    done_sending: bool,
}

/// Receiver-side state for one in-flight transfer.
struct TransferInState {
    region: RegionId,
    peer: VirtualServerId,
    expect_wipe: bool,
    wiped: bool,
}

/// Drives both sides of state transfer for every region this node is
/// party to (spec.md §4.G).
pub struct StateTransferManager {
    layer: Arc<Datalayer>,
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<dyn ConfigService>,
    window_min: u32,
    window_max: u32,
    next_transfer_id: AtomicU32,
    outbound: DashMap<TransferId, Mutex<TransferOutState>>,
    inbound: DashMap<TransferId, Mutex<TransferInState>>,
}

impl StateTransferManager {
    pub fn new(layer: Arc<Datalayer>, bus: Arc<dyn MessageBus>, coordinator: Arc<dyn ConfigService>, config: &EngineConfig) -> Self {
        Self {
            layer,
            bus,
            coordinator,
            window_min: config.transfer_window_min.max(1),
            window_max: config.transfer_window_max.max(config.transfer_window_min.max(1)),
            next_transfer_id: AtomicU32::new(1),
            outbound: DashMap::new(),
            inbound: DashMap::new(),
        }
    }

    /// Coordinator-initiated send: begins the handshake with `peer` for
    /// `region` (spec.md §2, state-transfer data flow).
    pub fn begin_send(&self, region: RegionId, peer: VirtualServerId) -> EngineResult<TransferId> {
        let id = TransferId::new(self.next_transfer_id.fetch_add(1, Ordering::Relaxed) as u64);
        self.outbound.insert(
            id,
            Mutex::new(TransferOutState {
                region,
                peer,
                wipe: false,
                window: self.window_min,
                next_seq: 0,
                in_flight: BTreeMap::new(),
                pending: Vec::new(),
                done_sending: false,
            }),
        );
        self.bus.send(peer, Message::XferHs { transfer_id: id })?;
        Ok(id)
    }

    /// Receiver handling of `XFER_HS`: records the new transfer and replies
    /// `XFER_HSA` carrying our current timestamp so the sender knows which
    /// objects we might already hold.
    pub fn handle_xfer_hs(&self, transfer_id: TransferId, from: VirtualServerId, region: RegionId) -> EngineResult<()> {
        self.inbound.insert(
            transfer_id,
            Mutex::new(TransferInState {
                region,
                peer: from,
                expect_wipe: false,
                wiped: false,
            }),
        );
        let ts = self.layer.current_timestamp()?;
        self.bus.send(
            from,
            Message::XferHsa {
                transfer_id,
                timestamp: ts.to_be_bytes().to_vec(),
            },
        )
    }

    /// Sender handling of `XFER_HSA`: decides whether the receiver's
    /// existing copy is unusable and must be wiped before objects ship
    /// (spec.md §4.G, "wipe-before-load").
    pub fn handle_xfer_hsa(&self, transfer_id: TransferId, timestamp: Vec<u8>) -> EngineResult<()> {
        let entry = self
            .outbound
            .get(&transfer_id)
            .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
        let region = entry.lock().region;
        let peer_ts = u64::from_be_bytes(timestamp.try_into().unwrap_or([0; 8]));
        let can_replay = self.layer.oplog_can_replay_from(peer_ts)?;
        let wipe = !can_replay;
        entry.lock().wipe = wipe;
        let peer = entry.lock().peer;
        if wipe {
            self.layer.request_wipe(transfer_id, region);
        }
        self.bus.send(peer, Message::XferHa { transfer_id, wipe })
    }

    /// Receiver handling of `XFER_HA`: wipes first if asked, then tells the
    /// sender to start streaming with `XFER_HW`.
    pub fn handle_xfer_ha(&self, transfer_id: TransferId, wipe: bool) -> EngineResult<()> {
        let entry = self
            .inbound
            .get(&transfer_id)
            .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
        let (region, peer) = {
            let mut state = entry.lock();
            state.expect_wipe = wipe;
            (state.region, state.peer)
        };
        if wipe {
            self.layer.wipe_region(region)?;
            entry.lock().wiped = true;
        }
        self.bus.send(peer, Message::XferHw { transfer_id })
    }

    /// Sender handling of `XFER_HW`: loads every object in the region and
    /// starts shipping under the initial window.
    pub fn handle_xfer_hw(&self, transfer_id: TransferId) -> EngineResult<()> {
        let entry = self
            .outbound
            .get(&transfer_id)
            .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
        let region = entry.lock().region;
        let objects: Vec<(Vec<u8>, Vec<u8>)> = self
            .layer
            .region_iterator(region)
            .collect::<EngineResult<Vec<_>>>()?;
        entry.lock().pending = objects;
        self.pump(transfer_id)
    }

    fn pump(&self, transfer_id: TransferId) -> EngineResult<()> {
        let entry = self
            .outbound
            .get(&transfer_id)
            .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
        let mut state = entry.lock();
        let region = state.region;
        let peer = state.peer;
        while state.in_flight.len() < state.window as usize && !state.pending.is_empty() {
            let (key, value) = state.pending.remove(0);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.in_flight.insert(seq, ());
            let (_, key_bytes) = keycodec::decode_object_key(&key).ok_or_else(|| {
                EngineError::Corruption("object key missing region discriminator".into())
            })?;
            let (version, attrs) = objectcodec::decode(&value, &self.schema_types(region)?)?;
            let encoded_value: Vec<Vec<u8>> = attrs
                .iter()
                .map(|v| {
                    let mut buf = Vec::new();
                    crate::codec::value::encode_attr(v, &mut buf);
                    buf
                })
                .collect();
            self.bus.send(
                peer,
                Message::XferOp {
                    has_value: true,
                    transfer_id,
                    region_id: region,
                    seq_no: seq,
                    version,
                    key: key_bytes.to_vec(),
                    value: encoded_value,
                },
            )?;
        }
        if state.pending.is_empty() && state.in_flight.is_empty() {
            state.done_sending = true;
        }
        Ok(())
    }

    fn schema_types(&self, region: RegionId) -> EngineResult<Vec<crate::types::AttributeType>> {
        Ok(self.layer.schema(region)?.attributes.clone())
    }

    /// Receiver handling of one `XFER_OP`: applies the object and acks it.
    pub fn handle_xfer_op(
        &self,
        transfer_id: TransferId,
        region: RegionId,
        seq_no: u64,
        version: u64,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
    ) -> EngineResult<()> {
        let types = self.schema_types(region)?;
        let mut attrs = Vec::with_capacity(value.len());
        for (body, ty) in value.iter().zip(types.iter()) {
            let mut framed = (body.len() as u32).to_be_bytes().to_vec();
            framed.extend_from_slice(body);
            let (v, _) = crate::codec::value::decode_attr(*ty, &framed)?;
            attrs.push(v);
        }
        let key_value = crate::codec::value::index_encoding_to_value(&key, self.layer.schema(region)?.key_type);
        self.layer.put(region, &key_value, &attrs, version)?;

        let peer = self
            .inbound
            .get(&transfer_id)
            .map(|e| e.lock().peer)
            .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
        self.bus.send(peer, Message::XferAck { transfer_id, seq_no })
    }

    /// Sender handling of `XFER_ACK`: frees a window slot, doubles the
    /// window up to the configured maximum, and either pumps more objects
    /// or declares the transfer complete (spec.md §4.G, "flow control").
    pub fn handle_xfer_ack(&self, transfer_id: TransferId, seq_no: u64) -> EngineResult<()> {
        {
            let entry = self
                .outbound
                .get(&transfer_id)
                .ok_or_else(|| EngineError::Corruption("unknown transfer".into()))?;
            let mut state = entry.lock();
            state.in_flight.remove(&seq_no);
            state.window = (state.window.saturating_mul(2)).min(self.window_max).max(self.window_min);
        }
        self.pump(transfer_id)?;

        let (done, region, peer) = {
            let entry = self.outbound.get(&transfer_id).unwrap();
            let state = entry.lock();
            (state.done_sending, state.region, state.peer)
        };
        if done {
            let _ = region;
            self.coordinator.transfer_complete(transfer_id);
            self.outbound.remove(&transfer_id);
            let _ = peer;
        }
        Ok(())
    }

    /// Called once the receiver has drained every object (in this
    /// in-process model, immediately after the last `XFER_OP`): reports
    /// the transfer live to the coordinator.
    pub fn mark_receiver_live(&self, transfer_id: TransferId) {
        self.coordinator.transfer_go_live(transfer_id);
        self.inbound.remove(&transfer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::coordinator::NullConfigService;
    use crate::types::{AttributeType, Schema, Value};

    fn open_layer(region: RegionId) -> (Arc<Datalayer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        layer.register_schema(
            region,
            Schema {
                key_type: AttributeType::Int64,
                attributes: vec![AttributeType::String],
            },
        );
        (Arc::new(layer), dir)
    }

    #[test]
    fn full_handshake_and_transfer_round_trip() {
        let region = RegionId::new(1);
        let (sender_layer, _d1) = open_layer(region);
        sender_layer.put(region, &Value::Int(1), &[Value::Str("a".into())], 1).unwrap();
        sender_layer.put(region, &Value::Int(2), &[Value::Str("b".into())], 2).unwrap();

        let (receiver_layer, _d2) = open_layer(region);

        let bus = Arc::new(LoopbackBus::new());
        let sender_vs = VirtualServerId::new(1);
        let receiver_vs = VirtualServerId::new(2);
        let sender_rx = bus.register(sender_vs);
        let receiver_rx = bus.register(receiver_vs);

        let config = EngineConfig::default();
        let sender_mgr = StateTransferManager::new(sender_layer.clone(), bus.clone(), Arc::new(NullConfigService), &config);
        let receiver_mgr = StateTransferManager::new(receiver_layer.clone(), bus.clone(), Arc::new(NullConfigService), &config);

        let transfer_id = sender_mgr.begin_send(region, receiver_vs).unwrap();
        let hs = receiver_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        match hs {
            Message::XferHs { transfer_id: tid } => {
                receiver_mgr.handle_xfer_hs(tid, sender_vs, region).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }

        let hsa = sender_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        match hsa {
            Message::XferHsa { transfer_id: tid, timestamp } => {
                sender_mgr.handle_xfer_hsa(tid, timestamp).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }

        let ha = receiver_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        match ha {
            Message::XferHa { transfer_id: tid, wipe } => {
                receiver_mgr.handle_xfer_ha(tid, wipe).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }

        let hw = sender_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        match hw {
            Message::XferHw { transfer_id: tid } => {
                sender_mgr.handle_xfer_hw(tid).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }

        for _ in 0..2 {
            let op = receiver_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
            match op {
                Message::XferOp {
                    transfer_id: tid,
                    region_id,
                    seq_no,
                    version,
                    key,
                    value,
                    ..
                } => {
                    receiver_mgr.handle_xfer_op(tid, region_id, seq_no, version, key, value).unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
            let ack = sender_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
            match ack {
                Message::XferAck { transfer_id: tid, seq_no } => {
                    sender_mgr.handle_xfer_ack(tid, seq_no).unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let (attrs, version) = receiver_layer.get(region, &Value::Int(1)).unwrap();
        assert_eq!(version, 1);
        assert_eq!(attrs, vec![Value::Str("a".into())]);
        let (attrs2, version2) = receiver_layer.get(region, &Value::Int(2)).unwrap();
        assert_eq!(version2, 2);
        assert_eq!(attrs2, vec![Value::Str("b".into())]);

        let _ = transfer_id;
    }
}
