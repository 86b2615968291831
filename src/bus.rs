//! Message bus seam (spec.md §1, "Network transport" — out of scope;
//! specified only at the interface).
//!
//! The core assumes it can enqueue a framed message to a destination
//! identified by virtual server or server id, and that delivery wakes the
//! receiver's loop. It does not implement, or depend on, any particular
//! transport.

use crate::error::EngineResult;
use crate::ids::{ServerId, VirtualServerId};
use crate::wire::Message;

pub trait MessageBus: Send + Sync + 'static {
    fn send(&self, to: VirtualServerId, msg: Message) -> EngineResult<()>;

    fn send_to_server(&self, to: ServerId, msg: Message) -> EngineResult<()>;
}

/// An in-process bus used by tests and by `main.rs`'s single-node mode:
/// every virtual server id is routed to a receiver registered in the same
/// process via an unbounded channel, standing in for the real inter-node
/// transport the core deliberately does not specify.
pub struct LoopbackBus {
    routes: dashmap::DashMap<VirtualServerId, crossbeam::channel::Sender<Message>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            routes: dashmap::DashMap::new(),
        }
    }

    pub fn register(&self, vs: VirtualServerId) -> crossbeam::channel::Receiver<Message> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.routes.insert(vs, tx);
        rx
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LoopbackBus {
    fn send(&self, to: VirtualServerId, msg: Message) -> EngineResult<()> {
        match self.routes.get(&to) {
            Some(tx) => {
                let _ = tx.send(msg);
                Ok(())
            }
            None => {
                log::warn!("loopback bus: no route registered for virtual server {to}");
                Ok(())
            }
        }
    }

    fn send_to_server(&self, to: ServerId, msg: Message) -> EngineResult<()> {
        log::debug!("loopback bus: send_to_server({to}) dropped — single-node loopback has no server-level routing");
        let _ = msg;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_route_delivers() {
        let bus = LoopbackBus::new();
        let vs = VirtualServerId::new(1);
        let rx = bus.register(vs);
        bus.send(vs, Message::XferHw { transfer_id: crate::ids::TransferId::new(1) }).unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok());
    }
}
