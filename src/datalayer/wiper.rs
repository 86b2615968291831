//! Background region wiper (spec.md §4.C, "Wiper"; §4.G "wipe-before-load").
//!
//! A region is wiped right before state transfer loads a fresh copy into it
//! (or when a reconfiguration moves the region away entirely). Wiping is
//! mutually exclusive with indexing the same region via the shared
//! mediator, and can itself be inhibited while a caller holds a read that
//! must see a stable region (`inhibit_wiping`).

use std::sync::Arc;

use crate::ids::{RegionId, TransferId};
use crate::worker::Worker;

use super::Datalayer;

pub struct Wiper {
    layer: Arc<Datalayer>,
    pending: Vec<(RegionId, TransferId)>,
}

impl Wiper {
    pub fn new(layer: Arc<Datalayer>) -> Self {
        Self {
            layer,
            pending: Vec::new(),
        }
    }
}

impl Worker for Wiper {
    fn thread_name(&self) -> &'static str {
        "wiper"
    }

    fn have_work(&self) -> bool {
        !self.layer.wiping_inhibited() && !self.layer.pending_wipes().is_empty()
    }

    fn copy_work(&mut self) {
        self.pending = if self.layer.wiping_inhibited() {
            Vec::new()
        } else {
            self.layer.pending_wipes()
        };
    }

    fn do_work(&mut self) {
        for (region, transfer_id) in self.pending.drain(..) {
            if !self.layer.mediator.try_claim_for_wipe(region) {
                continue;
            }
            let result = self.layer.wipe_region(region);
            self.layer.mediator.release_wipe(region);
            match result {
                Ok(()) => log::debug!("wiper: cleared region {region:?} for transfer {transfer_id:?}"),
                Err(e) => log::warn!("wiper: failed to wipe region {region:?}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipes_requested_region() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let layer = Arc::new(layer);
        let region = RegionId::new(1);
        layer.register_schema(
            region,
            crate::types::Schema {
                key_type: crate::types::AttributeType::Int64,
                attributes: vec![],
            },
        );
        layer.put(region, &crate::types::Value::Int(1), &[], 1).unwrap();
        layer.request_wipe(TransferId::new(9), region);

        let mut wiper = Wiper::new(layer.clone());
        assert!(wiper.have_work());
        wiper.copy_work();
        wiper.do_work();

        assert!(layer.region_is_wiped(region));
        assert!(matches!(
            layer.get(region, &crate::types::Value::Int(1)),
            Err(crate::error::EngineError::NotFound)
        ));
    }

    #[test]
    fn inhibited_wiping_defers_work() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let layer = Arc::new(layer);
        let region = RegionId::new(1);
        layer.inhibit_wiping();
        layer.request_wipe(TransferId::new(1), region);

        let wiper = Wiper::new(layer.clone());
        assert!(!wiper.have_work());
    }
}
