//! Cluster configuration service seam (spec.md §1, "The cluster
//! configuration service" — out of scope; specified only at the
//! interface).
//!
//! The core consumes `reconfigure`/`pause`/`unpause` brackets and reports
//! stability and transfer progress back; it never elects leaders or
//! manages membership itself.

use crate::ids::{RegionId, TransferId, Version, VirtualServerId};

/// One region's chain as handed down by a configuration, head first.
#[derive(Debug, Clone)]
pub struct RegionRoute {
    pub region: RegionId,
    pub chain: Vec<VirtualServerId>,
    /// Set during a subspace change: the region a tail-of-chain op should
    /// continue into (spec.md §4.F routing table).
    pub next_region: Option<RegionId>,
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub version: u64,
    pub routes: Vec<RegionRoute>,
}

pub trait ConfigService: Send + Sync + 'static {
    /// Reported by the retransmitter once `idcol[region] >= last_stable`
    /// (spec.md §4.F, "Retransmitter" step 4).
    fn report_stable(&self, region: RegionId, version: Version, checkpoint_num: u64);

    /// Reported once a transfer's receiver has drained `XFER_HW`
    /// (spec.md §2, state-transfer data flow).
    fn transfer_go_live(&self, transfer_id: TransferId);

    fn transfer_complete(&self, transfer_id: TransferId);
}

/// A `ConfigService` that only logs, for single-node operation and tests
/// that don't exercise reconfiguration.
#[derive(Default)]
pub struct NullConfigService;

impl ConfigService for NullConfigService {
    fn report_stable(&self, region: RegionId, version: Version, checkpoint_num: u64) {
        log::debug!("stable: region={region:?} version={version} checkpoint={checkpoint_num}");
    }

    fn transfer_go_live(&self, transfer_id: TransferId) {
        log::info!("transfer {transfer_id:?} went live");
    }

    fn transfer_complete(&self, transfer_id: TransferId) {
        log::info!("transfer {transfer_id:?} complete");
    }
}
