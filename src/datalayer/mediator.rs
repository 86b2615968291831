//! Wiper/indexer mutual exclusion (spec.md §4.C, "Wiper/indexer mediator";
//! §4.G, "Interaction with indexer/wiper").
//!
//! Two single-slot cells: a wiper claims the region slot iff the indexer's
//! cell does not already hold that region, and vice versa. Each side clears
//! its own slot at the end of one work cycle. This is the only inter-worker
//! mutex in the engine beyond each component's own locks.

use parking_lot::Mutex;

use crate::ids::RegionId;

#[derive(Default)]
pub struct WiperIndexerMediator {
    wiper_region: Mutex<Option<RegionId>>,
    indexer_region: Mutex<Option<RegionId>>,
}

impl WiperIndexerMediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim `region` for wiping. Fails if the indexer
    /// currently holds the same region.
    pub fn try_claim_for_wipe(&self, region: RegionId) -> bool {
        let indexer = self.indexer_region.lock();
        if *indexer == Some(region) {
            return false;
        }
        drop(indexer);
        let mut wiper = self.wiper_region.lock();
        *wiper = Some(region);
        true
    }

    pub fn release_wipe(&self, region: RegionId) {
        let mut wiper = self.wiper_region.lock();
        if *wiper == Some(region) {
            *wiper = None;
        }
    }

    /// Attempts to claim `region` for indexing. Fails if the wiper
    /// currently holds the same region.
    pub fn try_claim_for_index(&self, region: RegionId) -> bool {
        let wiper = self.wiper_region.lock();
        if *wiper == Some(region) {
            return false;
        }
        drop(wiper);
        let mut indexer = self.indexer_region.lock();
        *indexer = Some(region);
        true
    }

    pub fn release_index(&self, region: RegionId) {
        let mut indexer = self.indexer_region.lock();
        if *indexer == Some(region) {
            *indexer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutually_excludes_same_region() {
        let m = WiperIndexerMediator::new();
        let r = RegionId::new(1);
        assert!(m.try_claim_for_index(r));
        assert!(!m.try_claim_for_wipe(r));
        m.release_index(r);
        assert!(m.try_claim_for_wipe(r));
    }

    #[test]
    fn distinct_regions_do_not_interfere() {
        let m = WiperIndexerMediator::new();
        assert!(m.try_claim_for_index(RegionId::new(1)));
        assert!(m.try_claim_for_wipe(RegionId::new(2)));
    }
}
