//! Background index builder (spec.md §4.C, "Indexer"; §4.G interaction
//! with the wiper via the mediator).
//!
//! Scans `Datalayer::unusable_indices` once per wake and, for each pair the
//! mediator lets it claim, rebuilds every `'i'` entry for that region+index
//! from the live objects before flipping the usability marker.

use std::sync::Arc;

use crate::ids::{IndexId, RegionId};
use crate::worker::Worker;

use super::Datalayer;

pub struct Indexer {
    layer: Arc<Datalayer>,
    pending: Vec<(RegionId, IndexId)>,
}

impl Indexer {
    pub fn new(layer: Arc<Datalayer>) -> Self {
        Self {
            layer,
            pending: Vec::new(),
        }
    }
}

impl Worker for Indexer {
    fn thread_name(&self) -> &'static str {
        "indexer"
    }

    fn have_work(&self) -> bool {
        !self.layer.unusable_indices().is_empty()
    }

    fn copy_work(&mut self) {
        self.pending = self.layer.unusable_indices();
    }

    fn do_work(&mut self) {
        for (region, index) in self.pending.drain(..) {
            if !self.layer.mediator.try_claim_for_index(region) {
                continue;
            }
            let result = build_one(&self.layer, region, index);
            self.layer.mediator.release_index(region);
            if let Err(e) = result {
                log::warn!("indexer: failed to build index {index:?} of region {region:?}: {e}");
            }
        }
    }
}

fn build_one(layer: &Datalayer, region: RegionId, index: IndexId) -> crate::error::EngineResult<()> {
    let spec = layer
        .index_specs(region)
        .into_iter()
        .find(|s| s.id == index)
        .ok_or_else(|| crate::error::EngineError::Store("index spec vanished mid-build".into()))?;
    layer.build_index(region, &spec)?;
    layer.mark_index_usable(region, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSpec;
    use crate::types::{AttributeType, Schema, Value};

    #[test]
    fn builds_then_marks_usable() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let layer = Arc::new(layer);
        let region = RegionId::new(1);
        layer.register_schema(
            region,
            Schema {
                key_type: AttributeType::Int64,
                attributes: vec![AttributeType::String],
            },
        );
        layer
            .put(region, &Value::Int(1), &[Value::Str("a".into())], 1)
            .unwrap();
        let spec = IndexSpec {
            id: IndexId::new(1),
            attr: 0,
            ty: AttributeType::String,
        };
        layer.register_index(region, spec);
        assert!(!layer.is_index_usable(region, spec.id));

        let mut indexer = Indexer::new(layer.clone());
        assert!(indexer.have_work());
        indexer.copy_work();
        indexer.do_work();

        assert!(layer.is_index_usable(region, spec.id));
    }
}
