//! Background checkpoint writer and collector (spec.md §4.C, "Checkpointer";
//! driven by the replication manager's begin/end-checkpoint boundaries,
//! §4.F).
//!
//! Tasks arrive over a channel rather than being polled for, since a
//! checkpoint boundary is an event the replication manager decides, not
//! state the data layer can discover on its own.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::ids::RegionId;
use crate::worker::Worker;

use super::Datalayer;

pub enum CheckpointTask {
    Create { region: RegionId, checkpoint_no: u64 },
    Collect { region: RegionId, collection_point: u64 },
}

pub struct Checkpointer {
    layer: Arc<Datalayer>,
    rx: Receiver<CheckpointTask>,
    pending: Vec<CheckpointTask>,
}

impl Checkpointer {
    pub fn new(layer: Arc<Datalayer>, rx: Receiver<CheckpointTask>) -> Self {
        Self {
            layer,
            rx,
            pending: Vec::new(),
        }
    }
}

impl Worker for Checkpointer {
    fn thread_name(&self) -> &'static str {
        "checkpointer"
    }

    fn have_work(&self) -> bool {
        !self.rx.is_empty()
    }

    fn copy_work(&mut self) {
        while let Ok(task) = self.rx.try_recv() {
            self.pending.push(task);
        }
    }

    fn do_work(&mut self) {
        for task in self.pending.drain(..) {
            let result = match task {
                CheckpointTask::Create { region, checkpoint_no } => self.layer.create_checkpoint(region, checkpoint_no),
                CheckpointTask::Collect { region, collection_point } => {
                    self.layer.run_checkpoint_gc(region, collection_point)
                }
            };
            if let Err(e) = result {
                log::warn!("checkpointer: task failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeType, Schema};

    #[test]
    fn creates_checkpoint_on_task() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, _) = Datalayer::open(dir.path()).unwrap();
        let layer = Arc::new(layer);
        let region = RegionId::new(1);
        layer.register_schema(
            region,
            Schema {
                key_type: AttributeType::Int64,
                attributes: vec![],
            },
        );
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut checkpointer = Checkpointer::new(layer.clone(), rx);
        tx.send(CheckpointTask::Create {
            region,
            checkpoint_no: 0,
        })
        .unwrap();
        assert!(checkpointer.have_work());
        checkpointer.copy_work();
        checkpointer.do_work();
        assert!(layer.checkpoint_timestamp(region, 0).unwrap().is_some());
    }
}
