//! Opaque "LSM timestamp" and replay log.
//!
//! sled, unlike the LevelDB derivative the original daemon wraps, does not
//! expose a sequence-numbered read snapshot or a way to iterate "every
//! mutation since sequence N." This module layers exactly that on top of
//! sled: every mutating batch also appends one entry to an `_oplog` tree
//! keyed by a monotonic `u64` counter, which doubles as the "opaque LSM
//! timestamp" spec.md §3/§4.C/§4.G refer to (`create_checkpoint`,
//! `replay_region_from_checkpoint`, `allow_gc_before`). This is a
//! documented divergence from a literal LevelDB-backed implementation, not
//! an accidental one (see SPEC_FULL.md §5).

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::ids::RegionId;

pub type Timestamp = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OplogOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub region: u64,
    pub op: OplogOp,
}

pub struct Oplog {
    tree: sled::Tree,
    meta: sled::Tree,
}

const NEXT_SEQ_KEY: &[u8] = b"next_seq";
const OLDEST_RETAINED_KEY: &[u8] = b"oldest_retained";

impl Oplog {
    pub fn open(db: &sled::Db) -> EngineResult<Self> {
        let tree = db.open_tree("_oplog")?;
        let meta = db.open_tree("_oplog_meta")?;
        Ok(Self { tree, meta })
    }

    pub fn current_timestamp(&self) -> EngineResult<Timestamp> {
        Ok(self
            .meta
            .get(NEXT_SEQ_KEY)?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    pub fn oldest_retained(&self) -> EngineResult<Timestamp> {
        Ok(self
            .meta
            .get(OLDEST_RETAINED_KEY)?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    /// Appends one entry and returns the timestamp it was stamped with.
    /// Called from inside the same batch as the main-tree mutation by the
    /// caller so the two stay consistent (sled batches are atomic).
    pub fn append(&self, region: RegionId, op: OplogOp) -> EngineResult<Timestamp> {
        let seq = self.current_timestamp()?;
        let entry = OplogEntry {
            region: region.get(),
            op,
        };
        let bytes = bincode::serialize(&entry)
            .map_err(|e| crate::error::EngineError::Store(e.to_string()))?;
        self.tree.insert(seq.to_be_bytes(), bytes)?;
        self.meta.insert(NEXT_SEQ_KEY, (seq + 1).to_be_bytes().to_vec())?;
        Ok(seq)
    }

    /// Every entry with `seq >= from` (inclusive), in order. Used to drive
    /// the replay phase of indexing and of state transfer.
    pub fn replay_from(&self, from: Timestamp) -> impl Iterator<Item = EngineResult<(Timestamp, OplogEntry)>> {
        self.tree.range(from.to_be_bytes()..).map(|res| {
            let (k, v) = res.map_err(crate::error::EngineError::from)?;
            let seq = u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0; 8]));
            let entry: OplogEntry = bincode::deserialize(&v)
                .map_err(|e| crate::error::EngineError::BadEncoding {
                    region: 0,
                    key_hex: String::new(),
                    reason: e.to_string(),
                })?;
            Ok((seq, entry))
        })
    }

    /// Returns true if `timestamp` is still within the retained window
    /// (i.e. a replay from it would be complete, not truncated by GC).
    pub fn can_replay_from(&self, timestamp: Timestamp) -> EngineResult<bool> {
        Ok(timestamp >= self.oldest_retained()?)
    }

    /// Deletes entries older than `timestamp` and advances the retained
    /// watermark. Mirrors the checkpointer's call into
    /// `allow_gc_before` (spec.md §4.C).
    pub fn allow_gc_before(&self, timestamp: Timestamp) -> EngineResult<()> {
        let oldest = self.oldest_retained()?;
        if timestamp <= oldest {
            return Ok(());
        }
        for key in self
            .tree
            .range(oldest.to_be_bytes()..timestamp.to_be_bytes())
            .keys()
        {
            let key = key?;
            self.tree.remove(key)?;
        }
        self.meta
            .insert(OLDEST_RETAINED_KEY, timestamp.to_be_bytes().to_vec())?;
        Ok(())
    }
}
