//! Durable data layer (component C, spec.md §4.C).
//!
//! Wraps a single embedded store and is the sole writer to it. All five
//! on-disk record classes (spec.md §3) live in one flat sled tree so a
//! class-prefixed key range can never straddle a tree boundary.

pub mod checkpointer;
pub mod indexer;
pub mod iterator;
pub mod mediator;
pub mod oplog;
pub mod wiper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::codec::{key as keycodec, object as objectcodec};
use crate::config::InstanceState;
use crate::error::{EngineError, EngineResult};
use crate::ids::{IndexId, RegionId, TransferId, Version};
use crate::index::{self, IndexSpec};
use crate::types::{Schema, Value};

pub use oplog::Timestamp;

const INSTANCE_STATE_KEY: &[u8] = b"_instance_state";

pub struct Datalayer {
    db: sled::Db,
    main: sled::Tree,
    oplog: oplog::Oplog,
    schemas: DashMap<RegionId, Arc<Schema>>,
    indices: DashMap<RegionId, Vec<IndexSpec>>,
    index_usable: DashMap<(RegionId, IndexId), bool>,
    max_version: DashMap<RegionId, AtomicU64>,
    pub(crate) mediator: mediator::WiperIndexerMediator,
    inhibit_gc: AtomicU32,
    inhibit_wipe: AtomicU32,
    wipe_pending: DashMap<RegionId, TransferId>,
    wiped_regions: DashMap<RegionId, bool>,
    next_checkpoint_no: DashMap<RegionId, AtomicU64>,
    checkpoint_gc_point: RwLock<HashMap<RegionId, u64>>,
}

/// A point-in-time view used to build iterators. sled does not expose true
/// MVCC snapshots (SPEC_FULL.md §5); `timestamp` is the oplog watermark
/// observed at creation and is used only to validate that a later replay
/// from it is still possible, not to isolate concurrent live reads.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub timestamp: Timestamp,
}

impl Datalayer {
    pub fn open(path: &std::path::Path) -> EngineResult<(Self, Option<InstanceState>)> {
        let db = sled::open(path)?;
        let main = db.open_tree("main")?;
        let oplog = oplog::Oplog::open(&db)?;

        let layer = Datalayer {
            db,
            main,
            oplog,
            schemas: DashMap::new(),
            indices: DashMap::new(),
            index_usable: DashMap::new(),
            max_version: DashMap::new(),
            mediator: mediator::WiperIndexerMediator::new(),
            inhibit_gc: AtomicU32::new(0),
            inhibit_wipe: AtomicU32::new(0),
            wipe_pending: DashMap::new(),
            wiped_regions: DashMap::new(),
            next_checkpoint_no: DashMap::new(),
            checkpoint_gc_point: RwLock::new(HashMap::new()),
        };

        layer.rebuild_index_usability()?;
        layer.rebuild_max_versions()?;

        let instance = layer.load_instance_state()?;
        Ok((layer, instance))
    }

    // ---- initialization (spec.md §4.C, "Initialization") ----

    fn rebuild_index_usability(&self) -> EngineResult<()> {
        for item in self.main.scan_prefix([keycodec::CLASS_INDEX_MARKER]) {
            let (k, _) = item?;
            if let Some((region, index)) = decode_marker_key(&k) {
                self.index_usable.insert((region, index), true);
            }
        }
        Ok(())
    }

    fn rebuild_max_versions(&self) -> EngineResult<()> {
        for item in self.main.scan_prefix([keycodec::CLASS_OBJECT]) {
            let (k, v) = item?;
            if let Some((region, _)) = keycodec::decode_object_key(&k) {
                if v.len() >= 8 {
                    let version = u64::from_be_bytes(v[0..8].try_into().unwrap());
                    self.bump_version(region, version);
                }
            }
        }
        Ok(())
    }

    fn load_instance_state(&self) -> EngineResult<Option<InstanceState>> {
        match self.main.get(INSTANCE_STATE_KEY)? {
            Some(bytes) => {
                let state: InstanceState = bincode::deserialize(&bytes)
                    .map_err(|e| EngineError::Store(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn save_instance_state(&self, state: &InstanceState) -> EngineResult<()> {
        let bytes = bincode::serialize(state).map_err(|e| EngineError::Store(e.to_string()))?;
        self.main.insert(INSTANCE_STATE_KEY, bytes)?;
        Ok(())
    }

    // ---- schema / index registration ----

    pub fn register_schema(&self, region: RegionId, schema: Schema) {
        self.schemas.insert(region, Arc::new(schema));
    }

    pub fn schema(&self, region: RegionId) -> EngineResult<Arc<Schema>> {
        self.schemas
            .get(&region)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::Store(format!("no schema registered for region {region}")))
    }

    /// Declares a secondary index. New indices start unusable so the
    /// indexer worker builds them in the background (spec.md §3, "Index
    /// usability markers").
    pub fn register_index(&self, region: RegionId, spec: IndexSpec) {
        self.indices.entry(region).or_default().push(spec);
        self.index_usable.entry((region, spec.id)).or_insert(false);
    }

    pub fn index_specs(&self, region: RegionId) -> Vec<IndexSpec> {
        self.indices.get(&region).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn is_index_usable(&self, region: RegionId, index: IndexId) -> bool {
        self.index_usable.get(&(region, index)).map(|v| *v).unwrap_or(false)
    }

    pub fn unusable_indices(&self) -> Vec<(RegionId, IndexId)> {
        self.index_usable
            .iter()
            .filter(|e| !*e.value())
            .map(|e| *e.key())
            .collect()
    }

    pub(crate) fn mark_index_usable(&self, region: RegionId, index: IndexId) -> EngineResult<()> {
        self.main.insert(keycodec::index_marker_key(region, index), &[])?;
        self.index_usable.insert((region, index), true);
        Ok(())
    }

    pub(crate) fn clear_index_records(&self, region: RegionId, index: IndexId) -> EngineResult<()> {
        self.index_usable.insert((region, index), false);
        self.main.remove(keycodec::index_marker_key(region, index))?;
        for item in self.main.scan_prefix(keycodec::index_prefix(region, index)) {
            let (k, _) = item?;
            self.main.remove(k)?;
        }
        Ok(())
    }

    // ---- versions ----

    pub fn bump_version(&self, region: RegionId, version: Version) {
        let entry = self.max_version.entry(region).or_insert_with(|| AtomicU64::new(0));
        let mut cur = entry.load(Ordering::Acquire);
        while version > cur {
            match entry.compare_exchange_weak(cur, version, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn max_version(&self, region: RegionId) -> Version {
        self.max_version
            .get(&region)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    // ---- read/write contract ----

    pub fn get(&self, region: RegionId, key: &Value) -> EngineResult<(Vec<Value>, Version)> {
        let schema = self.schema(region)?;
        let encoded_key = crate::codec::value::index_encoding(key);
        let record_key = keycodec::object_key(region, &encoded_key);
        match self.main.get(&record_key)? {
            Some(bytes) => {
                let (version, attrs) = objectcodec::decode(&bytes, &schema.attributes)
                    .map_err(|e| annotate(e, region, &record_key))?;
                Ok((attrs, version))
            }
            None => Err(EngineError::NotFound),
        }
    }

    pub fn put(&self, region: RegionId, key: &Value, attrs: &[Value], version: Version) -> EngineResult<()> {
        self.overput(region, key, None, attrs, version)
    }

    pub fn del(&self, region: RegionId, key: &Value, old_attrs: Option<&[Value]>) -> EngineResult<()> {
        let schema = self.schema(region)?;
        let encoded_key = crate::codec::value::index_encoding(key);
        let record_key = keycodec::object_key(region, &encoded_key);

        let old_attrs_owned = match old_attrs {
            Some(a) => Some(a.to_vec()),
            None => match self.main.get(&record_key)? {
                Some(bytes) => Some(objectcodec::decode(&bytes, &schema.attributes)?.1),
                None => None,
            },
        };

        let mut batch = sled::Batch::default();
        batch.remove(record_key.clone());
        if let Some(old) = &old_attrs_owned {
            self.apply_index_deletes(region, &encoded_key, old, &mut batch);
        }
        self.main.apply_batch(batch)?;
        self.oplog.append(region, oplog::OplogOp::Delete { key: record_key })?;
        Ok(())
    }

    /// One atomic batch updating the value and all secondary indices
    /// (spec.md §4.C, `overput`). `old_value` is `None` for a fresh key.
    pub fn overput(
        &self,
        region: RegionId,
        key: &Value,
        old_value: Option<&[Value]>,
        new_value: &[Value],
        version: Version,
    ) -> EngineResult<()> {
        let encoded_key = crate::codec::value::index_encoding(key);
        let record_key = keycodec::object_key(region, &encoded_key);
        let record_value = objectcodec::encode(version, new_value);

        let mut batch = sled::Batch::default();
        batch.insert(record_key.clone(), record_value.clone());
        self.apply_index_diff(region, &encoded_key, old_value, new_value, &mut batch);
        self.main.apply_batch(batch)?;
        self.oplog.append(
            region,
            oplog::OplogOp::Put {
                key: record_key,
                value: record_value,
            },
        )?;
        self.bump_version(region, version);
        Ok(())
    }

    /// Used by state transfer, where the receiver doesn't know the prior
    /// value: reads it first, then performs the equivalent of `overput`.
    pub fn uncertain_put(&self, region: RegionId, key: &Value, attrs: &[Value], version: Version) -> EngineResult<()> {
        let old = match self.get(region, key) {
            Ok((attrs, _)) => Some(attrs),
            Err(EngineError::NotFound) => None,
            Err(e) => return Err(e),
        };
        self.overput(region, key, old.as_deref(), attrs, version)
    }

    pub fn uncertain_del(&self, region: RegionId, key: &Value) -> EngineResult<()> {
        match self.get(region, key) {
            Ok((attrs, _)) => self.del(region, key, Some(&attrs)),
            Err(EngineError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Builds every `'i'` entry for one index over the whole region in a
    /// single batch (spec.md §4.C, "Indexer"). Used only while the index is
    /// still marked unusable.
    pub(crate) fn build_index(&self, region: RegionId, spec: &index::IndexSpec) -> EngineResult<()> {
        let schema = self.schema(region)?;
        let mut batch = sled::Batch::default();
        for item in self.region_iterator(region) {
            let (key, value) = item?;
            let (_, encoded_key) = keycodec::decode_object_key(&key)
                .ok_or_else(|| EngineError::Corruption("malformed object key".into()))?;
            let (_, attrs) = objectcodec::decode(&value, &schema.attributes)?;
            let attr_val = attrs.get(spec.attr);
            let change = index::index_changes(spec, region, encoded_key, false, None, attr_val);
            for p in change.puts {
                batch.insert(p, Vec::new());
            }
        }
        self.main.apply_batch(batch)?;
        Ok(())
    }

    fn apply_index_diff(
        &self,
        region: RegionId,
        encoded_key: &[u8],
        old: Option<&[Value]>,
        new: &[Value],
        batch: &mut sled::Batch,
    ) {
        let key_fixed = false; // primary keys are variable-width in general
        for spec in self.index_specs(region) {
            let old_attr = old.and_then(|a| a.get(spec.attr));
            let new_attr = new.get(spec.attr);
            let change = index::index_changes(&spec, region, encoded_key, key_fixed, old_attr, new_attr);
            for d in change.deletes {
                batch.remove(d);
            }
            for p in change.puts {
                batch.insert(p, Vec::new());
            }
        }
    }

    fn apply_index_deletes(&self, region: RegionId, encoded_key: &[u8], old: &[Value], batch: &mut sled::Batch) {
        let key_fixed = false;
        for spec in self.index_specs(region) {
            let old_attr = old.get(spec.attr);
            let change = index::index_changes(&spec, region, encoded_key, key_fixed, old_attr, None);
            for d in change.deletes {
                batch.remove(d);
            }
        }
    }

    // ---- snapshots / iteration ----

    pub fn make_snapshot(&self) -> EngineResult<Snapshot> {
        Ok(Snapshot {
            timestamp: self.oplog.current_timestamp()?,
        })
    }

    pub fn region_iterator(&self, region: RegionId) -> iterator::RegionIterator {
        iterator::RegionIterator::new(self.main.clone(), region)
    }

    pub fn range_index_iterator(
        &self,
        region: RegionId,
        index: IndexId,
        range: index::Range,
    ) -> iterator::RangeIndexIterator {
        iterator::RangeIndexIterator::new(self.main.clone(), region, index, range)
    }

    pub fn iterator_from_check(
        &self,
        region: RegionId,
        index: IndexId,
        check: index::PointCheck,
    ) -> iterator::RangeIndexIterator {
        iterator::RangeIndexIterator::from_point_check(self.main.clone(), region, index, check)
    }

    pub fn intersect_iterator(
        &self,
        iters: Vec<iterator::RangeIndexIterator>,
    ) -> iterator::IntersectIterator {
        iterator::IntersectIterator::new(iters)
    }

    pub fn search_iterator(
        &self,
        inner: iterator::IntersectIterator,
        region: RegionId,
        checks: Vec<crate::types::Check>,
    ) -> iterator::SearchIterator<'_> {
        iterator::SearchIterator::new(self, region, inner, checks)
    }

    /// Chooses the most selective index covering each equality/range check
    /// and intersects them, wrapping the result with a full attribute
    /// filter (spec.md §4.C, `make_search_iterator`).
    pub fn make_search_iterator(
        &self,
        region: RegionId,
        checks: Vec<crate::types::Check>,
    ) -> EngineResult<iterator::SearchIterator<'_>> {
        let iters = self.choose_index_candidates(region, &checks);
        Ok(self.search_iterator(self.intersect_iterator(iters), region, checks))
    }

    /// Opens a resumable `SEARCH_START`/`SEARCH_NEXT`/`SEARCH_STOP` session
    /// (SPEC_FULL.md §3) over the same query plan `make_search_iterator`
    /// builds, but owning `self` via `Arc` so it can be driven across
    /// separate calls instead of within one borrow.
    pub fn start_search(
        self: &Arc<Self>,
        region: RegionId,
        checks: Vec<crate::types::Check>,
    ) -> iterator::SearchSession {
        let iters = self.choose_index_candidates(region, &checks);
        iterator::SearchSession::new(self.clone(), region, self.intersect_iterator(iters), checks)
    }

    fn choose_index_candidates(&self, region: RegionId, checks: &[crate::types::Check]) -> Vec<iterator::RangeIndexIterator> {
        let mut candidates = Vec::new();
        for spec in self.index_specs(region) {
            if !self.is_index_usable(region, spec.id) {
                continue;
            }
            if let Some(range) = range_for_attr(checks, spec.attr) {
                let cost = self.approximate_size(region, spec.id, &range);
                candidates.push((cost, spec.id, range));
            }
        }
        candidates.sort_by_key(|(cost, ..)| *cost);
        candidates
            .into_iter()
            .take(4)
            .map(|(_, id, range)| self.range_index_iterator(region, id, range))
            .collect()
    }

    /// Heuristic cost estimate for a range scan: the number of keys it
    /// would visit, capped so the estimate itself stays cheap. sled has no
    /// O(1) approximate-size API (unlike the LevelDB family the original
    /// wraps), so this samples up to `SAMPLE_CAP` keys.
    pub fn approximate_size(&self, region: RegionId, index: IndexId, range: &index::Range) -> u64 {
        const SAMPLE_CAP: u64 = 4096;
        let prefix = keycodec::index_prefix(region, index);
        let lower = match &range.lower {
            Some(l) => [prefix.clone(), l.clone()].concat(),
            None => prefix.clone(),
        };
        let mut count = 0u64;
        for item in self.main.range(lower..).keys().take(SAMPLE_CAP as usize) {
            let Ok(k) = item else { break };
            if !k.starts_with(&prefix) {
                break;
            }
            if let Some(upper) = &range.upper {
                let value_part = &k[prefix.len()..];
                if value_part > upper.as_slice() {
                    break;
                }
            }
            count += 1;
        }
        count
    }

    // ---- checkpoints ----

    pub fn next_checkpoint_no(&self, region: RegionId) -> u64 {
        let entry = self
            .next_checkpoint_no
            .entry(region)
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(1, Ordering::AcqRel)
    }

    pub fn create_checkpoint(&self, region: RegionId, checkpoint_no: u64) -> EngineResult<()> {
        let timestamp = self.oplog.current_timestamp()?;
        self.main
            .insert(keycodec::checkpoint_key(region, checkpoint_no), timestamp.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn checkpoint_timestamp(&self, region: RegionId, checkpoint_no: u64) -> EngineResult<Option<Timestamp>> {
        match self.main.get(keycodec::checkpoint_key(region, checkpoint_no))? {
            Some(v) => Ok(Some(u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))),
            None => Ok(None),
        }
    }

    /// Requests garbage collection of every checkpoint below
    /// `collection_point` and advances the oplog's retained watermark to
    /// the minimum timestamp still referenced (spec.md §4.C, Checkpointer).
    pub fn set_checkpoint_gc(&self, region: RegionId, collection_point: u64) {
        self.checkpoint_gc_point.write().insert(region, collection_point);
    }

    pub fn pending_checkpoint_gc(&self) -> HashMap<RegionId, u64> {
        self.checkpoint_gc_point.read().clone()
    }

    pub fn run_checkpoint_gc(&self, region: RegionId, collection_point: u64) -> EngineResult<()> {
        if self.inhibit_gc.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        let mut min_timestamp = None;
        let mut superseded = Vec::new();
        for item in self.main.scan_prefix(keycodec::checkpoint_region_prefix(region)) {
            let (k, v) = item?;
            let (_, checkpoint_no) = keycodec::decode_checkpoint_key(&k)
                .ok_or_else(|| EngineError::Corruption("malformed checkpoint key".into()))?;
            let ts = u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8]));
            if checkpoint_no >= collection_point {
                min_timestamp = Some(min_timestamp.map_or(ts, |m: u64| m.min(ts)));
            } else {
                superseded.push(k);
            }
        }
        if let Some(ts) = min_timestamp {
            self.oplog.allow_gc_before(ts)?;
        }
        for k in superseded {
            self.main.remove(k)?;
        }
        self.checkpoint_gc_point.write().remove(&region);
        Ok(())
    }

    pub fn inhibit_gc(&self) {
        self.inhibit_gc.fetch_add(1, Ordering::AcqRel);
    }

    pub fn permit_gc(&self) {
        self.inhibit_gc.fetch_sub(1, Ordering::AcqRel);
    }

    // ---- wiping / state transfer support ----

    pub fn request_wipe(&self, transfer_id: TransferId, region: RegionId) {
        self.wipe_pending.insert(region, transfer_id);
        self.wiped_regions.insert(region, false);
    }

    pub fn region_will_be_wiped(&self, region: RegionId) -> bool {
        self.wipe_pending.contains_key(&region)
    }

    pub fn region_is_wiped(&self, region: RegionId) -> bool {
        self.wiped_regions.get(&region).map(|v| *v).unwrap_or(false)
    }

    pub fn inhibit_wiping(&self) {
        self.inhibit_wipe.fetch_add(1, Ordering::AcqRel);
    }

    pub fn permit_wiping(&self) {
        self.inhibit_wipe.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn wiping_inhibited(&self) -> bool {
        self.inhibit_wipe.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pending_wipes(&self) -> Vec<(RegionId, TransferId)> {
        self.wipe_pending.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Wipes all records of `region` (every `'o'`, `'i'`, `'I'`, `'c'`
    /// record), matching spec.md §4.C's Wiper contract.
    pub(crate) fn wipe_region(&self, region: RegionId) -> EngineResult<()> {
        for class in [
            keycodec::CLASS_OBJECT,
            keycodec::CLASS_INDEX,
            keycodec::CLASS_INDEX_MARKER,
        ] {
            let mut prefix = vec![class];
            crate::codec::varint::encode(region.get(), &mut prefix);
            for item in self.main.scan_prefix(prefix) {
                let (k, _) = item?;
                self.main.remove(k)?;
            }
        }
        for item in self.main.scan_prefix(keycodec::checkpoint_region_prefix(region)) {
            let (k, _) = item?;
            self.main.remove(k)?;
        }
        self.index_usable.retain(|(r, _), _| *r != region);
        self.wipe_pending.remove(&region);
        self.wiped_regions.insert(region, true);
        Ok(())
    }

    /// Returns a replay iterator positioned at `checkpoint_no`'s
    /// timestamp, plus whether the receiver must wipe first because that
    /// timestamp has already been garbage collected (spec.md §4.C).
    pub fn replay_region_from_checkpoint(
        &self,
        region: RegionId,
        checkpoint_no: u64,
    ) -> EngineResult<(iterator::ReplayIterator, bool)> {
        let timestamp = self
            .checkpoint_timestamp(region, checkpoint_no)?
            .unwrap_or(0);
        let wipe_required = !self.oplog.can_replay_from(timestamp)?;
        Ok((iterator::ReplayIterator::new(&self.oplog, region, timestamp), wipe_required))
    }

    pub fn current_timestamp(&self) -> EngineResult<Timestamp> {
        self.oplog.current_timestamp()
    }

    /// Whether the oplog still retains enough history to replay a peer
    /// from `timestamp` forward, without a full wipe-and-reload (spec.md
    /// §4.G, "wipe-before-load").
    pub fn oplog_can_replay_from(&self, timestamp: Timestamp) -> EngineResult<bool> {
        self.oplog.can_replay_from(timestamp)
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn range_for_attr(checks: &[crate::types::Check], attr: usize) -> Option<index::Range> {
    use crate::types::Check;
    let mut range = index::Range::default();
    let mut touched = false;
    for c in checks {
        match c {
            Check::Equals { attr: a, value } if *a == attr => {
                let enc = crate::codec::value::index_encoding(value);
                range.lower = Some(enc.clone());
                range.upper = Some(enc);
                touched = true;
            }
            Check::GreaterEqual { attr: a, value } if *a == attr => {
                range.lower = Some(crate::codec::value::index_encoding(value));
                touched = true;
            }
            Check::LessEqual { attr: a, value } if *a == attr => {
                range.upper = Some(crate::codec::value::index_encoding(value));
                touched = true;
            }
            _ => {}
        }
    }
    touched.then_some(range)
}

fn decode_marker_key(key: &[u8]) -> Option<(RegionId, IndexId)> {
    if key.first() != Some(&keycodec::CLASS_INDEX_MARKER) {
        return None;
    }
    let (region, used) = crate::codec::varint::decode(&key[1..])?;
    let (index, _) = crate::codec::varint::decode(&key[1 + used..])?;
    Some((RegionId::new(region), IndexId::new(index)))
}

fn annotate(err: EngineError, region: RegionId, key: &[u8]) -> EngineError {
    match err {
        EngineError::BadEncoding { reason, .. } => EngineError::BadEncoding {
            region: region.get(),
            key_hex: crate::error::hex_key_context(key),
            reason,
        },
        other => other,
    }
}
