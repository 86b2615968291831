//! Identifier generator and collector (component H, spec.md §4.H).
//!
//! `idgen[region]` is a monotonic counter; `idcol[region]` is the lower
//! bound below which every version is known to be collected. The
//! collected-range set is represented as a sorted run of half-open
//! intervals above the lower bound, matching spec.md's "compact
//! run-length encoded set of collected ranges" — versions collect out of
//! order (concurrent client puts race across keys) and the lower bound
//! only advances across a contiguous prefix.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::{RegionId, Version};

#[derive(Default)]
struct RegionCounters {
    next: Version,
    lower_bound: Version,
    /// Collected versions `>= lower_bound` that are not yet contiguous
    /// with it, keyed by range start -> exclusive end.
    ranges: BTreeMap<Version, Version>,
}

/// Per-region monotonic version counter plus the collected-range tracker
/// the retransmitter uses to close gaps (spec.md §4.F, "Version assignment
/// & gap closing").
pub struct IdGenCol {
    regions: DashMap<RegionId, Mutex<RegionCounters>>,
}

impl IdGenCol {
    pub fn new() -> Self {
        Self {
            regions: DashMap::new(),
        }
    }

    fn entry(&self, region: RegionId) -> dashmap::mapref::one::Ref<'_, RegionId, Mutex<RegionCounters>> {
        self.regions
            .entry(region)
            .or_insert_with(|| Mutex::new(RegionCounters::default()));
        self.regions.get(&region).unwrap()
    }

    /// Next-to-generate version. Wait-free per spec.md §4.H.
    pub fn peek(&self, region: RegionId) -> Version {
        self.entry(region).lock().next
    }

    /// Returns the current version and increments. Point-leader only.
    pub fn next(&self, region: RegionId) -> Version {
        let mut c = self.entry(region).lock();
        let v = c.next;
        c.next += 1;
        v
    }

    /// Ensures `peek(region) >= v + 1`.
    pub fn bump(&self, region: RegionId, v: Version) {
        let mut c = self.entry(region).lock();
        if c.next <= v {
            c.next = v + 1;
        }
    }

    /// Marks `v` as no longer in flight. If `v == lower_bound`, advances
    /// the lower bound across the contiguous prefix this collection forms.
    pub fn collect(&self, region: RegionId, v: Version) {
        let mut c = self.entry(region).lock();
        if v < c.lower_bound {
            return; // already collected
        }
        if v == c.lower_bound {
            c.lower_bound += 1;
            // Absorb any adjacent ranges the new lower bound now touches.
            while let Some((&start, &end)) = c.ranges.iter().next() {
                if start > c.lower_bound {
                    break;
                }
                if end > c.lower_bound {
                    c.lower_bound = end;
                }
                c.ranges.remove(&start);
            }
        } else {
            merge_range(&mut c.ranges, v, v + 1);
        }
    }

    pub fn lower_bound(&self, region: RegionId) -> Version {
        self.entry(region).lock().lower_bound
    }

    /// Collects every version below `peeked` not present in `live` — the
    /// retransmitter's gap-closing scan (spec.md §4.F, "Retransmitter" step
    /// 3): squeezes out transient gaps left by racing client puts to
    /// distinct keys in the same region.
    pub fn close_gaps(&self, region: RegionId, peeked: Version, live: &std::collections::BTreeSet<Version>) {
        let lower = self.lower_bound(region);
        for v in lower..peeked {
            if !live.contains(&v) {
                self.collect(region, v);
            }
        }
    }

    /// Initializes state for a new set of regions at reconfiguration
    /// (spec.md §4.H, `adopt`). Existing regions are left untouched.
    pub fn adopt(&self, regions: &[RegionId]) {
        for &r in regions {
            self.regions
                .entry(r)
                .or_insert_with(|| Mutex::new(RegionCounters::default()));
        }
    }
}

impl Default for IdGenCol {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_range(ranges: &mut BTreeMap<Version, Version>, mut start: Version, mut end: Version) {
    // Merge with a preceding range that abuts or overlaps [start, end).
    if let Some((&prev_start, &prev_end)) = ranges.range(..=start).next_back() {
        if prev_end >= start {
            start = prev_start;
            end = end.max(prev_end);
            ranges.remove(&prev_start);
        }
    }
    // Merge with any following ranges that abut or overlap.
    let mut to_remove = Vec::new();
    for (&s, &e) in ranges.range(start..) {
        if s > end {
            break;
        }
        end = end.max(e);
        to_remove.push(s);
    }
    for s in to_remove {
        ranges.remove(&s);
    }
    ranges.insert(start, end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_closes_out_of_order() {
        let g = IdGenCol::new();
        let r = RegionId::new(1);
        let _ = g.next(r); // 0
        let _ = g.next(r); // 1
        let _ = g.next(r); // 2
        assert_eq!(g.lower_bound(r), 0);
        g.collect(r, 1);
        assert_eq!(g.lower_bound(r), 0); // 0 still missing
        g.collect(r, 0);
        assert_eq!(g.lower_bound(r), 2); // absorbed 0 and the queued 1
        g.collect(r, 2);
        assert_eq!(g.lower_bound(r), 3);
        assert_eq!(g.lower_bound(r), g.peek(r));
    }

    #[test]
    fn bump_never_moves_peek_backwards() {
        let g = IdGenCol::new();
        let r = RegionId::new(1);
        g.bump(r, 10);
        assert_eq!(g.peek(r), 11);
        g.bump(r, 3);
        assert_eq!(g.peek(r), 11);
    }
}
