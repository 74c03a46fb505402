//! Pointer provenance tracking (spec §3 "Pointer object", §4.4).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::interval_map::IntervalMapVector;

/// A pointer's provenance: the base address of the allocation it was minted
/// from, and the allocation's identity at mint time. Zero base means
/// "null / unknown origin" and always compares unequal to any live tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PointerTarget {
    base: u64,
    temporal_id: u64,
}

impl PointerTarget {
    pub const NULL: PointerTarget = PointerTarget { base: 0, temporal_id: 0 };

    pub fn new(base: u64, temporal_id: u64) -> Self {
        PointerTarget { base, temporal_id }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn temporal_id(&self) -> u64 {
        self.temporal_id
    }

    pub fn is_null(&self) -> bool {
        self.base == 0
    }
}

/// A per-base-address monotonic counter incremented whenever a region's
/// identity turns over (spec P6: once incremented past a value, that value
/// is never observed again for that base).
#[derive(Default)]
pub struct TemporalIdTable {
    next: Mutex<HashMap<u64, u64>>,
}

impl TemporalIdTable {
    pub fn new() -> Self {
        TemporalIdTable::default()
    }

    /// Returns the current (not-yet-incremented) temporal ID for `base`,
    /// minting generation 1 if this is the first time `base` is seen.
    pub fn current(&self, base: u64) -> u64 {
        let mut map = self.next.lock().unwrap();
        *map.entry(base).or_insert(1)
    }

    /// Increments and returns the new temporal ID for `base`: called when a
    /// region at `base` is (re)allocated.
    pub fn bump(&self, base: u64) -> u64 {
        let mut map = self.next.lock().unwrap();
        let entry = map.entry(base).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn mint(&self, base: u64) -> PointerTarget {
        PointerTarget::new(base, self.bump(base))
    }
}

/// Process-wide map from the byte address a pointer is stored at to its
/// provenance tag (spec §3 "in-memory pointer objects").
#[derive(Default)]
pub struct InMemoryPointerObjectMap {
    entries: HashMap<u64, PointerTarget>,
}

impl InMemoryPointerObjectMap {
    pub fn new() -> Self {
        InMemoryPointerObjectMap::default()
    }

    /// Commits `tag` at `addr`, clearing any tags that previously overlapped
    /// `[addr, addr + ptr_size)` (spec §4.4 "Store of a pointer type").
    pub fn set(&mut self, addr: u64, ptr_size: u64, tag: PointerTarget) {
        self.clear_range(addr, ptr_size);
        self.entries.insert(addr, tag);
    }

    pub fn get(&self, addr: u64) -> PointerTarget {
        self.entries.get(&addr).copied().unwrap_or(PointerTarget::NULL)
    }

    /// Clears every pointer-object entry whose address lies in
    /// `[addr, addr+len)`. Used both by plain stores (of the write's own
    /// width) and by memmove/memcpy destinations (of the whole copied span).
    pub fn clear_range(&mut self, addr: u64, len: u64) {
        self.entries.retain(|&k, _| k < addr || k >= addr + len);
    }

    /// Copies entries from `[src, src+n)` to `[dst, dst+n)`, offset
    /// preserving, after clearing the destination range. Uses a staging
    /// copy so an intra-range move (overlapping src/dst) is unaffected by
    /// write order (spec §4.4 "memmove / memcpy / byval argument").
    pub fn copy_range(&mut self, src: u64, dst: u64, n: u64) {
        let staged: Vec<(u64, PointerTarget)> = self
            .entries
            .iter()
            .filter(|&(&k, _)| k >= src && k < src + n)
            .map(|(&k, &v)| (k - src + dst, v))
            .collect();
        self.clear_range(dst, n);
        for (k, v) in staged {
            self.entries.insert(k, v);
        }
    }
}

/// Per-function map from SSA value index to pointer tag, scoped to the
/// active stack frame (spec §3 "per-function pointer object map").
#[derive(Default)]
pub struct FunctionPointerObjectMap {
    entries: HashMap<u32, PointerTarget>,
}

impl FunctionPointerObjectMap {
    pub fn new() -> Self {
        FunctionPointerObjectMap::default()
    }

    pub fn set(&mut self, ssa_value: u32, tag: PointerTarget) {
        self.entries.insert(ssa_value, tag);
    }

    pub fn get(&self, ssa_value: u32) -> PointerTarget {
        self.entries.get(&ssa_value).copied().unwrap_or(PointerTarget::NULL)
    }
}

/// Known-memory interval map keyed by address, used for library-internal
/// static regions (spec §4.10, `known memory region`). Separate from
/// `TraceMemoryState` because the tracer does not own the bytes, only their
/// permission.
pub type KnownMemoryMap = IntervalMapVector<crate::interval::Permission>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_ids_are_strictly_monotonic() {
        let table = TemporalIdTable::new();
        let first = table.mint(0x1000);
        let second = table.mint(0x1000);
        assert!(second.temporal_id() > first.temporal_id());
    }

    #[test]
    fn stale_tag_does_not_match_current() {
        let table = TemporalIdTable::new();
        let tag = table.mint(0x1000);
        table.bump(0x1000); // simulate free+realloc at same address
        assert_ne!(tag.temporal_id(), table.current(0x1000));
    }

    #[test]
    fn store_clears_overlapping_entries() {
        let mut map = InMemoryPointerObjectMap::new();
        map.set(0x2000, 8, PointerTarget::new(0x3000, 1));
        map.set(0x2004, 8, PointerTarget::new(0x4000, 1));
        assert_eq!(map.get(0x2000), PointerTarget::NULL);
    }

    #[test]
    fn copy_range_preserves_offsets_under_overlap() {
        let mut map = InMemoryPointerObjectMap::new();
        map.set(0x1000, 8, PointerTarget::new(0x9000, 1));
        map.copy_range(0x1000, 0x1004, 8);
        assert_eq!(map.get(0x1004), PointerTarget::new(0x9000, 1));
    }

    #[test]
    fn null_tag_is_distinct_from_any_live_tag() {
        assert!(PointerTarget::NULL.is_null());
        assert_ne!(PointerTarget::NULL, PointerTarget::new(1, 1));
    }
}
