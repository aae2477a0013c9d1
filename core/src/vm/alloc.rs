use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::{Region, RegionId, Val};

/// Region holding short-lived intermediates (string concatenation results);
/// the `ResetEphemeral` instruction resets it.
pub const EPHEMERAL_REGION: RegionId = RegionId(0);

#[derive(Debug, Default)]
struct Arena {
    /// Values handed back through `release`, dropped in bulk on reset.
    retained: Vec<Val>,
    placed: usize,
    bytes: usize,
}

/// Per-region accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub placed: usize,
    pub retained: usize,
    pub bytes: usize,
}

/// Owner of the engine's allocation regions.
///
/// Values are either conventionally owned (`Region::Owned`, freed when released)
/// or tagged with an arena id. Releasing an arena value individually is inert:
/// the value is parked in its arena and dropped together with the rest of the
/// region on `reset`.
#[derive(Debug)]
pub struct RegionAllocator {
    regions: FastHashMap<u32, Arena>,
    next_region: u32,
    owned_freed_bytes: AtomicU64,
}

impl RegionAllocator {
    pub fn new() -> Self {
        let mut regions = fast_hash_map_new();
        regions.insert(EPHEMERAL_REGION.0, Arena::default());
        Self {
            regions,
            next_region: EPHEMERAL_REGION.0 + 1,
            owned_freed_bytes: AtomicU64::new(0),
        }
    }

    pub fn create_region(&mut self) -> RegionId {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        self.regions.insert(id.0, Arena::default());
        trace!(target: "lattice::vm::alloc", region = id.0, "region.create");
        id
    }

    pub fn contains(&self, region: RegionId) -> bool {
        self.regions.contains_key(&region.0)
    }

    /// Tag `value` as owned by `region`. Unknown regions leave the value owned.
    pub fn place(&mut self, region: RegionId, value: Val) -> Val {
        match self.regions.get_mut(&region.0) {
            Some(arena) => {
                arena.placed += 1;
                arena.bytes += value.heap_size();
                value.in_region(region)
            }
            None => value,
        }
    }

    /// Release a value. Owned values are dropped now (recursively, through their
    /// payload); arena values are retained until their region resets.
    /// Returns whether the value was freed immediately.
    pub fn release(&mut self, value: Val) -> bool {
        match value.region {
            Region::Owned => {
                let bytes = value.heap_size() as u64;
                if bytes > 0 {
                    self.owned_freed_bytes.fetch_add(bytes, Ordering::Relaxed);
                }
                drop(value);
                true
            }
            Region::Arena(id) => {
                if let Some(arena) = self.regions.get_mut(&id.0) {
                    arena.retained.push(value);
                }
                false
            }
        }
    }

    /// Drop every value the region retains and clear its accounting.
    pub fn reset(&mut self, region: RegionId) -> usize {
        let Some(arena) = self.regions.get_mut(&region.0) else {
            return 0;
        };
        let dropped = arena.retained.len();
        let bytes = arena.bytes;
        *arena = Arena::default();
        trace!(
            target: "lattice::vm::alloc",
            region = region.0,
            dropped,
            bytes,
            "region.reset"
        );
        dropped
    }

    /// Reset and forget a region. The ephemeral region cannot be destroyed.
    pub fn destroy(&mut self, region: RegionId) -> bool {
        if region == EPHEMERAL_REGION {
            self.reset(region);
            return false;
        }
        self.regions.remove(&region.0).is_some()
    }

    pub fn stats(&self, region: RegionId) -> Option<RegionStats> {
        self.regions.get(&region.0).map(|arena| RegionStats {
            placed: arena.placed,
            retained: arena.retained.len(),
            bytes: arena.bytes,
        })
    }

    pub fn owned_freed_bytes(&self) -> u64 {
        self.owned_freed_bytes.load(Ordering::Relaxed)
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_release_is_inert_until_reset() {
        let mut alloc = RegionAllocator::new();
        let region = alloc.create_region();
        let v = alloc.place(region, Val::str("scratch"));
        assert_eq!(v.region, Region::Arena(region));

        assert!(!alloc.release(v));
        let stats = alloc.stats(region).unwrap();
        assert_eq!(stats.placed, 1);
        assert_eq!(stats.retained, 1);

        assert_eq!(alloc.reset(region), 1);
        assert_eq!(alloc.stats(region).unwrap(), RegionStats::default());
    }

    #[test]
    fn owned_release_frees_immediately() {
        let mut alloc = RegionAllocator::new();
        let v = Val::array(vec![Val::str("a"), Val::str("bc")]);
        assert!(alloc.release(v));
        assert!(alloc.owned_freed_bytes() > 0);
    }

    #[test]
    fn cloning_an_arena_value_yields_an_owned_value() {
        let mut alloc = RegionAllocator::new();
        let v = alloc.place(EPHEMERAL_REGION, Val::str("x"));
        let copy = v.clone();
        assert!(copy.region.is_owned());
        assert!(alloc.release(copy));
    }

    #[test]
    fn ephemeral_region_survives_destroy() {
        let mut alloc = RegionAllocator::new();
        assert!(!alloc.destroy(EPHEMERAL_REGION));
        assert!(alloc.contains(EPHEMERAL_REGION));
        let region = alloc.create_region();
        assert!(alloc.destroy(region));
        assert!(!alloc.contains(region));
    }
}
