//! Opt-in mark-and-sweep collector.
//!
//! Values are reclaimed by ownership; the collector exists for the shared
//! cells that can form reference cycles (Ref cells and upvalue cells). While
//! enabled, the engine registers every such cell it creates. A collection
//! marks from the engine's roots, then clears the contents of every tracked
//! cell that was not reached, which breaks the cycle and lets the reference
//! counts drop the rest.
//!
//! Cells are tracked through generation-checked slot handles, so a stale
//! handle never aliases a newer cell occupying the same slot.

use std::sync::{Arc, Weak};

use serde::Deserialize;
use tracing::debug;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new, fast_hash_set_new};
use crate::val::{RefBox, Val, iteration_in_progress};
use crate::vm::{UpvalueCell, UpvalueRef};

mod trace;

use trace::{Node, addr_of, value_children};


/// Default live-object count that triggers the first collection.
pub const DEFAULT_INITIAL_THRESHOLD: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    /// Collect on every tracked allocation.
    pub stress: bool,
    pub initial_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stress: false,
            initial_threshold: DEFAULT_INITIAL_THRESHOLD,
        }
    }
}

/// Generation-checked reference to a tracked cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed: u64,
    /// Objects marked during the most recent cycle.
    pub last_marked: usize,
    pub live: usize,
    pub bytes: usize,
    pub next_gc: usize,
}

enum Tracked {
    Ref(Weak<RefBox>),
    Upvalue(Weak<UpvalueCell>),
}

impl Tracked {
    fn upgrade(&self) -> Option<Node> {
        match self {
            Tracked::Ref(w) => w.upgrade().map(Node::Ref),
            Tracked::Upvalue(w) => w.upgrade().map(Node::Upvalue),
        }
    }
}

struct Entry {
    object: Tracked,
    addr: usize,
    bytes: usize,
    marked: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Receives root values during the mark phase.
pub struct Tracer<'a> {
    gray: &'a mut Vec<Node>,
}

impl Tracer<'_> {
    pub fn value(&mut self, value: &Val) {
        value_children(value, self.gray);
    }

    pub fn values<'v>(&mut self, values: impl IntoIterator<Item = &'v Val>) {
        for value in values {
            self.value(value);
        }
    }

    pub fn upvalue(&mut self, cell: &UpvalueRef) {
        self.gray.push(Node::Upvalue(cell.clone()));
    }
}

/// Anything that owns root values: the engine, or a test harness.
pub trait Roots {
    fn trace_roots(&self, tracer: &mut Tracer<'_>);
}

pub struct Gc {
    config: GcConfig,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_addr: FastHashMap<usize, Handle>,
    pinned: Vec<Val>,
    live: usize,
    bytes: usize,
    next_gc: usize,
    stats: GcStats,
}

impl Default for Gc {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl std::fmt::Debug for Gc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gc")
            .field("enabled", &self.config.enabled)
            .field("live", &self.live)
            .field("next_gc", &self.next_gc)
            .finish()
    }
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        let next_gc = config.initial_threshold.max(1);
        Self {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            by_addr: fast_hash_map_new(),
            pinned: Vec::new(),
            live: 0,
            bytes: 0,
            next_gc,
            stats: GcStats::default(),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn set_stress(&mut self, stress: bool) {
        self.config.stress = stress;
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            live: self.live,
            bytes: self.bytes,
            next_gc: self.next_gc,
            ..self.stats.clone()
        }
    }

    /// Register a Ref cell. No-op while disabled.
    pub fn track_ref(&mut self, cell: &Arc<RefBox>) -> Option<Handle> {
        if !self.config.enabled {
            return None;
        }
        let bytes = cell.lock().heap_size();
        Some(self.insert(Tracked::Ref(Arc::downgrade(cell)), addr_of(cell), bytes))
    }

    /// Register an upvalue cell. No-op while disabled.
    pub fn track_upvalue(&mut self, cell: &UpvalueRef) -> Option<Handle> {
        if !self.config.enabled {
            return None;
        }
        let bytes = std::mem::size_of::<UpvalueCell>();
        Some(self.insert(Tracked::Upvalue(Arc::downgrade(cell)), addr_of(cell), bytes))
    }

    fn insert(&mut self, object: Tracked, addr: usize, bytes: usize) -> Handle {
        if let Some(existing) = self.by_addr.get(&addr).copied() {
            if self.get(existing).is_some() {
                return existing;
            }
            self.release_slot(existing);
        }
        let entry = Entry {
            object,
            addr,
            bytes,
            marked: false,
        };
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        self.by_addr.insert(addr, handle);
        self.live += 1;
        self.bytes += bytes;
        handle
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get(&self, handle: Handle) -> Option<Node> {
        self.entry(handle)?.object.upgrade()
    }

    /// Whether `handle` still names a live tracked cell.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn is_tracked_ref(&self, cell: &Arc<RefBox>) -> bool {
        self.by_addr.get(&addr_of(cell)).is_some_and(|h| self.contains(*h))
    }

    pub fn is_tracked_upvalue(&self, cell: &UpvalueRef) -> bool {
        self.by_addr.get(&addr_of(cell)).is_some_and(|h| self.contains(*h))
    }

    fn release_slot(&mut self, handle: Handle) {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            self.live -= 1;
            self.bytes = self.bytes.saturating_sub(entry.bytes);
            if self.by_addr.get(&entry.addr) == Some(&handle) {
                self.by_addr.remove(&entry.addr);
            }
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
    }

    /// Keep `value` (and everything it reaches) alive across collections.
    pub fn pin(&mut self, value: Val) -> usize {
        self.pinned.push(value);
        self.pinned.len() - 1
    }

    pub fn unpin(&mut self, index: usize) -> Option<Val> {
        (index < self.pinned.len()).then(|| self.pinned.swap_remove(index))
    }

    /// Threshold check made at each tracked allocation.
    pub fn should_collect(&self) -> bool {
        self.config.enabled && (self.config.stress || self.live >= self.next_gc) && !iteration_in_progress()
    }

    /// Run a full cycle. Returns the number of cells reclaimed.
    pub fn collect(&mut self, roots: &dyn Roots) -> usize {
        if iteration_in_progress() {
            debug!(target: "lattice::gc", "gc.skip_iterating");
            return 0;
        }
        self.prune_dead();

        let nodes = self.discover();
        let mut gray = self.external_roots(&nodes);
        {
            let mut tracer = Tracer { gray: &mut gray };
            roots.trace_roots(&mut tracer);
            tracer.values(self.pinned.iter());
        }
        drop(nodes);

        for slot in &mut self.slots {
            if let Some(entry) = slot.entry.as_mut() {
                entry.marked = false;
            }
        }
        let mut visited = fast_hash_set_new();
        while let Some(node) = gray.pop() {
            if !visited.insert(node.addr()) {
                continue;
            }
            if let Some(handle) = self.by_addr.get(&node.addr()).copied() {
                if let Some(entry) = self.slots.get_mut(handle.index as usize).and_then(|s| s.entry.as_mut()) {
                    entry.marked = true;
                }
            }
            node.children(&mut gray);
        }

        let marked = self
            .slots
            .iter()
            .filter(|s| s.entry.as_ref().is_some_and(|e| e.marked))
            .count();
        let freed = self.sweep();

        self.stats.cycles += 1;
        self.stats.total_freed += freed as u64;
        self.stats.last_marked = marked;
        self.next_gc = (self.live * 2).max(self.config.initial_threshold.max(1));
        debug!(
            target: "lattice::gc",
            marked,
            freed,
            live = self.live,
            next_gc = self.next_gc,
            "gc.collect"
        );
        freed
    }

    /// Forget slots whose cells were already dropped by reference counting.
    fn prune_dead(&mut self) {
        let dead: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                entry.object.upgrade().is_none().then_some(Handle {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect();
        for handle in dead {
            self.release_slot(handle);
        }
    }

    /// Every node reachable from a tracked cell, each held exactly once.
    fn discover(&self) -> FastHashMap<usize, Node> {
        let mut nodes: FastHashMap<usize, Node> = fast_hash_map_new();
        let mut pending: Vec<Node> = self
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref().and_then(|e| e.object.upgrade()))
            .collect();
        let mut children = Vec::new();
        while let Some(node) = pending.pop() {
            let addr = node.addr();
            if nodes.contains_key(&addr) {
                continue;
            }
            node.children(&mut children);
            pending.append(&mut children);
            nodes.insert(addr, node);
        }
        nodes
    }

    /// Nodes holding references from outside the discovered graph (another
    /// engine, a channel buffer, a host handle). The table owns one strong
    /// reference per node; any count beyond that and the internal edges is
    /// external.
    fn external_roots(&self, nodes: &FastHashMap<usize, Node>) -> Vec<Node> {
        let mut internal: FastHashMap<usize, usize> = fast_hash_map_new();
        let mut children = Vec::new();
        for node in nodes.values() {
            node.children(&mut children);
            for child in children.drain(..) {
                *internal.entry(child.addr()).or_default() += 1;
            }
        }
        nodes
            .values()
            .filter(|node| {
                let inner = internal.get(&node.addr()).copied().unwrap_or(0);
                node.strong_count() > 1 + inner
            })
            .cloned()
            .collect()
    }

    fn sweep(&mut self) -> usize {
        let mut doomed = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(entry) = slot.entry.as_ref() else { continue };
            if entry.marked {
                continue;
            }
            doomed.push((
                Handle {
                    index: index as u32,
                    generation: slot.generation,
                },
                entry.object.upgrade(),
            ));
        }
        let freed = doomed.len();
        for (handle, node) in doomed {
            self.release_slot(handle);
            match node {
                Some(Node::Ref(cell)) => {
                    cell.set(Val::nil());
                }
                Some(Node::Upvalue(cell)) => cell.clear(),
                _ => {}
            }
        }
        freed
    }
}
