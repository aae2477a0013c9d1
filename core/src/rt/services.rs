//! Per-engine runtime state: globals, struct metadata, module cache and the
//! phase-tracking tables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::trace;

use crate::module::ModuleRegistry;
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::util::lat_map::LatMap;
use crate::val::{Phase, Val};

/// One recorded phase transition of a tracked variable.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub phase: Phase,
    pub value: Val,
    pub line: u32,
    pub function: Option<Arc<str>>,
}

/// Mutation restrictions attached to a variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureMode {
    NoGrow,
    NoShrink,
    NoResize,
    ReadHeavy,
}

impl PressureMode {
    pub fn name(self) -> &'static str {
        match self {
            PressureMode::NoGrow => "no_grow",
            PressureMode::NoShrink => "no_shrink",
            PressureMode::NoResize => "no_resize",
            PressureMode::ReadHeavy => "read_heavy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "no_grow" => PressureMode::NoGrow,
            "no_shrink" => PressureMode::NoShrink,
            "no_resize" => PressureMode::NoResize,
            "read_heavy" => PressureMode::ReadHeavy,
            _ => return None,
        })
    }

    fn blocks_grow(self) -> bool {
        matches!(self, PressureMode::NoGrow | PressureMode::NoResize)
    }

    fn blocks_shrink(self) -> bool {
        matches!(self, PressureMode::NoShrink | PressureMode::NoResize)
    }
}

/// How a freeze of a bond target propagates to a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondStrategy {
    /// Freeze the dependency too.
    Mirror,
    /// Thaw the dependency.
    Inverse,
    /// Refuse the freeze unless the dependency is already crystal.
    Gate,
}

impl BondStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "mirror" => BondStrategy::Mirror,
            "inverse" => BondStrategy::Inverse,
            "gate" => BondStrategy::Gate,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BondStrategy::Mirror => "mirror",
            BondStrategy::Inverse => "inverse",
            BondStrategy::Gate => "gate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bond {
    pub dep: Arc<str>,
    pub strategy: BondStrategy,
}

/// Field layouts of declared structs, shared by forked engines.
pub type StructTable = FastHashMap<Arc<str>, Arc<[Arc<str>]>>;

#[derive(Debug)]
pub struct Runtime {
    pub globals: LatMap<Val>,
    structs: Arc<StructTable>,
    registry: Arc<ModuleRegistry>,
    module_cache: FastHashMap<String, Val>,
    /// Modules currently being imported, for cycle detection.
    loading: Vec<String>,
    pub script_dir: Option<PathBuf>,
    /// Record history for every phase transition, tracked or not.
    pub track_all: bool,
    history: FastHashMap<Arc<str>, Vec<HistoryEntry>>,
    pressures: FastHashMap<Arc<str>, PressureMode>,
    pub(crate) reactions: FastHashMap<Arc<str>, Vec<Val>>,
    pub(crate) bonds: FastHashMap<Arc<str>, Vec<Bond>>,
    pub(crate) seeds: FastHashMap<Arc<str>, Vec<Val>>,
}

impl Runtime {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        let mut globals = LatMap::new();
        for (name, value) in registry.builtins() {
            globals.insert(name.clone(), value.clone());
        }
        Self {
            globals,
            structs: Arc::new(fast_hash_map_new()),
            registry,
            module_cache: fast_hash_map_new(),
            loading: Vec::new(),
            script_dir: None,
            track_all: false,
            history: fast_hash_map_new(),
            pressures: fast_hash_map_new(),
            reactions: fast_hash_map_new(),
            bonds: fast_hash_map_new(),
            seeds: fast_hash_map_new(),
        }
    }

    /// State for a forked engine: globals copied, struct metadata and the
    /// module registry shared, phase-tracking tables left empty.
    pub fn fork(&self, globals: LatMap<Val>) -> Self {
        Self {
            globals,
            structs: self.structs.clone(),
            registry: self.registry.clone(),
            module_cache: self.module_cache.clone(),
            loading: Vec::new(),
            script_dir: self.script_dir.clone(),
            track_all: false,
            history: fast_hash_map_new(),
            pressures: fast_hash_map_new(),
            reactions: fast_hash_map_new(),
            bonds: fast_hash_map_new(),
            seeds: fast_hash_map_new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn define_struct(&mut self, name: Arc<str>, fields: Vec<Arc<str>>) {
        Arc::make_mut(&mut self.structs).insert(name, fields.into());
    }

    pub fn struct_fields(&self, name: &str) -> Option<&Arc<[Arc<str>]>> {
        self.structs.get(name)
    }

    pub fn structs(&self) -> &StructTable {
        &self.structs
    }

    pub fn cached_module(&self, key: &str) -> Option<&Val> {
        self.module_cache.get(key)
    }

    pub fn cache_module(&mut self, key: String, namespace: Val) {
        trace!(target: "lattice::rt::module", module = %key, "module.cache");
        self.module_cache.insert(key, namespace);
    }

    pub fn module_cache(&self) -> impl Iterator<Item = (&String, &Val)> {
        self.module_cache.iter()
    }

    pub(crate) fn begin_loading(&mut self, key: &str) -> Result<()> {
        if self.loading.iter().any(|k| k == key) {
            bail!("import: circular import of '{key}'");
        }
        self.loading.push(key.to_string());
        Ok(())
    }

    pub(crate) fn end_loading(&mut self, key: &str) {
        self.loading.retain(|k| k != key);
    }

    /// Start recording phase history for `name`.
    pub fn track(&mut self, name: &str) {
        self.history.entry(Arc::from(name)).or_default();
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.track_all || self.history.contains_key(name)
    }

    /// Whether any write can produce a history entry at all.
    #[inline]
    pub fn tracking_active(&self) -> bool {
        self.track_all || !self.history.is_empty()
    }

    /// Names with recorded history, sorted.
    pub fn tracked_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.history.keys().cloned().collect();
        names.sort();
        names
    }

    /// Append a snapshot when `name` is tracked.
    pub fn record_history(&mut self, name: &str, value: &Val, line: u32, function: Option<&str>) {
        if !self.is_tracked(name) {
            return;
        }
        let entry = HistoryEntry {
            phase: value.phase,
            value: value.clone(),
            line,
            function: function.map(Arc::from),
        };
        trace!(target: "lattice::rt::phase", name, phase = entry.phase.name(), line, "phase.history");
        match self.history.get_mut(name) {
            Some(entries) => entries.push(entry),
            None => {
                self.history.insert(Arc::from(name), vec![entry]);
            }
        }
    }

    pub fn history(&self, name: &str) -> Option<&[HistoryEntry]> {
        self.history.get(name).map(Vec::as_slice)
    }

    pub fn set_pressure(&mut self, name: &str, mode: PressureMode) {
        self.pressures.insert(Arc::from(name), mode);
    }

    pub fn clear_pressure(&mut self, name: &str) -> bool {
        self.pressures.remove(name).is_some()
    }

    pub fn pressure(&self, name: &str) -> Option<PressureMode> {
        self.pressures.get(name).copied()
    }

    /// Reject a growing (`grows = true`) or shrinking mutation of a pressurized variable.
    pub fn check_pressure(&self, name: &str, op: &str, grows: bool) -> Result<()> {
        let Some(mode) = self.pressure(name) else {
            return Ok(());
        };
        let blocked = if grows { mode.blocks_grow() } else { mode.blocks_shrink() };
        if blocked {
            bail!("pressurized ({}): cannot {} '{}'", mode.name(), op, name);
        }
        Ok(())
    }

    pub fn add_reaction(&mut self, name: &str, callback: Val) {
        self.reactions.entry(Arc::from(name)).or_default().push(callback);
    }

    pub fn remove_reactions(&mut self, name: &str) -> bool {
        self.reactions.remove(name).is_some()
    }

    pub fn add_bond(&mut self, target: &str, dep: &str, strategy: BondStrategy) {
        let bonds = self.bonds.entry(Arc::from(target)).or_default();
        bonds.retain(|b| b.dep.as_ref() != dep);
        bonds.push(Bond {
            dep: Arc::from(dep),
            strategy,
        });
    }

    pub fn remove_bond(&mut self, target: &str, dep: &str) -> bool {
        let Some(bonds) = self.bonds.get_mut(target) else {
            return false;
        };
        let before = bonds.len();
        bonds.retain(|b| b.dep.as_ref() != dep);
        let removed = bonds.len() != before;
        if bonds.is_empty() {
            self.bonds.remove(target);
        }
        removed
    }

    pub fn bonds(&self, target: &str) -> &[Bond] {
        self.bonds.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_seed(&mut self, name: &str, contract: Val) {
        self.seeds.entry(Arc::from(name)).or_default().push(contract);
    }

    /// Drop the most recently planted seed for `name`.
    pub fn remove_seed(&mut self, name: &str) -> bool {
        let Some(seeds) = self.seeds.get_mut(name) else {
            return false;
        };
        let removed = seeds.pop().is_some();
        if seeds.is_empty() {
            self.seeds.remove(name);
        }
        removed
    }

    pub fn seed_count(&self, name: &str) -> usize {
        self.seeds.get(name).map_or(0, Vec::len)
    }

    /// Values held by the phase tables, for the collector's root scan.
    pub(crate) fn phase_roots(&self) -> impl Iterator<Item = &Val> {
        self.reactions
            .values()
            .chain(self.seeds.values())
            .flatten()
            .chain(self.history.values().flatten().map(|e| &e.value))
    }
}
