//! Engine configuration.
//!
//! Resolved in precedence order: explicit overrides (CLI flags) > environment
//! > `lattice.toml` > defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::gc::GcConfig;
use crate::vm::{MAX_DEFERS, MAX_FRAMES, MAX_HANDLERS, REGS_PER_WINDOW};

/// File name looked up next to the script when no explicit config is given.
pub const CONFIG_FILE_NAME: &str = "lattice.toml";

/// Resource ceilings of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub frames: usize,
    pub registers_per_window: usize,
    pub handlers: usize,
    pub defers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            frames: MAX_FRAMES,
            registers_per_window: REGS_PER_WINDOW,
            handlers: MAX_HANDLERS,
            defers: MAX_DEFERS,
        }
    }
}

impl Limits {
    #[inline]
    pub fn register_file(&self) -> usize {
        self.frames * self.registers_per_window
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.frames > 0, "limits.frames must be positive");
        ensure!(
            (1..=REGS_PER_WINDOW).contains(&self.registers_per_window),
            "limits.registers_per_window must be between 1 and {REGS_PER_WINDOW}"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub gc: GcConfig,
    pub limits: Limits,
    /// Directory relative imports resolve against.
    pub script_dir: Option<PathBuf>,
    /// Record phase history for every variable, not only tracked ones.
    pub track_all: bool,
    /// Run spawned tasks on the calling thread.
    pub single_thread: bool,
}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VmConfig = toml::from_str(text).context("invalid lattice configuration")?;
        config.limits.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `lattice.toml` from `dir` when present, defaults otherwise.
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() { Self::load(&candidate) } else { Ok(Self::default()) }
    }

    /// Overlay `LATTICE_GC`, `LATTICE_GC_STRESS` and `LATTICE_SINGLE_THREAD`.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(flag) = lookup("LATTICE_GC").and_then(|v| parse_flag(&v)) {
            self.gc.enabled = flag;
        }
        if let Some(flag) = lookup("LATTICE_GC_STRESS").and_then(|v| parse_flag(&v)) {
            self.gc.stress = flag;
            if flag {
                self.gc.enabled = true;
            }
        }
        if let Some(flag) = lookup("LATTICE_SINGLE_THREAD").and_then(|v| parse_flag(&v)) {
            self.single_thread = flag;
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
