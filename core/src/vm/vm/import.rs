use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, trace};

use crate::util::lat_map::LatMap;
use crate::val::Val;
use crate::vm::artifact::{ARTIFACT_EXTENSION, Artifact};
use crate::vm::bytecode::Chunk;
use crate::vm::frame::FrameKind;
use crate::vm::vm::{Vm, verify_chunk};

/// Where an import's code comes from.
enum ModuleSource {
    Bundled(Arc<Chunk>),
    File(PathBuf),
}

impl Vm {
    /// Resolve `path` to a namespace value. Native modules win, then modules
    /// bundled into the running artifact, then `.latc` files relative to the
    /// script directory. Each module body runs at most once per engine.
    pub(super) fn import_module(&mut self, path: &str) -> Result<Val> {
        if let Some(namespace) = self.rt.registry().namespace(path) {
            return Ok(namespace.clone());
        }
        let (key, source) = self.locate_module(path)?;
        if let Some(namespace) = self.rt.cached_module(&key) {
            trace!(target: "lattice::vm::import", module = %key, "import.cached");
            return Ok(namespace.clone());
        }
        let chunk = match source {
            ModuleSource::Bundled(chunk) => chunk,
            ModuleSource::File(file) => {
                let artifact =
                    Artifact::read_file(&file).with_context(|| format!("import: failed to load '{path}'"))?;
                Arc::new(artifact.entry)
            }
        };
        verify_chunk(&chunk, self.limits.registers_per_window)?;

        self.rt.begin_loading(&key)?;
        self.module_defs.push(Vec::new());
        self.declare_structs(&chunk);
        let outcome = self.run_chunk(chunk.clone(), FrameKind::Module);
        let defined = self.module_defs.pop().unwrap_or_default();
        self.rt.end_loading(&key);
        outcome?;

        let namespace = self.module_namespace(&chunk, &defined);
        debug!(target: "lattice::vm::import", module = %key, exports = defined.len(), "import.loaded");
        self.rt.cache_module(key, namespace.clone());
        Ok(namespace)
    }

    fn locate_module(&self, path: &str) -> Result<(String, ModuleSource)> {
        if let Some(artifact) = self.bundle.as_ref().and_then(|b| b.bundled(path)) {
            return Ok((format!("bundle:{path}"), ModuleSource::Bundled(Arc::new(artifact.entry.clone()))));
        }
        let mut file = PathBuf::from(path);
        if file.extension().is_none() {
            file.set_extension(ARTIFACT_EXTENSION);
        }
        if file.is_relative() {
            if let Some(dir) = &self.rt.script_dir {
                file = dir.join(file);
            }
        }
        if !file.is_file() {
            bail!("import: cannot find '{path}'");
        }
        let key = file.canonicalize().unwrap_or_else(|_| file.clone());
        Ok((key.display().to_string(), ModuleSource::File(file)))
    }

    /// Globals the module defined, restricted to its export list when it
    /// declares one.
    fn module_namespace(&self, chunk: &Chunk, defined: &[Arc<str>]) -> Val {
        let mut members = LatMap::with_capacity(defined.len());
        for name in defined {
            let exported = chunk
                .exports
                .as_ref()
                .is_none_or(|exports| exports.iter().any(|e| e == name));
            if !exported {
                continue;
            }
            if let Some(value) = self.rt.globals.get(name) {
                members.insert(name.clone(), self.detach_value(value));
            }
        }
        Val::map(members)
    }
}
