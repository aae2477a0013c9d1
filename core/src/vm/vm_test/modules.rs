use std::collections::HashMap;

use crate::module::Module;
use crate::rt::Host;
use crate::vm::{Artifact, BundledModule};

use super::*;

/// Module body: `print("loaded"); fn double(x) { x + x }; let hidden = 1`.
fn math_module(export_only_double: bool) -> Chunk {
    let mut double = ChunkBuilder::new("double");
    let x = double.param("x");
    double.emit(Op::Add(x, x, x));
    double.emit(Op::Return(x));
    let double = double.finish().unwrap();

    let mut m = ChunkBuilder::new("math");
    let s = m.alloc();
    emit_print(&mut m, s, "loaded");
    let f = m.alloc();
    let p = m.proto(double).unwrap();
    m.closure(f, p, &[]).unwrap();
    let name = m.k_str("double").unwrap();
    m.emit(Op::DefineGlobal(f, name));
    let hidden = m.k_str("hidden").unwrap();
    m.emit(Op::LoadInt(s, 1));
    m.emit(Op::DefineGlobal(s, hidden));
    m.emit(Op::LoadUnit(s));
    m.emit(Op::Return(s));
    if export_only_double {
        m.export("double");
    }
    m.finish().unwrap()
}

/// `let m = import path; m.double(21)` twice, returning the last result.
fn importer(path: &str) -> Chunk {
    let mut b = ChunkBuilder::new("<main>");
    let ns = b.local("m");
    let k = b.k_str(path).unwrap();
    let double = b.k_str("double").unwrap();
    let f = b.alloc();
    let arg = b.alloc();
    for _ in 0..2 {
        b.emit(Op::Import(ns, k));
        b.emit(Op::GetField(f, ns, double));
        b.emit(Op::LoadInt(arg, 21));
        b.emit(Op::Call { func: f, argc: 1 });
    }
    b.emit(Op::Return(f));
    b.finish().unwrap()
}

fn bundle(entry: Chunk, path: &str, module: Chunk) -> Artifact {
    let mut artifact = Artifact::new(entry);
    artifact.modules.push(BundledModule {
        path: path.to_string(),
        artifact: Artifact::new(module),
    });
    artifact
}

#[test]
fn test_bundled_module_runs_once() {
    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    let artifact = bundle(importer("math"), "math", math_module(false));
    assert_eq!(vm.run_artifact(artifact).unwrap(), Val::int(42));
    assert_eq!(out.lines(), ["loaded"]);
    assert_eq!(vm.runtime().module_cache().count(), 1);
}

#[test]
fn test_export_list_filters_namespace() {
    let mut b = ChunkBuilder::new("<main>");
    let ns = b.alloc();
    let k = b.k_str("math").unwrap();
    b.emit(Op::Import(ns, k));
    b.emit(Op::Return(ns));

    let mut vm = Vm::default();
    vm.set_output(Box::new(std::io::sink()));
    let namespace = vm.run_artifact(bundle(b.finish().unwrap(), "math", math_module(true))).unwrap();
    let ValKind::Map(members) = &namespace.kind else {
        panic!("namespace should be a map, got {namespace}");
    };
    assert!(members.contains_key("double"));
    assert!(!members.contains_key("hidden"));
}

#[test]
fn test_file_import_resolves_against_script_dir() {
    let dir = tempfile::tempdir().unwrap();
    Artifact::new(math_module(false))
        .write_file(&dir.path().join("math.latc"))
        .unwrap();

    let config = VmConfig {
        script_dir: Some(dir.path().to_path_buf()),
        ..VmConfig::default()
    };
    let mut vm = Vm::with_config(Arc::new(ModuleRegistry::new()), &config);
    let out = Output::default();
    out.attach(&mut vm);
    assert_eq!(vm.run(Arc::new(importer("math"))).unwrap(), Val::int(42));
    assert_eq!(out.lines(), ["loaded"]);
}

#[test]
fn test_missing_module() {
    let err = run(importer("nowhere")).unwrap_err();
    assert!(err.to_string().contains("import: cannot find 'nowhere'"));
}

#[test]
fn test_circular_import_is_rejected() {
    // Module "a" imports itself while loading.
    let mut a = ChunkBuilder::new("a");
    let r = a.alloc();
    let k = a.k_str("a").unwrap();
    a.emit(Op::Import(r, k));
    a.emit(Op::Return(r));

    let mut b = ChunkBuilder::new("<main>");
    let ns = b.alloc();
    let k = b.k_str("a").unwrap();
    b.emit(Op::Import(ns, k));
    b.emit(Op::Return(ns));

    let mut vm = Vm::default();
    let err = vm
        .run_artifact(bundle(b.finish().unwrap(), "a", a.finish().unwrap()))
        .unwrap_err();
    assert!(format!("{err:#}").contains("import: circular import of 'bundle:a'"));
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_native_module_wins_over_files() {
    fn double(args: &[Val], _: &mut dyn Host) -> anyhow::Result<Val> {
        Ok(Val::int(args.first().and_then(Val::as_int).unwrap_or(0) * 2))
    }

    #[derive(Debug)]
    struct Math;

    impl Module for Math {
        fn name(&self) -> &str {
            "math"
        }

        fn register(&self, _: &mut ModuleRegistry) -> anyhow::Result<()> {
            Ok(())
        }

        fn exports(&self) -> HashMap<String, Val> {
            HashMap::from([("double".to_string(), Val::native("double", double))])
        }
    }

    let mut registry = ModuleRegistry::new();
    registry.register_module("math", Box::new(Math)).unwrap();
    let mut vm = Vm::new(Arc::new(registry));
    assert_eq!(vm.run(Arc::new(importer("math"))).unwrap(), Val::int(42));
    assert_eq!(vm.runtime().module_cache().count(), 0);
}
