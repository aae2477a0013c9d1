use std::io::Write;
use std::sync::{Arc, Mutex};

pub(super) use crate::config::VmConfig;
pub(super) use crate::module::ModuleRegistry;
pub(super) use crate::val::{Phase, Val, ValKind};
pub(super) use crate::vm::{CaptureKind, Chunk, ChunkBuilder, Op, PhaseConstraint, RuntimeError, VarLoc, Vm};

pub(super) fn run(chunk: Chunk) -> anyhow::Result<Val> {
    Vm::default().run(Arc::new(chunk))
}

pub(super) fn run_ok(chunk: Chunk) -> Val {
    run(chunk).unwrap()
}

pub(super) fn runtime_error(err: &anyhow::Error) -> &RuntimeError {
    err.downcast_ref::<RuntimeError>()
        .unwrap_or_else(|| panic!("expected a RuntimeError, got {err:#}"))
}

/// `print` sink shared between the engine and the test.
#[derive(Clone, Default)]
pub(super) struct Output(Arc<Mutex<Vec<u8>>>);

impl Output {
    pub(super) fn attach(&self, vm: &mut Vm) {
        vm.set_output(Box::new(self.clone()));
    }

    pub(super) fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Emit `print(text)` using a scratch register.
pub(super) fn emit_print(b: &mut ChunkBuilder, scratch: u16, text: &str) {
    let k = b.k_str(text).unwrap();
    b.emit(Op::LoadK(scratch, k));
    b.emit(Op::Print { base: scratch, count: 1 });
}

/// `fn name(x) { return x + imm }`
pub(super) fn add_imm_fn(name: &str, imm: i16) -> Chunk {
    let mut f = ChunkBuilder::new(name);
    let x = f.param("x");
    f.emit(Op::AddImm(x, x, imm));
    f.emit(Op::Return(x));
    f.finish().unwrap()
}

/// Entry chunk that only builds and returns a closure over `proto`.
pub(super) fn returning_closure(proto: Chunk) -> Chunk {
    let mut b = ChunkBuilder::new("<main>");
    let f = b.alloc();
    let p = b.proto(proto).unwrap();
    b.closure(f, p, &[]).unwrap();
    b.emit(Op::Return(f));
    b.finish().unwrap()
}

mod concurrency;
mod control_flow;
mod debugger;
mod functions;
mod memory;
mod modules;
mod phases;
mod semantics;
