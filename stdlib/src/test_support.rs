use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use lattice_core::val::Val;
use lattice_core::vm::{ChunkBuilder, Op, Reg, Vm};

/// Engine over the full stdlib registry, printing into `Output`.
pub(crate) fn engine() -> (Vm, Output) {
    let registry = crate::default_registry().unwrap();
    let mut vm = Vm::new(Arc::new(registry));
    let output = Output::default();
    vm.set_output(Box::new(output.clone()));
    (vm, output)
}

/// Call a global by name from host code.
pub(crate) fn call(vm: &mut Vm, name: &str, args: &[Val]) -> Result<Val> {
    let func = vm.global(name).cloned().ok_or_else(|| anyhow!("no global '{name}'"))?;
    vm.call(&func, args)
}

#[derive(Clone, Default)]
pub(crate) struct Output(Arc<Mutex<Vec<u8>>>);

impl Output {
    pub(crate) fn lines(&self) -> Vec<String> {
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

/// Straight-line program assembled one statement at a time.
pub(crate) struct Script {
    b: ChunkBuilder,
}

impl Script {
    pub(crate) fn new() -> Self {
        Self {
            b: ChunkBuilder::new("<main>"),
        }
    }

    pub(crate) fn line(&mut self, line: u32) -> &mut Self {
        self.b.set_line(line);
        self
    }

    fn int_array(&mut self, items: &[i32]) -> Reg {
        let run = self.b.alloc_run(items.len().max(1) as u16);
        for (i, item) in items.iter().enumerate() {
            self.b.emit(Op::LoadInt(run + i as Reg, *item));
        }
        let dst = self.b.alloc();
        self.b.emit(Op::NewArray {
            dst,
            base: run,
            count: items.len() as u16,
        });
        dst
    }

    /// `name = [items]` as a new global.
    pub(crate) fn define(&mut self, name: &str, items: &[i32]) -> &mut Self {
        let r = self.int_array(items);
        let k = self.b.k_str(name).unwrap();
        self.b.emit(Op::DefineGlobal(r, k));
        self
    }

    /// `name = [items]` on an existing global.
    pub(crate) fn assign(&mut self, name: &str, items: &[i32]) -> &mut Self {
        let r = self.int_array(items);
        let k = self.b.k_str(name).unwrap();
        self.b.emit(Op::SetGlobal(r, k));
        self
    }

    /// `name(args...)`; returns the register holding the result.
    pub(crate) fn call(&mut self, name: &str, args: &[Val]) -> Reg {
        let func = self.b.alloc_run(1 + args.len() as u16);
        let k = self.b.k_str(name).unwrap();
        self.b.emit(Op::GetGlobal(func, k));
        for (i, arg) in args.iter().enumerate() {
            let k = self.b.k(arg.clone()).unwrap();
            self.b.emit(Op::LoadK(func + 1 + i as Reg, k));
        }
        self.b.emit(Op::Call {
            func,
            argc: args.len() as u16,
        });
        func
    }

    pub(crate) fn run(mut self, vm: &mut Vm, result: Reg) -> Result<Val> {
        self.b.emit(Op::Return(result));
        vm.run(Arc::new(self.b.finish()?))
    }
}
