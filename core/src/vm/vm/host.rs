use anyhow::Result;

use crate::gc::{Roots, Tracer};
use crate::rt::{Host, Runtime, RuntimeCallbacks};
use crate::val::Val;
use crate::vm::vm::Vm;

impl Vm {
    /// Absolute register of the innermost live local called `name`.
    fn local_slot(&self, name: &str) -> Option<usize> {
        self.frames.iter().rev().find_map(|frame| {
            frame
                .chunk
                .local_names
                .iter()
                .take(frame.size)
                .position(|n| n.as_deref() == Some(name))
                .map(|slot| frame.base + slot)
        })
    }
}

impl RuntimeCallbacks for Vm {
    fn call_closure(&mut self, callee: &Val, args: &[Val]) -> Result<Val> {
        self.call_value(callee, args)
    }

    fn find_local_value(&self, name: &str) -> Option<Val> {
        self.local_slot(name).and_then(|abs| self.regs.get(abs).cloned())
    }

    fn current_line(&self) -> u32 {
        self.line()
    }

    fn get_var_by_name(&self, name: &str) -> Option<Val> {
        self.find_local_value(name)
            .or_else(|| self.rt.globals.get(name).cloned())
    }

    fn set_var_by_name(&mut self, name: &str, value: Val) -> bool {
        if let Some(abs) = self.local_slot(name) {
            self.set_reg(abs, value);
            return true;
        }
        if self.rt.globals.contains_key(name) {
            self.rt.globals.insert(name, value);
            return true;
        }
        false
    }
}

impl Host for Vm {
    fn runtime(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    fn runtime_ref(&self) -> &Runtime {
        &self.rt
    }

    fn current_function(&self) -> &str {
        self.frames.last().map_or("<script>", |f| f.chunk.name.as_ref())
    }

    fn print_line(&mut self, line: &str) -> Result<()> {
        self.write_output(line)
    }
}

impl Roots for Vm {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        tracer.values(&self.regs);
        tracer.values(self.rt.globals.values());
        for cell in &self.open_upvalues {
            tracer.upvalue(cell);
        }
        for frame in &self.frames {
            for cell in frame.upvalues() {
                tracer.upvalue(cell);
            }
        }
        tracer.values(self.rt.module_cache().map(|(_, namespace)| namespace));
        tracer.values(self.rt.phase_roots());
        tracer.values(&self.native_args);
    }
}
