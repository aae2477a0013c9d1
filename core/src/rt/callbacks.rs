use anyhow::Result;

use crate::val::Val;

use super::services::Runtime;

/// The five services the runtime layer needs from the engine that drives it.
pub trait RuntimeCallbacks {
    /// Invoke any callable value with `args` and return its result.
    fn call_closure(&mut self, callee: &Val, args: &[Val]) -> Result<Val>;

    /// Value of a named local in the innermost frame that declares it.
    fn find_local_value(&self, name: &str) -> Option<Val>;

    /// Source line of the instruction being executed.
    fn current_line(&self) -> u32;

    /// Look a variable up by name: locals first, then globals.
    fn get_var_by_name(&self, name: &str) -> Option<Val>;

    /// Overwrite an existing variable (local first, then global).
    /// Returns `false` when no variable of that name exists.
    fn set_var_by_name(&mut self, name: &str, value: Val) -> bool;
}

/// Context handed to every native function.
pub trait Host: RuntimeCallbacks {
    fn runtime(&mut self) -> &mut Runtime;

    fn runtime_ref(&self) -> &Runtime;

    /// Name of the function whose frame is executing.
    fn current_function(&self) -> &str;

    /// Write one line to the engine's output sink.
    fn print_line(&mut self, line: &str) -> Result<()>;
}
