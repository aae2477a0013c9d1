pub mod config;
pub mod gc;
pub mod iter;
pub mod module;
pub mod rt;
pub mod util;
pub mod val;

// Register bytecode VM
pub mod vm;
