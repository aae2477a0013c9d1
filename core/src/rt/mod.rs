//! Runtime services reached by the engine and by native functions.

mod callbacks;
pub mod channel;
pub mod phase;
pub mod scheduler;
mod services;

pub use callbacks::{Host, RuntimeCallbacks};
pub use channel::{Channel, Selected, TryRecv};
pub use scheduler::{Job, Scheduler, SchedulerStats, TaskGroup, install_scheduler, scheduler};
pub use services::{Bond, BondStrategy, HistoryEntry, PressureMode, Runtime, StructTable};
