//! Register bytecode VM
//!
//! Instruction set and chunks, the artifact codec, the execution engine and
//! its supporting pieces (frames, upvalue cells, region allocator, debugger
//! hook).

mod alloc;
pub mod artifact;
mod builder;
pub mod bytecode;
mod debug;
mod error;
mod frame;
mod upvalue;
#[allow(clippy::module_inception)]
mod vm;

pub use alloc::*;
pub use artifact::{
    ARTIFACT_EXTENSION, Artifact, ArtifactFlags, ArtifactHeader, ArtifactMeta, BundledModule, CURRENT_VERSION,
    decode, encode, inspect,
};
pub use builder::{ChunkBuilder, JumpLabel};
pub use bytecode::{CaptureKind, Chunk, ConstIdx, Op, PhaseConstraint, Reg, StructDecl, VarLoc};
pub use debug::{DebugAction, DebugHook, DebugView, FrameSummary};
pub use error::{ErrorKind, RuntimeError};
pub use frame::{MAX_DEFERS, MAX_FRAMES, MAX_HANDLERS, MAX_REGISTERS, NATIVE_ARG_SCRATCH, REGS_PER_WINDOW};
pub use upvalue::{Upvalue, UpvalueCell, UpvalueRef};
pub use vm::Vm;

#[cfg(test)]
mod vm_test;
