#![forbid(unsafe_code)]

//! Real-mode 8086 architectural state and the stateless pieces of execution
//! that operate on it: flag-producing ALU operations, ModRM effective address
//! resolution, and the SS:SP stack.
//!
//! None of these own the state. Callers pass an [`ExecutionState`] (and memory,
//! through [`CpuContext`]) by mutable reference into free functions and short
//! lived views.

pub mod alu;
pub mod context;
pub mod error;
pub mod flags;
pub mod modrm;
pub mod recorder;
pub mod registers;
pub mod stack;
pub mod state;

pub use context::CpuContext;
pub use error::{CpuError, Result, UnhandledKind};
pub use flags::{Flag, Flags};
pub use modrm::ModRm;
pub use recorder::StaticAddressesRecorder;
pub use registers::{GeneralRegisters, RegisterFile, SegmentRegisters};
pub use state::ExecutionState;
