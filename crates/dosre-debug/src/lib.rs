#![forbid(unsafe_code)]

//! Execution gate consulted by the run loop once per instruction: breakpoints
//! and the pause/resume handshake with a controller thread.
//!
//! Everything here is shared between the execution thread and a debugger-facing
//! thread through `Arc`, so all mutation goes through interior locks and the
//! hot-path checks are plain atomic loads.

pub mod breakpoint;
pub mod pause;

pub use breakpoint::{
    BreakPoint, BreakPointCallback, BreakPointHolder, BreakPointType, MachineBreakpoints,
    MemoryBreakpoints,
};
pub use pause::PauseHandler;
