#![forbid(unsafe_code)]

//! A real-mode DOS machine built for reverse engineering: the interpreter,
//! native callbacks behind interrupt vectors, I/O port routing, the dynamic
//! function-call tracker with its override mechanism, and the run loop that
//! consults breakpoints and the pause gate before every instruction.

pub mod callback;
pub mod config;
pub mod cpu;
pub mod function;
pub mod ioport;
mod machine;

pub use callback::{Callback, CallbackDispatcher, FnCallback};
pub use config::MachineConfig;
pub use cpu::{Cpu, CpuExit};
pub use function::{
    CallType, FunctionCall, FunctionHandler, FunctionInformation, FunctionReturn, OverrideFn,
    OverrideRegistry, OverrideSupplier, ReturnAction,
};
pub use ioport::{IoPortDispatcher, PortHandler};
pub use machine::{Machine, MachineStopHandle, RunExit};
