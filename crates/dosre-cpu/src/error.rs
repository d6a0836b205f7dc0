use std::fmt;

use dosre_mem::MemoryError;
use thiserror::Error;

use crate::state::ExecutionState;

pub type Result<T> = std::result::Result<T, CpuError>;

/// What kind of index had no registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledKind {
    Callback,
    Interrupt,
    IoPort,
}

impl fmt::Display for UnhandledKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnhandledKind::Callback => "callback",
            UnhandledKind::Interrupt => "interrupt",
            UnhandledKind::IoPort => "I/O port",
        })
    }
}

/// Errors that stop execution.
///
/// Divide faults are not errors: the ALU reports them as `None` and the
/// interpreter delivers interrupt 0 to the guest.
#[derive(Debug, Error)]
pub enum CpuError {
    /// Decode state that should be structurally impossible (invalid opcode,
    /// group index, or segment register index).
    #[error("invalid operation: {message}\n{state}")]
    InvalidOperation {
        message: String,
        state: Box<ExecutionState>,
    },

    /// No handler is registered for a callback, interrupt or port.
    #[error("unhandled {kind} {index:#x}\n{state}")]
    UnhandledOperation {
        kind: UnhandledKind,
        index: u16,
        state: Box<ExecutionState>,
    },

    /// Continuing would only produce meaningless state.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl CpuError {
    pub fn invalid_operation(state: &ExecutionState, message: impl Into<String>) -> Self {
        CpuError::InvalidOperation {
            message: message.into(),
            state: Box::new(state.clone()),
        }
    }

    pub fn invalid_opcode(state: &ExecutionState, opcode: u8) -> Self {
        Self::invalid_operation(state, format!("invalid opcode {opcode:#04x}"))
    }

    pub fn invalid_group_index(state: &ExecutionState, opcode: u8, group_index: usize) -> Self {
        Self::invalid_operation(
            state,
            format!("invalid group index {group_index} for opcode {opcode:#04x}"),
        )
    }

    pub fn unhandled(state: &ExecutionState, kind: UnhandledKind, index: u16) -> Self {
        CpuError::UnhandledOperation {
            kind,
            index,
            state: Box::new(state.clone()),
        }
    }

    /// Register dump captured when the error was raised, if any.
    pub fn state(&self) -> Option<&ExecutionState> {
        match self {
            CpuError::InvalidOperation { state, .. }
            | CpuError::UnhandledOperation { state, .. } => Some(state.as_ref()),
            CpuError::Unrecoverable(_) => None,
        }
    }
}

impl From<MemoryError> for CpuError {
    fn from(err: MemoryError) -> Self {
        CpuError::Unrecoverable(err.to_string())
    }
}
