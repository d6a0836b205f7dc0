use std::collections::HashMap;

use dosre_cpu::{CpuError, ExecutionState, Result, UnhandledKind};
use tracing::warn;

/// A device reachable through `IN`/`OUT`. `size` is 1 or 2 bytes.
pub trait PortHandler: Send {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);
}

/// Routes port accesses to registered handlers. One handler may serve many
/// ports.
pub struct IoPortDispatcher {
    handlers: Vec<Box<dyn PortHandler>>,
    ports: HashMap<u16, usize>,
    fail_on_unhandled: bool,
}

impl IoPortDispatcher {
    pub fn new(fail_on_unhandled: bool) -> Self {
        Self {
            handlers: Vec::new(),
            ports: HashMap::new(),
            fail_on_unhandled,
        }
    }

    /// Maps every port in `ports` to `handler`, replacing earlier mappings.
    pub fn register(
        &mut self,
        ports: impl IntoIterator<Item = u16>,
        handler: Box<dyn PortHandler>,
    ) {
        let slot = self.handlers.len();
        self.handlers.push(handler);
        for port in ports {
            self.ports.insert(port, slot);
        }
    }

    pub fn is_handled(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    fn unhandled(&self, state: &ExecutionState, port: u16, access: &str) -> Result<()> {
        if self.fail_on_unhandled {
            return Err(CpuError::unhandled(state, UnhandledKind::IoPort, port));
        }
        warn!(
            port = format_args!("{port:#06x}"),
            access,
            at = %state.current_instruction_address(),
            "unhandled I/O port"
        );
        Ok(())
    }

    pub fn read(&mut self, state: &ExecutionState, port: u16, size: u8) -> Result<u32> {
        match self.ports.get(&port) {
            Some(&slot) => Ok(self.handlers[slot].read(port, size)),
            None => {
                self.unhandled(state, port, "read")?;
                Ok(if size == 1 { 0xFF } else { 0xFFFF })
            }
        }
    }

    pub fn write(&mut self, state: &ExecutionState, port: u16, size: u8, value: u32) -> Result<()> {
        match self.ports.get(&port) {
            Some(&slot) => {
                self.handlers[slot].write(port, size, value);
                Ok(())
            }
            None => self.unhandled(state, port, "write"),
        }
    }
}

impl std::fmt::Debug for IoPortDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPortDispatcher")
            .field("handlers", &self.handlers.len())
            .field("ports", &self.ports.len())
            .field("fail_on_unhandled", &self.fail_on_unhandled)
            .finish()
    }
}
