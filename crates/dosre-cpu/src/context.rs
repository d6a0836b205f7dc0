use dosre_mem::Memory;

use crate::recorder::StaticAddressesRecorder;
use crate::stack;
use crate::state::ExecutionState;

/// Borrowed view of everything an instruction, a native callback or a function
/// override may touch.
pub struct CpuContext<'a> {
    pub state: &'a mut ExecutionState,
    pub memory: &'a mut dyn Memory,
    pub recorder: &'a mut StaticAddressesRecorder,
}

impl<'a> CpuContext<'a> {
    pub fn new(
        state: &'a mut ExecutionState,
        memory: &'a mut dyn Memory,
        recorder: &'a mut StaticAddressesRecorder,
    ) -> Self {
        Self {
            state,
            memory,
            recorder,
        }
    }

    /// Fetches the byte at CS:IP and advances IP.
    #[inline]
    pub fn next_u8(&mut self) -> u8 {
        let value = self.memory.read_u8(self.state.ip_physical());
        self.state.advance_ip(1);
        value
    }

    #[inline]
    pub fn next_u16(&mut self) -> u16 {
        let lo = self.next_u8() as u16;
        let hi = self.next_u8() as u16;
        lo | (hi << 8)
    }

    pub fn push16(&mut self, value: u16) {
        stack::push16(self.state, self.memory, value);
    }

    pub fn pop16(&mut self) -> u16 {
        stack::pop16(self.state, self.memory)
    }

    pub fn peek16(&self, offset: u16) -> u16 {
        stack::peek16(self.state, self.memory, offset)
    }

    pub fn poke16(&mut self, offset: u16, value: u16) {
        stack::poke16(self.state, self.memory, offset, value);
    }
}
