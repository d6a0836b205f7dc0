#![forbid(unsafe_code)]

//! Flat real-mode memory and segment:offset addressing.

mod address;
mod ram;

pub use address::{physical, SegmentedAddress};
pub use ram::{MemoryError, Ram, REAL_MODE_MEMORY_SIZE};

/// Size in bytes of the interrupt vector table at physical address 0.
pub const IVT_SIZE: u32 = 0x400;

/// Byte-addressed little-endian memory, indexed by physical address.
///
/// Reads take `&self` so that inspection code (stack peeks, return-address
/// checks) can run against a shared borrow. Guest accesses use `read_*` and
/// `write_*`; tooling that looks at memory without the guest doing so uses
/// `peek_*`, which memory breakpoints never see.
pub trait Memory {
    fn read_u8(&self, address: u32) -> u8;
    fn write_u8(&mut self, address: u32, value: u8);

    fn peek_u8(&self, address: u32) -> u8 {
        self.read_u8(address)
    }

    fn peek_u16(&self, address: u32) -> u16 {
        let lo = self.peek_u8(address) as u16;
        let hi = self.peek_u8(address.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn read_u16(&self, address: u32) -> u16 {
        let lo = self.read_u8(address) as u16;
        let hi = self.read_u8(address.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn write_u16(&mut self, address: u32, value: u16) {
        self.write_u8(address, (value & 0xFF) as u8);
        self.write_u8(address.wrapping_add(1), (value >> 8) as u8);
    }

    fn read_u32(&self, address: u32) -> u32 {
        let lo = self.read_u16(address) as u32;
        let hi = self.read_u16(address.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write_u32(&mut self, address: u32, value: u32) {
        self.write_u16(address, (value & 0xFFFF) as u16);
        self.write_u16(address.wrapping_add(2), (value >> 16) as u16);
    }
}
