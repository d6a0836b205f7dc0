//! Register files indexed the way the x86 encoding indexes them.

pub const AX: usize = 0;
pub const CX: usize = 1;
pub const DX: usize = 2;
pub const BX: usize = 3;
pub const SP: usize = 4;
pub const BP: usize = 5;
pub const SI: usize = 6;
pub const DI: usize = 7;

pub const ES: usize = 0;
pub const CS: usize = 1;
pub const SS: usize = 2;
pub const DS: usize = 3;
pub const FS: usize = 4;
pub const GS: usize = 5;

pub const GENERAL_REGISTER_COUNT: usize = 8;
pub const SEGMENT_REGISTER_COUNT: usize = 6;

const GENERAL_NAMES: [&str; GENERAL_REGISTER_COUNT] =
    ["AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI"];
const BYTE_NAMES: [&str; GENERAL_REGISTER_COUNT] =
    ["AL", "CL", "DL", "BL", "AH", "CH", "DH", "BH"];
const SEGMENT_NAMES: [&str; SEGMENT_REGISTER_COUNT] = ["ES", "CS", "SS", "DS", "FS", "GS"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile<const N: usize> {
    values: [u16; N],
}

pub type GeneralRegisters = RegisterFile<GENERAL_REGISTER_COUNT>;
pub type SegmentRegisters = RegisterFile<SEGMENT_REGISTER_COUNT>;

impl<const N: usize> Default for RegisterFile<N> {
    fn default() -> Self {
        Self { values: [0; N] }
    }
}

impl<const N: usize> RegisterFile<N> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read(&self, index: usize) -> u16 {
        self.values[index]
    }

    #[inline]
    pub fn write(&mut self, index: usize, value: u16) {
        self.values[index] = value;
    }
}

impl GeneralRegisters {
    /// 8-bit register by encoding: 0-3 are AL CL DL BL, 4-7 are AH CH DH BH.
    #[inline]
    pub fn read8(&self, index: usize) -> u8 {
        let word = self.values[index & 0b11];
        if index & 0b100 == 0 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    #[inline]
    pub fn write8(&mut self, index: usize, value: u8) {
        let slot = &mut self.values[index & 0b11];
        *slot = if index & 0b100 == 0 {
            (*slot & 0xFF00) | value as u16
        } else {
            (*slot & 0x00FF) | ((value as u16) << 8)
        };
    }
}

pub fn general_name(index: usize) -> &'static str {
    GENERAL_NAMES[index]
}

pub fn byte_name(index: usize) -> &'static str {
    BYTE_NAMES[index]
}

pub fn segment_name(index: usize) -> &'static str {
    SEGMENT_NAMES[index]
}
