use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Architecturally defined FLAGS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flag: u16 {
        const CARRY = 1 << 0;
        const PARITY = 1 << 2;
        const AUXILIARY = 1 << 4;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        const INTERRUPT = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
    }
}

const ALWAYS_ON: u16 = 1 << 1;
const ALWAYS_OFF: u16 = (1 << 3) | (1 << 5) | (1 << 15);
/// IOPL and NT read back as set on the machines DOS software probes for.
const DOS_COMPATIBLE_ON: u16 = 0x7000;

/// Applies the hardwired bits to a raw FLAGS value.
#[inline]
pub const fn check_flag_register(value: u16, dos_compatible: bool) -> u16 {
    let mut res = (value & !ALWAYS_OFF) | ALWAYS_ON;
    if dos_compatible {
        res |= DOS_COMPATIBLE_ON;
    }
    res
}

/// The 16-bit FLAGS register. Every write is re-masked through
/// [`check_flag_register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    value: u16,
    dos_compatible: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Flags {
    pub const fn new(dos_compatible: bool) -> Self {
        Self {
            value: check_flag_register(0, dos_compatible),
            dos_compatible,
        }
    }

    #[inline]
    pub fn value(&self) -> u16 {
        self.value
    }

    #[inline]
    pub fn set_value(&mut self, value: u16) {
        self.value = check_flag_register(value, self.dos_compatible);
    }

    pub fn is_dos_compatible(&self) -> bool {
        self.dos_compatible
    }

    #[inline]
    pub fn get(&self, flag: Flag) -> bool {
        self.value & flag.bits() != 0
    }

    #[inline]
    pub fn set(&mut self, flag: Flag, on: bool) {
        let value = if on {
            self.value | flag.bits()
        } else {
            self.value & !flag.bits()
        };
        self.set_value(value);
    }

    #[inline]
    pub fn carry(&self) -> bool {
        self.get(Flag::CARRY)
    }

    #[inline]
    pub fn set_carry(&mut self, on: bool) {
        self.set(Flag::CARRY, on);
    }

    #[inline]
    pub fn zero(&self) -> bool {
        self.get(Flag::ZERO)
    }

    #[inline]
    pub fn sign(&self) -> bool {
        self.get(Flag::SIGN)
    }

    #[inline]
    pub fn overflow(&self) -> bool {
        self.get(Flag::OVERFLOW)
    }

    #[inline]
    pub fn direction(&self) -> bool {
        self.get(Flag::DIRECTION)
    }

    #[inline]
    pub fn interrupt(&self) -> bool {
        self.get(Flag::INTERRUPT)
    }
}

impl fmt::Display for Flags {
    /// `ODITSZAPC`, with `-` for clear flags.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [(Flag, char); 9] = [
            (Flag::OVERFLOW, 'O'),
            (Flag::DIRECTION, 'D'),
            (Flag::INTERRUPT, 'I'),
            (Flag::TRAP, 'T'),
            (Flag::SIGN, 'S'),
            (Flag::ZERO, 'Z'),
            (Flag::AUXILIARY, 'A'),
            (Flag::PARITY, 'P'),
            (Flag::CARRY, 'C'),
        ];
        for (flag, letter) in LETTERS {
            let c = if self.get(flag) { letter } else { '-' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardwired_bits_survive_every_write() {
        let mut flags = Flags::new(false);
        assert_eq!(flags.value(), 0x0002);

        flags.set_value(0xFFFF);
        assert_eq!(flags.value(), 0x7FD7);

        flags.set_value(0);
        assert_eq!(flags.value(), 0x0002);
    }

    #[test]
    fn dos_compatible_mask_forces_bits_12_to_14() {
        let mut flags = Flags::new(true);
        assert_eq!(flags.value(), 0x7002);
        flags.set(Flag::CARRY, true);
        assert_eq!(flags.value(), 0x7003);
    }

    #[test]
    fn display_lists_set_flags() {
        let mut flags = Flags::default();
        flags.set(Flag::ZERO, true);
        flags.set(Flag::CARRY, true);
        assert_eq!(flags.to_string(), "-----Z--C");
    }
}
