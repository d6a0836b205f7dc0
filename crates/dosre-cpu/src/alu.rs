//! Flag-producing arithmetic and logic.
//!
//! Every operation is a free function over the FLAGS register. Operands are
//! already masked to their width by their types; results are returned and the
//! caller decides where to store them. Division reports a fault as `None` so
//! the interpreter can raise interrupt 0.

use crate::flags::{Flag, Flags};

/// Even parity of each nibble value.
const NIBBLE_PARITY: [u8; 16] = [1, 0, 0, 1, 0, 1, 1, 0, 0, 1, 1, 0, 1, 0, 0, 1];

#[derive(Debug, Clone, Copy)]
struct Width {
    bits: u32,
    mask: u32,
    msb: u32,
}

const BYTE: Width = Width {
    bits: 8,
    mask: 0xFF,
    msb: 0x80,
};

const WORD: Width = Width {
    bits: 16,
    mask: 0xFFFF,
    msb: 0x8000,
};

#[inline]
pub fn parity(value: u32) -> bool {
    let low = NIBBLE_PARITY[(value & 0xF) as usize];
    let high = NIBBLE_PARITY[((value >> 4) & 0xF) as usize];
    low == high
}

#[inline]
fn set_szp(flags: &mut Flags, result: u32, w: Width) {
    flags.set(Flag::ZERO, result & w.mask == 0);
    flags.set(Flag::SIGN, result & w.msb != 0);
    flags.set(Flag::PARITY, parity(result));
}

fn add(flags: &mut Flags, a: u32, b: u32, carry_in: bool, w: Width) -> u32 {
    let result = a.wrapping_add(b).wrapping_add(carry_in as u32) & w.mask;
    let carry_bits = (a ^ b ^ result) ^ ((a ^ result) & !(a ^ b));
    let overflow_bits = (a ^ result) & !(a ^ b);
    flags.set(Flag::CARRY, carry_bits & w.msb != 0);
    flags.set(Flag::OVERFLOW, overflow_bits & w.msb != 0);
    flags.set(Flag::AUXILIARY, carry_bits & 0x8 != 0);
    set_szp(flags, result, w);
    result
}

fn sub(flags: &mut Flags, a: u32, b: u32, borrow_in: bool, w: Width) -> u32 {
    let result = a.wrapping_sub(b).wrapping_sub(borrow_in as u32) & w.mask;
    let borrow_bits = (a ^ b ^ result) ^ ((a ^ result) & (a ^ b));
    let overflow_bits = (a ^ result) & (a ^ b);
    flags.set(Flag::CARRY, borrow_bits & w.msb != 0);
    flags.set(Flag::OVERFLOW, overflow_bits & w.msb != 0);
    flags.set(Flag::AUXILIARY, borrow_bits & 0x8 != 0);
    set_szp(flags, result, w);
    result
}

fn logic(flags: &mut Flags, result: u32, w: Width) -> u32 {
    flags.set(Flag::CARRY, false);
    flags.set(Flag::OVERFLOW, false);
    set_szp(flags, result, w);
    result & w.mask
}

fn shl(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let result = (value << count) & w.mask;
    let carry = (value << (count - 1)) & w.msb != 0;
    flags.set(Flag::CARRY, carry);
    flags.set(Flag::OVERFLOW, (result & w.msb != 0) ^ carry);
    set_szp(flags, result, w);
    result
}

fn shr(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let result = value >> count;
    flags.set(Flag::CARRY, (value >> (count - 1)) & 1 != 0);
    flags.set(Flag::OVERFLOW, value & w.msb != 0);
    set_szp(flags, result, w);
    result
}

fn sar(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let shift = 32 - w.bits;
    let signed = ((value << shift) as i32) >> shift;
    let result = (signed >> count) as u32 & w.mask;
    flags.set(Flag::CARRY, (signed >> (count - 1)) & 1 != 0);
    flags.set(Flag::OVERFLOW, false);
    set_szp(flags, result, w);
    result
}

fn rol(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let c = count % w.bits;
    let result = ((value << c) | (value >> (w.bits - c))) & w.mask;
    let carry = result & 1 != 0;
    flags.set(Flag::CARRY, carry);
    flags.set(Flag::OVERFLOW, (result & w.msb != 0) ^ carry);
    result
}

fn ror(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let c = count % w.bits;
    let result = ((value >> c) | (value << (w.bits - c))) & w.mask;
    let msb = result & w.msb != 0;
    flags.set(Flag::CARRY, msb);
    flags.set(Flag::OVERFLOW, msb ^ (result & (w.msb >> 1) != 0));
    result
}

/// Rotates through carry as a `bits + 1` wide value with CF on top.
fn rcl(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = (count & 0x1F) % (w.bits + 1);
    if count == 0 {
        return value;
    }
    let span = w.bits + 1;
    let wide = value | ((flags.carry() as u32) << w.bits);
    let rotated = ((wide << count) | (wide >> (span - count))) & ((1 << span) - 1);
    let result = rotated & w.mask;
    let carry = rotated >> w.bits != 0;
    flags.set(Flag::CARRY, carry);
    flags.set(Flag::OVERFLOW, (result & w.msb != 0) ^ carry);
    result
}

fn rcr(flags: &mut Flags, value: u32, count: u32, w: Width) -> u32 {
    let count = (count & 0x1F) % (w.bits + 1);
    if count == 0 {
        return value;
    }
    let span = w.bits + 1;
    let wide = value | ((flags.carry() as u32) << w.bits);
    let rotated = ((wide >> count) | (wide << (span - count))) & ((1 << span) - 1);
    let result = rotated & w.mask;
    flags.set(Flag::CARRY, rotated >> w.bits != 0);
    flags.set(
        Flag::OVERFLOW,
        (result & w.msb != 0) ^ (result & (w.msb >> 1) != 0),
    );
    result
}

macro_rules! width_ops {
    ($ty:ty, $w:expr, $add:ident, $adc:ident, $sub:ident, $sbb:ident, $cmp:ident, $neg:ident,
     $inc:ident, $dec:ident, $or:ident, $and:ident, $xor:ident, $test:ident,
     $shl:ident, $shr:ident, $sar:ident, $rol:ident, $ror:ident, $rcl:ident, $rcr:ident) => {
        pub fn $add(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            add(flags, a as u32, b as u32, false, $w) as $ty
        }

        pub fn $adc(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            let carry = flags.carry();
            add(flags, a as u32, b as u32, carry, $w) as $ty
        }

        pub fn $sub(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            sub(flags, a as u32, b as u32, false, $w) as $ty
        }

        pub fn $sbb(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            let borrow = flags.carry();
            sub(flags, a as u32, b as u32, borrow, $w) as $ty
        }

        /// Subtraction that only updates flags.
        pub fn $cmp(flags: &mut Flags, a: $ty, b: $ty) {
            sub(flags, a as u32, b as u32, false, $w);
        }

        pub fn $neg(flags: &mut Flags, value: $ty) -> $ty {
            sub(flags, 0, value as u32, false, $w) as $ty
        }

        pub fn $inc(flags: &mut Flags, value: $ty) -> $ty {
            let carry = flags.carry();
            let result = add(flags, value as u32, 1, false, $w) as $ty;
            flags.set_carry(carry);
            result
        }

        pub fn $dec(flags: &mut Flags, value: $ty) -> $ty {
            let carry = flags.carry();
            let result = sub(flags, value as u32, 1, false, $w) as $ty;
            flags.set_carry(carry);
            result
        }

        pub fn $or(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            logic(flags, (a | b) as u32, $w) as $ty
        }

        pub fn $and(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            logic(flags, (a & b) as u32, $w) as $ty
        }

        pub fn $xor(flags: &mut Flags, a: $ty, b: $ty) -> $ty {
            logic(flags, (a ^ b) as u32, $w) as $ty
        }

        pub fn $test(flags: &mut Flags, a: $ty, b: $ty) {
            logic(flags, (a & b) as u32, $w);
        }

        pub fn $shl(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            shl(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $shr(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            shr(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $sar(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            sar(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $rol(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            rol(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $ror(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            ror(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $rcl(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            rcl(flags, value as u32, count as u32, $w) as $ty
        }

        pub fn $rcr(flags: &mut Flags, value: $ty, count: u8) -> $ty {
            rcr(flags, value as u32, count as u32, $w) as $ty
        }
    };
}

width_ops!(
    u8, BYTE, add8, adc8, sub8, sbb8, cmp8, neg8, inc8, dec8, or8, and8, xor8, test8, shl8,
    shr8, sar8, rol8, ror8, rcl8, rcr8
);

width_ops!(
    u16, WORD, add16, adc16, sub16, sbb16, cmp16, neg16, inc16, dec16, or16, and16, xor16,
    test16, shl16, shr16, sar16, rol16, ror16, rcl16, rcr16
);

fn set_multiply_flags(flags: &mut Flags, low: u32, overflow: bool, w: Width) {
    flags.set(Flag::CARRY, overflow);
    flags.set(Flag::OVERFLOW, overflow);
    set_szp(flags, low, w);
}

/// `AL * src`, full width result for AX.
pub fn mul8(flags: &mut Flags, a: u8, b: u8) -> u16 {
    let result = a as u16 * b as u16;
    set_multiply_flags(flags, result as u32 & 0xFF, result >> 8 != 0, BYTE);
    result
}

pub fn mul16(flags: &mut Flags, a: u16, b: u16) -> u32 {
    let result = a as u32 * b as u32;
    set_multiply_flags(flags, result & 0xFFFF, result >> 16 != 0, WORD);
    result
}

pub fn imul8(flags: &mut Flags, a: u8, b: u8) -> u16 {
    let result = (a as i8 as i16) * (b as i8 as i16);
    let overflow = result != (result as i8) as i16;
    set_multiply_flags(flags, result as u32 & 0xFF, overflow, BYTE);
    result as u16
}

pub fn imul16(flags: &mut Flags, a: u16, b: u16) -> u32 {
    let result = (a as i16 as i32) * (b as i16 as i32);
    let overflow = result != (result as i16) as i32;
    set_multiply_flags(flags, result as u32 & 0xFFFF, overflow, WORD);
    result as u32
}

/// Unsigned `AX / src`. `None` on a zero divisor or a quotient above 0xFF.
pub fn div8(dividend: u16, divisor: u8) -> Option<u8> {
    if divisor == 0 {
        return None;
    }
    u8::try_from(dividend / divisor as u16).ok()
}

pub fn idiv8(dividend: u16, divisor: u8) -> Option<u8> {
    if divisor == 0 {
        return None;
    }
    let quotient = (dividend as i16 as i32) / (divisor as i8 as i32);
    i8::try_from(quotient).ok().map(|q| q as u8)
}

/// Unsigned `DX:AX / src`.
pub fn div16(dividend: u32, divisor: u16) -> Option<u16> {
    if divisor == 0 {
        return None;
    }
    u16::try_from(dividend / divisor as u32).ok()
}

pub fn idiv16(dividend: u32, divisor: u16) -> Option<u16> {
    if divisor == 0 {
        return None;
    }
    let quotient = (dividend as i32 as i64) / (divisor as i16 as i64);
    i16::try_from(quotient).ok().map(|q| q as u16)
}
