//! ModRM operand decoding for 16-bit addressing.

use dosre_mem::physical;

use crate::context::CpuContext;
use crate::error::{CpuError, Result};
use crate::recorder::{OperandSize, ValueOperation};
use crate::registers::{BP, BX, DI, DS, SEGMENT_REGISTER_COUNT, SI, SS};

/// Base and index register for each `rm` value. `rm = 6` is BP except in mode
/// 0, where it is a direct address.
const ADDRESS_REGISTERS: [(Option<usize>, Option<usize>); 8] = [
    (Some(BX), Some(SI)),
    (Some(BX), Some(DI)),
    (Some(BP), Some(SI)),
    (Some(BP), Some(DI)),
    (Some(SI), None),
    (Some(DI), None),
    (Some(BP), None),
    (Some(BX), None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryOperand {
    segment_index: usize,
    offset: u16,
    physical: u32,
}

/// A decoded ModRM byte plus its displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    mode: u8,
    reg: usize,
    rm: usize,
    displacement: u16,
    memory: Option<MemoryOperand>,
}

impl ModRm {
    /// Consumes the ModRM byte and any displacement at CS:IP and resolves the
    /// effective address.
    pub fn read(ctx: &mut CpuContext<'_>) -> Self {
        let byte = ctx.next_u8();
        let mode = byte >> 6;
        let reg = ((byte >> 3) & 0b111) as usize;
        let rm = (byte & 0b111) as usize;

        if mode == 0b11 {
            return Self {
                mode,
                reg,
                rm,
                displacement: 0,
                memory: None,
            };
        }

        let direct = mode == 0 && rm == 6;
        let displacement = match mode {
            0 if direct => ctx.next_u16(),
            0 => 0,
            1 => ctx.next_u8() as i8 as u16,
            _ => ctx.next_u16(),
        };

        let (offset, default_segment) = if direct {
            (displacement, DS)
        } else {
            let (base, index) = ADDRESS_REGISTERS[rm];
            let mut offset = displacement;
            for register in base.into_iter().chain(index) {
                offset = offset.wrapping_add(ctx.state.registers.read(register));
            }
            let segment = if base == Some(BP) { SS } else { DS };
            (offset, segment)
        };

        let segment_index = ctx.state.segment_override().unwrap_or(default_segment);
        let segment = ctx.state.segments.read(segment_index);
        ctx.recorder.set_current_value(segment_index, segment, offset);

        Self {
            mode,
            reg,
            rm,
            displacement,
            memory: Some(MemoryOperand {
                segment_index,
                offset,
                physical: physical(segment, offset),
            }),
        }
    }

    #[inline]
    pub fn mode(&self) -> u8 {
        self.mode
    }

    /// The `reg` field: a register index or a group opcode extension.
    #[inline]
    pub fn reg(&self) -> usize {
        self.reg
    }

    #[inline]
    pub fn rm(&self) -> usize {
        self.rm
    }

    pub fn displacement(&self) -> u16 {
        self.displacement
    }

    /// Base and index registers of the memory operand. Both are `None` for a
    /// direct address or a register operand.
    pub fn address_registers(&self) -> (Option<usize>, Option<usize>) {
        if self.memory.is_none() || (self.mode == 0 && self.rm == 6) {
            (None, None)
        } else {
            ADDRESS_REGISTERS[self.rm]
        }
    }

    pub fn has_memory_operand(&self) -> bool {
        self.memory.is_some()
    }

    pub fn memory_address(&self) -> Option<u32> {
        self.memory.map(|m| m.physical)
    }

    /// Effective offset, as `LEA` loads it.
    pub fn memory_offset(&self) -> Option<u16> {
        self.memory.map(|m| m.offset)
    }

    /// Segment register that addresses the memory operand.
    pub fn segment_index(&self) -> Option<usize> {
        self.memory.map(|m| m.segment_index)
    }

    fn record(ctx: &mut CpuContext<'_>, operation: ValueOperation, size: OperandSize) {
        ctx.recorder.set_current_operation(operation, size);
    }

    pub fn get_rm8(&self, ctx: &mut CpuContext<'_>) -> u8 {
        match self.memory {
            Some(m) => {
                Self::record(ctx, ValueOperation::Read, OperandSize::Byte8);
                ctx.memory.read_u8(m.physical)
            }
            None => ctx.state.registers.read8(self.rm),
        }
    }

    pub fn set_rm8(&self, ctx: &mut CpuContext<'_>, value: u8) {
        match self.memory {
            Some(m) => {
                Self::record(ctx, ValueOperation::Write, OperandSize::Byte8);
                ctx.memory.write_u8(m.physical, value);
            }
            None => ctx.state.registers.write8(self.rm, value),
        }
    }

    pub fn get_rm16(&self, ctx: &mut CpuContext<'_>) -> u16 {
        match self.memory {
            Some(m) => {
                Self::record(ctx, ValueOperation::Read, OperandSize::Word16);
                ctx.memory.read_u16(m.physical)
            }
            None => ctx.state.registers.read(self.rm),
        }
    }

    pub fn set_rm16(&self, ctx: &mut CpuContext<'_>, value: u16) {
        match self.memory {
            Some(m) => {
                Self::record(ctx, ValueOperation::Write, OperandSize::Word16);
                ctx.memory.write_u16(m.physical, value);
            }
            None => ctx.state.registers.write(self.rm, value),
        }
    }

    /// Far pointer operand (offset in the low word). Only memory operands
    /// can hold one.
    pub fn get_rm32(&self, ctx: &mut CpuContext<'_>) -> Result<u32> {
        let Some(m) = self.memory else {
            return Err(CpuError::invalid_operation(
                ctx.state,
                "32-bit operand in register mode",
            ));
        };
        Self::record(ctx, ValueOperation::Read, OperandSize::Dword32);
        Ok(ctx.memory.read_u32(m.physical))
    }

    #[inline]
    pub fn get_r8(&self, ctx: &CpuContext<'_>) -> u8 {
        ctx.state.registers.read8(self.reg)
    }

    #[inline]
    pub fn set_r8(&self, ctx: &mut CpuContext<'_>, value: u8) {
        ctx.state.registers.write8(self.reg, value);
    }

    #[inline]
    pub fn get_r16(&self, ctx: &CpuContext<'_>) -> u16 {
        ctx.state.registers.read(self.reg)
    }

    #[inline]
    pub fn set_r16(&self, ctx: &mut CpuContext<'_>, value: u16) {
        ctx.state.registers.write(self.reg, value);
    }

    fn checked_segment_index(&self, ctx: &CpuContext<'_>) -> Result<usize> {
        if self.reg >= SEGMENT_REGISTER_COUNT {
            return Err(CpuError::invalid_operation(
                ctx.state,
                format!("invalid segment register index {}", self.reg),
            ));
        }
        Ok(self.reg)
    }

    pub fn segment_register(&self, ctx: &CpuContext<'_>) -> Result<u16> {
        let index = self.checked_segment_index(ctx)?;
        Ok(ctx.state.segments.read(index))
    }

    pub fn set_segment_register(&self, ctx: &mut CpuContext<'_>, value: u16) -> Result<()> {
        let index = self.checked_segment_index(ctx)?;
        ctx.state.segments.write(index, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dosre_mem::{Memory, Ram};

    use super::*;
    use crate::recorder::StaticAddressesRecorder;
    use crate::state::ExecutionState;

    #[test]
    fn register_operand_has_no_address() {
        let mut state = ExecutionState::default();
        let mut ram = Ram::new(0x10000);
        let mut recorder = StaticAddressesRecorder::new(true);
        ram.write_u8(0, 0xC3); // mod=3 reg=0 rm=3
        state.set_bx(0x1234);

        let mut ctx = CpuContext::new(&mut state, &mut ram, &mut recorder);
        let modrm = ModRm::read(&mut ctx);
        assert!(!modrm.has_memory_operand());
        assert_eq!(modrm.get_rm16(&mut ctx), 0x1234);
        assert!(modrm.get_rm32(&mut ctx).is_err());
        assert_eq!(ctx.state.ip(), 1);
    }

    #[test]
    fn segment_register_index_past_gs_is_invalid() {
        let mut state = ExecutionState::default();
        let mut ram = Ram::new(0x10000);
        let mut recorder = StaticAddressesRecorder::new(false);
        ram.write_u8(0, 0xF8); // mod=3 reg=7

        let mut ctx = CpuContext::new(&mut state, &mut ram, &mut recorder);
        let modrm = ModRm::read(&mut ctx);
        assert!(matches!(
            modrm.segment_register(&ctx),
            Err(CpuError::InvalidOperation { .. })
        ));
    }
}
