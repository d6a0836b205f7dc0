//! Fetch-decode-execute over the real-mode 8086 instruction set, plus the
//! 186 additions DOS compilers emit (`PUSH imm`, `IMUL imm`, `PUSHA`/`POPA`,
//! `ENTER`/`LEAVE`, immediate shift counts).
//!
//! Every call, interrupt and return goes through the [`FunctionHandler`], and
//! the reserved `FE 38` encoding hands control to the [`CallbackDispatcher`].

use std::collections::VecDeque;

use dosre_cpu::alu;
use dosre_cpu::recorder::{OperandSize, ValueOperation};
use dosre_cpu::registers::{AX, BP, BX, CS, CX, DI, DS, DX, ES, FS, GS, SI, SP, SS};
use dosre_cpu::{
    stack, CpuContext, CpuError, ExecutionState, Flag, ModRm, Result, StaticAddressesRecorder,
};
use dosre_mem::{physical, Memory, SegmentedAddress};
use tracing::trace;

use crate::callback::CallbackDispatcher;
use crate::config::MachineConfig;
use crate::function::{CallType, FunctionHandler};
use crate::ioport::IoPortDispatcher;

pub const DIVIDE_ERROR_VECTOR: u8 = 0;
pub const BREAKPOINT_VECTOR: u8 = 3;
pub const OVERFLOW_VECTOR: u8 = 4;

/// Bits `SAHF` may change: SF ZF AF PF CF.
const SAHF_MASK: u16 = 0x00D5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    Continue,
    /// `HLT` executed. IP points past it.
    Halt,
}

/// The interpreter and the per-machine services it dispatches into.
#[derive(Debug)]
pub struct Cpu {
    pub state: ExecutionState,
    pub recorder: StaticAddressesRecorder,
    pub function_handler: FunctionHandler,
    pub callbacks: CallbackDispatcher,
    pub ports: IoPortDispatcher,
    pending_interrupts: VecDeque<u8>,
}

impl Cpu {
    pub fn new(config: &MachineConfig) -> Self {
        let mut state = ExecutionState::new(config.dos_compatible_flags);
        state.set_ip_address(config.entry_point);
        state.set_ss(config.initial_stack.segment());
        state.set_sp(config.initial_stack.offset());
        Self {
            state,
            recorder: StaticAddressesRecorder::new(config.debug_mode),
            function_handler: FunctionHandler::new(config.debug_mode, config.use_code_override),
            callbacks: CallbackDispatcher::new(config.callback_segment),
            ports: IoPortDispatcher::new(config.fail_on_unhandled_port),
            pending_interrupts: VecDeque::new(),
        }
    }

    /// Queues a hardware interrupt. It is delivered at the next instruction
    /// boundary with IF set.
    pub fn request_external_interrupt(&mut self, vector: u8) {
        self.pending_interrupts.push_back(vector);
    }

    pub fn pending_interrupts(&self) -> usize {
        self.pending_interrupts.len()
    }

    /// Runs `f` with a context borrowing this CPU's state, the given memory
    /// and the tracking services.
    pub fn with_context<R>(
        &mut self,
        memory: &mut dyn Memory,
        f: impl FnOnce(&mut CpuContext<'_>, &mut FunctionHandler) -> R,
    ) -> R {
        let mut ctx = CpuContext::new(&mut self.state, memory, &mut self.recorder);
        f(&mut ctx, &mut self.function_handler)
    }

    pub fn execute_next_instruction(&mut self, memory: &mut dyn Memory) -> Result<CpuExit> {
        let Cpu {
            state,
            recorder,
            function_handler,
            callbacks,
            ports,
            pending_interrupts,
        } = self;

        let deliver = if state.flags.interrupt() {
            pending_interrupts.pop_front()
        } else {
            None
        };

        let mut exec = Executor {
            ctx: CpuContext::new(state, memory, recorder),
            functions: function_handler,
            callbacks,
            ports,
        };

        if let Some(vector) = deliver {
            exec.ctx.state.start_instruction();
            exec.interrupt(vector, None, false)?;
            return Ok(CpuExit::Continue);
        }
        exec.step()
    }
}

struct Executor<'a> {
    ctx: CpuContext<'a>,
    functions: &'a mut FunctionHandler,
    callbacks: &'a mut CallbackDispatcher,
    ports: &'a mut IoPortDispatcher,
}

impl Executor<'_> {
    fn step(&mut self) -> Result<CpuExit> {
        self.ctx.state.start_instruction();
        self.ctx.recorder.reset();
        let exit = self.execute()?;
        self.ctx.recorder.commit();
        self.ctx.state.increment_cycles();
        Ok(exit)
    }

    fn state(&mut self) -> &mut ExecutionState {
        self.ctx.state
    }

    fn invalid_opcode(&self, opcode: u8) -> CpuError {
        CpuError::invalid_opcode(self.ctx.state, opcode)
    }

    fn invalid_group_index(&self, opcode: u8, index: usize) -> CpuError {
        CpuError::invalid_group_index(self.ctx.state, opcode, index)
    }

    fn execute(&mut self) -> Result<CpuExit> {
        loop {
            let opcode = self.ctx.next_u8();
            let state = self.state();
            match opcode {
                0x26 => state.set_segment_override(Some(ES)),
                0x2E => state.set_segment_override(Some(CS)),
                0x36 => state.set_segment_override(Some(SS)),
                0x3E => state.set_segment_override(Some(DS)),
                0x64 => state.set_segment_override(Some(FS)),
                0x65 => state.set_segment_override(Some(GS)),
                0xF0 => {}
                0xF2 => state.set_continue_zero_flag_value(Some(false)),
                0xF3 => state.set_continue_zero_flag_value(Some(true)),
                _ => {
                    let at = self.ctx.state.current_instruction_address();
                    trace!(%at, opcode, "execute");
                    return self.execute_opcode(opcode);
                }
            }
        }
    }

    fn execute_opcode(&mut self, opcode: u8) -> Result<CpuExit> {
        match opcode {
            0x00..=0x3F if opcode & 7 < 6 => self.alu_block(opcode),
            0x06 | 0x0E | 0x16 | 0x1E => {
                let value = self.ctx.state.segments.read(usize::from(opcode >> 3));
                self.ctx.push16(value);
            }
            0x07 | 0x17 | 0x1F => {
                let value = self.ctx.pop16();
                self.ctx.state.segments.write(usize::from(opcode >> 3), value);
            }
            0x27 | 0x2F | 0x37 | 0x3F => {
                return Err(CpuError::invalid_operation(
                    self.ctx.state,
                    format!("unsupported decimal adjust opcode {opcode:#04x}"),
                ));
            }
            0x40..=0x47 => {
                let index = usize::from(opcode & 7);
                let value = self.ctx.state.registers.read(index);
                let result = alu::inc16(&mut self.ctx.state.flags, value);
                self.ctx.state.registers.write(index, result);
            }
            0x48..=0x4F => {
                let index = usize::from(opcode & 7);
                let value = self.ctx.state.registers.read(index);
                let result = alu::dec16(&mut self.ctx.state.flags, value);
                self.ctx.state.registers.write(index, result);
            }
            0x50..=0x57 => {
                // PUSH SP pushes the decremented value on the 8086.
                let index = usize::from(opcode & 7);
                let value = if index == SP {
                    self.ctx.state.sp().wrapping_sub(2)
                } else {
                    self.ctx.state.registers.read(index)
                };
                self.ctx.push16(value);
            }
            0x58..=0x5F => {
                let value = self.ctx.pop16();
                self.ctx.state.registers.write(usize::from(opcode & 7), value);
            }
            0x60 => self.pusha(),
            0x61 => self.popa(),
            0x68 => {
                let value = self.ctx.next_u16();
                self.ctx.push16(value);
            }
            0x69 | 0x6B => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm16(&mut self.ctx);
                let b = if opcode == 0x69 {
                    self.ctx.next_u16()
                } else {
                    self.ctx.next_u8() as i8 as u16
                };
                let result = alu::imul16(&mut self.ctx.state.flags, a, b);
                modrm.set_r16(&mut self.ctx, result as u16);
            }
            0x6A => {
                let value = self.ctx.next_u8() as i8 as u16;
                self.ctx.push16(value);
            }
            0x70..=0x7F => {
                let displacement = self.ctx.next_u8() as i8 as u16;
                if self.condition(opcode & 0xF) {
                    self.jump_relative(displacement);
                }
            }
            0x80..=0x83 => self.group1(opcode)?,
            0x84 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm8(&mut self.ctx);
                let b = modrm.get_r8(&self.ctx);
                alu::test8(&mut self.ctx.state.flags, a, b);
            }
            0x85 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm16(&mut self.ctx);
                let b = modrm.get_r16(&self.ctx);
                alu::test16(&mut self.ctx.state.flags, a, b);
            }
            0x86 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm8(&mut self.ctx);
                let b = modrm.get_r8(&self.ctx);
                modrm.set_rm8(&mut self.ctx, b);
                modrm.set_r8(&mut self.ctx, a);
            }
            0x87 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm16(&mut self.ctx);
                let b = modrm.get_r16(&self.ctx);
                modrm.set_rm16(&mut self.ctx, b);
                modrm.set_r16(&mut self.ctx, a);
            }
            0x88 => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.get_r8(&self.ctx);
                modrm.set_rm8(&mut self.ctx, value);
            }
            0x89 => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.get_r16(&self.ctx);
                modrm.set_rm16(&mut self.ctx, value);
            }
            0x8A => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.get_rm8(&mut self.ctx);
                modrm.set_r8(&mut self.ctx, value);
            }
            0x8B => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.get_rm16(&mut self.ctx);
                modrm.set_r16(&mut self.ctx, value);
            }
            0x8C => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.segment_register(&self.ctx)?;
                modrm.set_rm16(&mut self.ctx, value);
            }
            0x8D => {
                let modrm = ModRm::read(&mut self.ctx);
                let Some(offset) = modrm.memory_offset() else {
                    return Err(CpuError::invalid_operation(
                        self.ctx.state,
                        "LEA with a register operand",
                    ));
                };
                modrm.set_r16(&mut self.ctx, offset);
            }
            0x8E => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = modrm.get_rm16(&mut self.ctx);
                modrm.set_segment_register(&mut self.ctx, value)?;
            }
            0x8F => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = self.ctx.pop16();
                modrm.set_rm16(&mut self.ctx, value);
            }
            0x90 | 0x9B => {}
            0x91..=0x97 => {
                let index = usize::from(opcode & 7);
                let state = self.state();
                let other = state.registers.read(index);
                let ax = state.ax();
                state.registers.write(index, ax);
                state.set_ax(other);
            }
            0x98 => {
                let state = self.state();
                state.set_ax(state.al() as i8 as u16);
            }
            0x99 => {
                let state = self.state();
                let dx = if state.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                state.set_dx(dx);
            }
            0x9A => {
                let offset = self.ctx.next_u16();
                let segment = self.ctx.next_u16();
                self.call_far(SegmentedAddress::new(segment, offset))?;
            }
            0x9C => {
                let flags = self.ctx.state.flags.value();
                self.ctx.push16(flags);
            }
            0x9D => {
                let flags = self.ctx.pop16();
                self.ctx.state.flags.set_value(flags);
            }
            0x9E => {
                let state = self.state();
                let value =
                    (state.flags.value() & !SAHF_MASK) | (u16::from(state.ah()) & SAHF_MASK);
                state.flags.set_value(value);
            }
            0x9F => {
                let state = self.state();
                let low = state.flags.value() as u8;
                state.set_ah(low);
            }
            0xA0..=0xA3 => self.move_direct(opcode),
            0xA4..=0xA7 | 0xAA..=0xAF => self.string_instruction(opcode),
            0xA8 => {
                let imm = self.ctx.next_u8();
                let al = self.ctx.state.al();
                alu::test8(&mut self.ctx.state.flags, al, imm);
            }
            0xA9 => {
                let imm = self.ctx.next_u16();
                let ax = self.ctx.state.ax();
                alu::test16(&mut self.ctx.state.flags, ax, imm);
            }
            0xB0..=0xB7 => {
                let value = self.ctx.next_u8();
                self.ctx.state.registers.write8(usize::from(opcode & 7), value);
            }
            0xB8..=0xBF => {
                let value = self.ctx.next_u16();
                self.ctx.state.registers.write(usize::from(opcode & 7), value);
            }
            0xC0 | 0xC1 | 0xD0..=0xD3 => self.group2(opcode),
            0xC2 => {
                let pop = self.ctx.next_u16();
                self.functions.near_ret(&mut self.ctx, pop);
            }
            0xC3 => self.functions.near_ret(&mut self.ctx, 0),
            0xC4 | 0xC5 => {
                let modrm = ModRm::read(&mut self.ctx);
                let pointer = modrm.get_rm32(&mut self.ctx)?;
                modrm.set_r16(&mut self.ctx, pointer as u16);
                let segment = if opcode == 0xC4 { ES } else { DS };
                self.ctx.state.segments.write(segment, (pointer >> 16) as u16);
            }
            0xC6 => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = self.ctx.next_u8();
                modrm.set_rm8(&mut self.ctx, value);
            }
            0xC7 => {
                let modrm = ModRm::read(&mut self.ctx);
                let value = self.ctx.next_u16();
                modrm.set_rm16(&mut self.ctx, value);
            }
            0xC8 => {
                let size = self.ctx.next_u16();
                let level = self.ctx.next_u8();
                self.enter(size, level);
            }
            0xC9 => {
                let bp = self.ctx.state.bp();
                self.ctx.state.set_sp(bp);
                let value = self.ctx.pop16();
                self.ctx.state.set_bp(value);
            }
            0xCA => {
                let pop = self.ctx.next_u16();
                self.functions.far_ret(&mut self.ctx, pop);
            }
            0xCB => self.functions.far_ret(&mut self.ctx, 0),
            0xCC => self.software_interrupt(BREAKPOINT_VECTOR)?,
            0xCD => {
                let vector = self.ctx.next_u8();
                self.software_interrupt(vector)?;
            }
            0xCE => {
                if self.ctx.state.flags.overflow() {
                    self.software_interrupt(OVERFLOW_VECTOR)?;
                }
            }
            0xCF => self.functions.interrupt_ret(&mut self.ctx),
            0xD4 => {
                let base = self.ctx.next_u8();
                if base == 0 {
                    self.divide_error()?;
                } else {
                    let state = self.state();
                    let al = state.al();
                    state.set_ah(al / base);
                    state.set_al(al % base);
                    let al = state.al();
                    alu::or8(&mut state.flags, al, 0);
                }
            }
            0xD5 => {
                let base = self.ctx.next_u8();
                let state = self.state();
                let al = state.al().wrapping_add(state.ah().wrapping_mul(base));
                state.set_ax(u16::from(al));
                alu::or8(&mut state.flags, al, 0);
            }
            0xD7 => {
                let state = &*self.ctx.state;
                let offset = state.bx().wrapping_add(u16::from(state.al()));
                let address = state.data_physical(DS, offset);
                let value = self.ctx.memory.read_u8(address);
                self.ctx.state.set_al(value);
            }
            0xE0..=0xE3 => {
                let displacement = self.ctx.next_u8() as i8 as u16;
                if self.loop_condition(opcode) {
                    self.jump_relative(displacement);
                }
            }
            0xE4 => {
                let port = u16::from(self.ctx.next_u8());
                let value = self.ports.read(self.ctx.state, port, 1)?;
                self.ctx.state.set_al(value as u8);
            }
            0xE5 => {
                let port = u16::from(self.ctx.next_u8());
                let value = self.ports.read(self.ctx.state, port, 2)?;
                self.ctx.state.set_ax(value as u16);
            }
            0xE6 => {
                let port = u16::from(self.ctx.next_u8());
                let value = u32::from(self.ctx.state.al());
                self.ports.write(self.ctx.state, port, 1, value)?;
            }
            0xE7 => {
                let port = u16::from(self.ctx.next_u8());
                let value = u32::from(self.ctx.state.ax());
                self.ports.write(self.ctx.state, port, 2, value)?;
            }
            0xE8 => {
                let displacement = self.ctx.next_u16();
                let target = self.ctx.state.ip().wrapping_add(displacement);
                self.call_near(target)?;
            }
            0xE9 => {
                let displacement = self.ctx.next_u16();
                self.jump_relative(displacement);
            }
            0xEA => {
                let offset = self.ctx.next_u16();
                let segment = self.ctx.next_u16();
                self.ctx
                    .state
                    .set_ip_address(SegmentedAddress::new(segment, offset));
            }
            0xEB => {
                let displacement = self.ctx.next_u8() as i8 as u16;
                self.jump_relative(displacement);
            }
            0xEC => {
                let port = self.ctx.state.dx();
                let value = self.ports.read(self.ctx.state, port, 1)?;
                self.ctx.state.set_al(value as u8);
            }
            0xED => {
                let port = self.ctx.state.dx();
                let value = self.ports.read(self.ctx.state, port, 2)?;
                self.ctx.state.set_ax(value as u16);
            }
            0xEE => {
                let port = self.ctx.state.dx();
                let value = u32::from(self.ctx.state.al());
                self.ports.write(self.ctx.state, port, 1, value)?;
            }
            0xEF => {
                let port = self.ctx.state.dx();
                let value = u32::from(self.ctx.state.ax());
                self.ports.write(self.ctx.state, port, 2, value)?;
            }
            0xF4 => return Ok(CpuExit::Halt),
            0xF5 => {
                let carry = self.ctx.state.flags.carry();
                self.ctx.state.flags.set_carry(!carry);
            }
            0xF6 | 0xF7 => self.group3(opcode)?,
            0xF8 => self.ctx.state.flags.set(Flag::CARRY, false),
            0xF9 => self.ctx.state.flags.set(Flag::CARRY, true),
            0xFA => self.ctx.state.flags.set(Flag::INTERRUPT, false),
            0xFB => self.ctx.state.flags.set(Flag::INTERRUPT, true),
            0xFC => self.ctx.state.flags.set(Flag::DIRECTION, false),
            0xFD => self.ctx.state.flags.set(Flag::DIRECTION, true),
            0xFE => self.group4(opcode)?,
            0xFF => self.group5(opcode)?,
            _ => return Err(self.invalid_opcode(opcode)),
        }
        Ok(CpuExit::Continue)
    }

    /// Runs ALU operation `op` (ADD OR ADC SBB AND SUB XOR CMP). `None` means
    /// the result is discarded.
    fn alu8(&mut self, op: usize, a: u8, b: u8) -> Option<u8> {
        let flags = &mut self.ctx.state.flags;
        match op {
            0 => Some(alu::add8(flags, a, b)),
            1 => Some(alu::or8(flags, a, b)),
            2 => Some(alu::adc8(flags, a, b)),
            3 => Some(alu::sbb8(flags, a, b)),
            4 => Some(alu::and8(flags, a, b)),
            5 => Some(alu::sub8(flags, a, b)),
            6 => Some(alu::xor8(flags, a, b)),
            _ => {
                alu::cmp8(flags, a, b);
                None
            }
        }
    }

    fn alu16(&mut self, op: usize, a: u16, b: u16) -> Option<u16> {
        let flags = &mut self.ctx.state.flags;
        match op {
            0 => Some(alu::add16(flags, a, b)),
            1 => Some(alu::or16(flags, a, b)),
            2 => Some(alu::adc16(flags, a, b)),
            3 => Some(alu::sbb16(flags, a, b)),
            4 => Some(alu::and16(flags, a, b)),
            5 => Some(alu::sub16(flags, a, b)),
            6 => Some(alu::xor16(flags, a, b)),
            _ => {
                alu::cmp16(flags, a, b);
                None
            }
        }
    }

    /// Opcodes `00`-`3D` with low three bits 0-5.
    fn alu_block(&mut self, opcode: u8) {
        let op = usize::from((opcode >> 3) & 7);
        match opcode & 7 {
            0 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm8(&mut self.ctx);
                let b = modrm.get_r8(&self.ctx);
                if let Some(result) = self.alu8(op, a, b) {
                    modrm.set_rm8(&mut self.ctx, result);
                }
            }
            1 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_rm16(&mut self.ctx);
                let b = modrm.get_r16(&self.ctx);
                if let Some(result) = self.alu16(op, a, b) {
                    modrm.set_rm16(&mut self.ctx, result);
                }
            }
            2 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_r8(&self.ctx);
                let b = modrm.get_rm8(&mut self.ctx);
                if let Some(result) = self.alu8(op, a, b) {
                    modrm.set_r8(&mut self.ctx, result);
                }
            }
            3 => {
                let modrm = ModRm::read(&mut self.ctx);
                let a = modrm.get_r16(&self.ctx);
                let b = modrm.get_rm16(&mut self.ctx);
                if let Some(result) = self.alu16(op, a, b) {
                    modrm.set_r16(&mut self.ctx, result);
                }
            }
            4 => {
                let b = self.ctx.next_u8();
                let a = self.ctx.state.al();
                if let Some(result) = self.alu8(op, a, b) {
                    self.ctx.state.set_al(result);
                }
            }
            _ => {
                let b = self.ctx.next_u16();
                let a = self.ctx.state.ax();
                if let Some(result) = self.alu16(op, a, b) {
                    self.ctx.state.set_ax(result);
                }
            }
        }
    }

    fn group1(&mut self, opcode: u8) -> Result<()> {
        let modrm = ModRm::read(&mut self.ctx);
        let op = modrm.reg();
        match opcode {
            0x80 | 0x82 => {
                let b = self.ctx.next_u8();
                let a = modrm.get_rm8(&mut self.ctx);
                if let Some(result) = self.alu8(op, a, b) {
                    modrm.set_rm8(&mut self.ctx, result);
                }
            }
            _ => {
                let b = if opcode == 0x81 {
                    self.ctx.next_u16()
                } else {
                    self.ctx.next_u8() as i8 as u16
                };
                let a = modrm.get_rm16(&mut self.ctx);
                if let Some(result) = self.alu16(op, a, b) {
                    modrm.set_rm16(&mut self.ctx, result);
                }
            }
        }
        Ok(())
    }

    /// Shifts and rotates: `C0`/`C1` by imm8, `D0`/`D1` by one, `D2`/`D3` by CL.
    fn group2(&mut self, opcode: u8) {
        let modrm = ModRm::read(&mut self.ctx);
        let count = match opcode {
            0xC0 | 0xC1 => self.ctx.next_u8(),
            0xD0 | 0xD1 => 1,
            _ => self.ctx.state.cl(),
        };
        let op = modrm.reg();
        if opcode & 1 == 0 {
            let value = modrm.get_rm8(&mut self.ctx);
            let flags = &mut self.ctx.state.flags;
            let result = match op {
                0 => alu::rol8(flags, value, count),
                1 => alu::ror8(flags, value, count),
                2 => alu::rcl8(flags, value, count),
                3 => alu::rcr8(flags, value, count),
                4 | 6 => alu::shl8(flags, value, count),
                5 => alu::shr8(flags, value, count),
                _ => alu::sar8(flags, value, count),
            };
            modrm.set_rm8(&mut self.ctx, result);
        } else {
            let value = modrm.get_rm16(&mut self.ctx);
            let flags = &mut self.ctx.state.flags;
            let result = match op {
                0 => alu::rol16(flags, value, count),
                1 => alu::ror16(flags, value, count),
                2 => alu::rcl16(flags, value, count),
                3 => alu::rcr16(flags, value, count),
                4 | 6 => alu::shl16(flags, value, count),
                5 => alu::shr16(flags, value, count),
                _ => alu::sar16(flags, value, count),
            };
            modrm.set_rm16(&mut self.ctx, result);
        }
    }

    fn group3(&mut self, opcode: u8) -> Result<()> {
        let modrm = ModRm::read(&mut self.ctx);
        if opcode == 0xF6 {
            self.group3_8(modrm)
        } else {
            self.group3_16(modrm)
        }
    }

    fn group3_8(&mut self, modrm: ModRm) -> Result<()> {
        match modrm.reg() {
            0 | 1 => {
                let imm = self.ctx.next_u8();
                let value = modrm.get_rm8(&mut self.ctx);
                alu::test8(&mut self.ctx.state.flags, value, imm);
            }
            2 => {
                let value = modrm.get_rm8(&mut self.ctx);
                modrm.set_rm8(&mut self.ctx, !value);
            }
            3 => {
                let value = modrm.get_rm8(&mut self.ctx);
                let result = alu::neg8(&mut self.ctx.state.flags, value);
                modrm.set_rm8(&mut self.ctx, result);
            }
            4 | 5 => {
                let value = modrm.get_rm8(&mut self.ctx);
                let state = self.state();
                let al = state.al();
                let result = if modrm.reg() == 4 {
                    alu::mul8(&mut state.flags, al, value)
                } else {
                    alu::imul8(&mut state.flags, al, value)
                };
                state.set_ax(result);
            }
            reg => {
                let divisor = modrm.get_rm8(&mut self.ctx);
                let dividend = self.ctx.state.ax();
                let (quotient, remainder) = if reg == 6 {
                    let q = alu::div8(dividend, divisor);
                    (q, dividend.checked_rem(u16::from(divisor)).map(|r| r as u8))
                } else {
                    let q = alu::idiv8(dividend, divisor);
                    let r = (dividend as i16).checked_rem(i16::from(divisor as i8));
                    (q, r.map(|r| r as u8))
                };
                match (quotient, remainder) {
                    (Some(q), Some(r)) => {
                        self.ctx.state.set_al(q);
                        self.ctx.state.set_ah(r);
                    }
                    _ => self.divide_error()?,
                }
            }
        }
        Ok(())
    }

    fn group3_16(&mut self, modrm: ModRm) -> Result<()> {
        match modrm.reg() {
            0 | 1 => {
                let imm = self.ctx.next_u16();
                let value = modrm.get_rm16(&mut self.ctx);
                alu::test16(&mut self.ctx.state.flags, value, imm);
            }
            2 => {
                let value = modrm.get_rm16(&mut self.ctx);
                modrm.set_rm16(&mut self.ctx, !value);
            }
            3 => {
                let value = modrm.get_rm16(&mut self.ctx);
                let result = alu::neg16(&mut self.ctx.state.flags, value);
                modrm.set_rm16(&mut self.ctx, result);
            }
            4 | 5 => {
                let value = modrm.get_rm16(&mut self.ctx);
                let state = self.state();
                let ax = state.ax();
                let result = if modrm.reg() == 4 {
                    alu::mul16(&mut state.flags, ax, value)
                } else {
                    alu::imul16(&mut state.flags, ax, value)
                };
                state.set_ax(result as u16);
                state.set_dx((result >> 16) as u16);
            }
            reg => {
                let divisor = modrm.get_rm16(&mut self.ctx);
                let state = &*self.ctx.state;
                let dividend = (u32::from(state.dx()) << 16) | u32::from(state.ax());
                let (quotient, remainder) = if reg == 6 {
                    let q = alu::div16(dividend, divisor);
                    (q, dividend.checked_rem(u32::from(divisor)).map(|r| r as u16))
                } else {
                    let q = alu::idiv16(dividend, divisor);
                    let r = (dividend as i32).checked_rem(i32::from(divisor as i16));
                    (q, r.map(|r| r as u16))
                };
                match (quotient, remainder) {
                    (Some(q), Some(r)) => {
                        self.ctx.state.set_ax(q);
                        self.ctx.state.set_dx(r);
                    }
                    _ => self.divide_error()?,
                }
            }
        }
        Ok(())
    }

    /// `FE /0` and `FE /1`, plus the callback encoding `FE 38 <index:u16>`.
    fn group4(&mut self, opcode: u8) -> Result<()> {
        let modrm = ModRm::read(&mut self.ctx);
        match modrm.reg() {
            0 => {
                let value = modrm.get_rm8(&mut self.ctx);
                let result = alu::inc8(&mut self.ctx.state.flags, value);
                modrm.set_rm8(&mut self.ctx, result);
            }
            1 => {
                let value = modrm.get_rm8(&mut self.ctx);
                let result = alu::dec8(&mut self.ctx.state.flags, value);
                modrm.set_rm8(&mut self.ctx, result);
            }
            7 => {
                let index = self.ctx.next_u16();
                self.callbacks.run(index, &mut self.ctx)?;
            }
            reg => return Err(self.invalid_group_index(opcode, reg)),
        }
        Ok(())
    }

    fn group5(&mut self, opcode: u8) -> Result<()> {
        let modrm = ModRm::read(&mut self.ctx);
        match modrm.reg() {
            0 => {
                let value = modrm.get_rm16(&mut self.ctx);
                let result = alu::inc16(&mut self.ctx.state.flags, value);
                modrm.set_rm16(&mut self.ctx, result);
            }
            1 => {
                let value = modrm.get_rm16(&mut self.ctx);
                let result = alu::dec16(&mut self.ctx.state.flags, value);
                modrm.set_rm16(&mut self.ctx, result);
            }
            2 => {
                let target = modrm.get_rm16(&mut self.ctx);
                self.call_near(target)?;
            }
            3 => {
                let pointer = modrm.get_rm32(&mut self.ctx)?;
                self.call_far(far_pointer(pointer))?;
            }
            4 => {
                let target = modrm.get_rm16(&mut self.ctx);
                self.ctx.state.set_ip(target);
            }
            5 => {
                let pointer = modrm.get_rm32(&mut self.ctx)?;
                self.ctx.state.set_ip_address(far_pointer(pointer));
            }
            6 => {
                let value = modrm.get_rm16(&mut self.ctx);
                self.ctx.push16(value);
            }
            reg => return Err(self.invalid_group_index(opcode, reg)),
        }
        Ok(())
    }

    fn condition(&self, code: u8) -> bool {
        let flags = &self.ctx.state.flags;
        let holds = match code >> 1 {
            0 => flags.overflow(),
            1 => flags.carry(),
            2 => flags.zero(),
            3 => flags.carry() || flags.zero(),
            4 => flags.sign(),
            5 => flags.get(Flag::PARITY),
            6 => flags.sign() != flags.overflow(),
            _ => flags.zero() || flags.sign() != flags.overflow(),
        };
        holds != (code & 1 == 1)
    }

    /// `LOOPNZ`, `LOOPZ`, `LOOP`, `JCXZ`.
    fn loop_condition(&mut self, opcode: u8) -> bool {
        let state = self.state();
        if opcode == 0xE3 {
            return state.cx() == 0;
        }
        let cx = state.cx().wrapping_sub(1);
        state.set_cx(cx);
        match opcode {
            0xE0 => cx != 0 && !state.flags.zero(),
            0xE1 => cx != 0 && state.flags.zero(),
            _ => cx != 0,
        }
    }

    fn jump_relative(&mut self, displacement: u16) {
        self.ctx.state.advance_ip(displacement);
    }

    fn call_near(&mut self, target: u16) -> Result<()> {
        let return_address = self.ctx.state.ip_address();
        self.ctx.push16(return_address.offset());
        self.ctx.state.set_ip(target);
        let entry = self.ctx.state.ip_address();
        self.functions
            .call(&mut self.ctx, CallType::Near, entry, Some(return_address))
    }

    fn call_far(&mut self, target: SegmentedAddress) -> Result<()> {
        let return_address = self.ctx.state.ip_address();
        stack::push_far(self.ctx.state, self.ctx.memory, return_address);
        self.ctx.state.set_ip_address(target);
        self.functions
            .call(&mut self.ctx, CallType::Far, target, Some(return_address))
    }

    fn software_interrupt(&mut self, vector: u8) -> Result<()> {
        let return_address = self.ctx.state.ip_address();
        self.interrupt(vector, Some(return_address), true)
    }

    /// Interrupt 0. The pushed return address is the next instruction, as on
    /// the 8086.
    fn divide_error(&mut self) -> Result<()> {
        self.software_interrupt(DIVIDE_ERROR_VECTOR)
    }

    fn interrupt(
        &mut self,
        vector: u8,
        expected_return: Option<SegmentedAddress>,
        record_return: bool,
    ) -> Result<()> {
        let state = &mut *self.ctx.state;
        let return_address = state.ip_address();
        let flags = state.flags.value();
        stack::push16(state, self.ctx.memory, flags);
        stack::push_far(state, self.ctx.memory, return_address);
        state.flags.set(Flag::INTERRUPT, false);
        state.flags.set(Flag::TRAP, false);

        let slot = u32::from(vector) * 4;
        let handler = SegmentedAddress::new(
            self.ctx.memory.read_u16(slot + 2),
            self.ctx.memory.read_u16(slot),
        );
        state.set_ip_address(handler);
        self.functions
            .icall(&mut self.ctx, vector, expected_return, record_return)
    }

    fn pusha(&mut self) {
        let sp = self.ctx.state.sp();
        for index in [AX, CX, DX, BX, SP, BP, SI, DI] {
            let value = if index == SP {
                sp
            } else {
                self.ctx.state.registers.read(index)
            };
            self.ctx.push16(value);
        }
    }

    fn popa(&mut self) {
        for index in [DI, SI, BP, SP, BX, DX, CX, AX] {
            let value = self.ctx.pop16();
            if index != SP {
                self.ctx.state.registers.write(index, value);
            }
        }
    }

    fn enter(&mut self, size: u16, level: u8) {
        let level = level & 0x1F;
        let bp = self.ctx.state.bp();
        self.ctx.push16(bp);
        let frame = self.ctx.state.sp();
        if level > 0 {
            let mut bp = bp;
            for _ in 1..level {
                bp = bp.wrapping_sub(2);
                let value = self
                    .ctx
                    .memory
                    .read_u16(physical(self.ctx.state.ss(), bp));
                self.ctx.push16(value);
            }
            self.ctx.push16(frame);
        }
        let state = self.state();
        state.set_bp(frame);
        state.set_sp(state.sp().wrapping_sub(size));
    }

    /// `MOV AL/AX, [moffs]` and the reverse.
    fn move_direct(&mut self, opcode: u8) {
        let offset = self.ctx.next_u16();
        let segment_index = self.ctx.state.segment_override().unwrap_or(DS);
        let segment = self.ctx.state.segments.read(segment_index);
        let address = physical(segment, offset);
        let (operation, size) = match opcode {
            0xA0 => (ValueOperation::Read, OperandSize::Byte8),
            0xA1 => (ValueOperation::Read, OperandSize::Word16),
            0xA2 => (ValueOperation::Write, OperandSize::Byte8),
            _ => (ValueOperation::Write, OperandSize::Word16),
        };
        self.ctx
            .recorder
            .set_current_value(segment_index, segment, offset);
        self.ctx.recorder.set_current_operation(operation, size);

        match opcode {
            0xA0 => {
                let value = self.ctx.memory.read_u8(address);
                self.ctx.state.set_al(value);
            }
            0xA1 => {
                let value = self.ctx.memory.read_u16(address);
                self.ctx.state.set_ax(value);
            }
            0xA2 => self.ctx.memory.write_u8(address, self.ctx.state.al()),
            _ => self.ctx.memory.write_u16(address, self.ctx.state.ax()),
        }
    }

    /// MOVS CMPS STOS LODS SCAS, honoring REP/REPE/REPNE.
    fn string_instruction(&mut self, opcode: u8) {
        let Some(continue_while_zero) = self.ctx.state.continue_zero_flag_value() else {
            self.string_iteration(opcode);
            return;
        };
        let compares = matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF);
        while self.ctx.state.cx() != 0 {
            self.string_iteration(opcode);
            let cx = self.ctx.state.cx().wrapping_sub(1);
            self.ctx.state.set_cx(cx);
            if compares && self.ctx.state.flags.zero() != continue_while_zero {
                break;
            }
        }
    }

    fn string_iteration(&mut self, opcode: u8) {
        let word = opcode & 1 == 1;
        let step: u16 = if word { 2 } else { 1 };
        let delta = if self.ctx.state.flags.direction() {
            step.wrapping_neg()
        } else {
            step
        };
        let state = &*self.ctx.state;
        let source = state.data_physical(DS, state.si());
        let destination = physical(state.es(), state.di());
        let memory = &mut *self.ctx.memory;

        let (advance_si, advance_di) = match opcode & !1 {
            0xA4 => {
                if word {
                    memory.write_u16(destination, memory.read_u16(source));
                } else {
                    memory.write_u8(destination, memory.read_u8(source));
                }
                (true, true)
            }
            0xA6 => {
                let flags = &mut self.ctx.state.flags;
                if word {
                    alu::cmp16(flags, memory.read_u16(source), memory.read_u16(destination));
                } else {
                    alu::cmp8(flags, memory.read_u8(source), memory.read_u8(destination));
                }
                (true, true)
            }
            0xAA => {
                if word {
                    memory.write_u16(destination, state.ax());
                } else {
                    memory.write_u8(destination, state.al());
                }
                (false, true)
            }
            0xAC => {
                if word {
                    let value = memory.read_u16(source);
                    self.ctx.state.set_ax(value);
                } else {
                    let value = memory.read_u8(source);
                    self.ctx.state.set_al(value);
                }
                (true, false)
            }
            _ => {
                let (ax, al) = (state.ax(), state.al());
                let flags = &mut self.ctx.state.flags;
                if word {
                    alu::cmp16(flags, ax, memory.read_u16(destination));
                } else {
                    alu::cmp8(flags, al, memory.read_u8(destination));
                }
                (false, true)
            }
        };

        let state = self.state();
        if advance_si {
            state.set_si(state.si().wrapping_add(delta));
        }
        if advance_di {
            state.set_di(state.di().wrapping_add(delta));
        }
    }
}

/// Splits a `segment:offset` pointer read as one dword, offset in the low word.
fn far_pointer(pointer: u32) -> SegmentedAddress {
    SegmentedAddress::new((pointer >> 16) as u16, pointer as u16)
}
