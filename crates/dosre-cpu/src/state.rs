use std::fmt;

use dosre_mem::{physical, SegmentedAddress};

use crate::flags::Flags;
use crate::registers::{
    GeneralRegisters, SegmentRegisters, AX, BP, BX, CS, CX, DI, DS, DX, ES, FS, GS, SI, SP, SS,
};

macro_rules! word_registers {
    ($file:ident: $($get:ident / $set:ident = $index:expr),+ $(,)?) => {
        $(
            #[inline]
            pub fn $get(&self) -> u16 {
                self.$file.read($index)
            }

            #[inline]
            pub fn $set(&mut self, value: u16) {
                self.$file.write($index, value);
            }
        )+
    };
}

macro_rules! byte_registers {
    ($($get:ident / $set:ident = $index:expr),+ $(,)?) => {
        $(
            #[inline]
            pub fn $get(&self) -> u8 {
                self.registers.read8($index)
            }

            #[inline]
            pub fn $set(&mut self, value: u8) {
                self.registers.write8($index, value);
            }
        )+
    };
}

/// Complete real-mode CPU state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionState {
    pub registers: GeneralRegisters,
    pub segments: SegmentRegisters,
    pub flags: Flags,
    ip: u16,
    cycles: u64,
    /// CS:IP of the instruction being executed.
    current_instruction: SegmentedAddress,
    segment_override: Option<usize>,
    continue_zero_flag_value: Option<bool>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ExecutionState {
    pub fn new(dos_compatible_flags: bool) -> Self {
        Self {
            registers: GeneralRegisters::new(),
            segments: SegmentRegisters::new(),
            flags: Flags::new(dos_compatible_flags),
            ip: 0,
            cycles: 0,
            current_instruction: SegmentedAddress::new(0, 0),
            segment_override: None,
            continue_zero_flag_value: None,
        }
    }

    word_registers!(registers:
        ax / set_ax = AX,
        cx / set_cx = CX,
        dx / set_dx = DX,
        bx / set_bx = BX,
        sp / set_sp = SP,
        bp / set_bp = BP,
        si / set_si = SI,
        di / set_di = DI,
    );

    byte_registers!(
        al / set_al = 0,
        cl / set_cl = 1,
        dl / set_dl = 2,
        bl / set_bl = 3,
        ah / set_ah = 4,
        ch / set_ch = 5,
        dh / set_dh = 6,
        bh / set_bh = 7,
    );

    word_registers!(segments:
        es / set_es = ES,
        cs / set_cs = CS,
        ss / set_ss = SS,
        ds / set_ds = DS,
        fs / set_fs = FS,
        gs / set_gs = GS,
    );

    #[inline]
    pub fn ip(&self) -> u16 {
        self.ip
    }

    #[inline]
    pub fn set_ip(&mut self, ip: u16) {
        self.ip = ip;
    }

    #[inline]
    pub fn advance_ip(&mut self, delta: u16) {
        self.ip = self.ip.wrapping_add(delta);
    }

    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[inline]
    pub fn increment_cycles(&mut self) {
        self.cycles += 1;
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.cycles += cycles;
    }

    pub fn ip_address(&self) -> SegmentedAddress {
        SegmentedAddress::new(self.cs(), self.ip)
    }

    pub fn set_ip_address(&mut self, address: SegmentedAddress) {
        self.set_cs(address.segment());
        self.ip = address.offset();
    }

    pub fn ip_physical(&self) -> u32 {
        physical(self.cs(), self.ip)
    }

    pub fn stack_address(&self) -> SegmentedAddress {
        SegmentedAddress::new(self.ss(), self.sp())
    }

    pub fn stack_physical(&self) -> u32 {
        physical(self.ss(), self.sp())
    }

    /// Address of the instruction currently executing, as recorded by
    /// [`ExecutionState::start_instruction`].
    pub fn current_instruction_address(&self) -> SegmentedAddress {
        self.current_instruction
    }

    /// Resets per-instruction prefix state and records the instruction start.
    pub fn start_instruction(&mut self) {
        self.current_instruction = self.ip_address();
        self.clear_prefixes();
    }

    pub fn clear_prefixes(&mut self) {
        self.segment_override = None;
        self.continue_zero_flag_value = None;
    }

    #[inline]
    pub fn segment_override(&self) -> Option<usize> {
        self.segment_override
    }

    pub fn set_segment_override(&mut self, segment_index: Option<usize>) {
        self.segment_override = segment_index;
    }

    /// Zero flag value a `REPE`/`REPNE` prefixed compare must keep producing for
    /// the repetition to continue.
    #[inline]
    pub fn continue_zero_flag_value(&self) -> Option<bool> {
        self.continue_zero_flag_value
    }

    pub fn set_continue_zero_flag_value(&mut self, value: Option<bool>) {
        self.continue_zero_flag_value = value;
    }

    /// Physical address of `offset` in the override segment if one is active,
    /// otherwise in `default_segment`.
    pub fn data_physical(&self, default_segment: usize, offset: u16) -> u32 {
        let index = self.segment_override.unwrap_or(default_segment);
        physical(self.segments.read(index), offset)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SI={:04X} DI={:04X} BP={:04X} SP={:04X} \
             DS={:04X} ES={:04X} FS={:04X} GS={:04X} SS={:04X} CS:IP={} \
             flags={:04X} [{}] cycles={}",
            self.ax(),
            self.bx(),
            self.cx(),
            self.dx(),
            self.si(),
            self.di(),
            self.bp(),
            self.sp(),
            self.ds(),
            self.es(),
            self.fs(),
            self.gs(),
            self.ss(),
            self.ip_address(),
            self.flags.value(),
            self.flags,
            self.cycles,
        )
    }
}
