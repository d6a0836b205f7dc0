use dosre_mem::{SegmentedAddress, REAL_MODE_MEMORY_SIZE};

use crate::callback::DEFAULT_CALLBACK_SEGMENT;

/// Configuration for [`crate::Machine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Guest RAM size in bytes. Defaults to 1 MiB plus the high memory area.
    pub memory_size: usize,
    /// Enables the shadow call stack, function statistics and the static
    /// address ledger.
    pub debug_mode: bool,
    /// Runs registered overrides instead of the guest functions they replace.
    pub use_code_override: bool,
    /// Forces FLAGS bits 12-14 on, as DOS-era CPU detection expects.
    pub dos_compatible_flags: bool,
    /// Segment the callback trampolines are written into.
    pub callback_segment: u16,
    /// Turn an `IN`/`OUT` to a port without a handler into an error instead
    /// of a warning.
    pub fail_on_unhandled_port: bool,
    /// Segment the program image was loaded at. Relative override addresses
    /// are counted from here.
    pub program_start_segment: u16,
    /// Initial CS:IP.
    pub entry_point: SegmentedAddress,
    /// Initial SS:SP.
    pub initial_stack: SegmentedAddress,
    /// Stop once the cycle counter reaches this value.
    pub max_cycles: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: REAL_MODE_MEMORY_SIZE,
            debug_mode: false,
            use_code_override: true,
            dos_compatible_flags: false,
            callback_segment: DEFAULT_CALLBACK_SEGMENT,
            fail_on_unhandled_port: false,
            program_start_segment: 0x1000,
            entry_point: SegmentedAddress::new(0x1000, 0x0000),
            initial_stack: SegmentedAddress::new(0x2000, 0xFFFE),
            max_cycles: None,
        }
    }
}
