//! The SS:SP stack. SP arithmetic wraps within the 64 KiB stack segment.

use dosre_mem::{physical, Memory, SegmentedAddress};

use crate::state::ExecutionState;

#[inline]
fn slot(state: &ExecutionState, offset: u16) -> u32 {
    physical(state.ss(), state.sp().wrapping_add(offset))
}

pub fn push16(state: &mut ExecutionState, memory: &mut dyn Memory, value: u16) {
    let sp = state.sp().wrapping_sub(2);
    state.set_sp(sp);
    memory.write_u16(physical(state.ss(), sp), value);
}

pub fn pop16(state: &mut ExecutionState, memory: &dyn Memory) -> u16 {
    let value = memory.read_u16(slot(state, 0));
    state.set_sp(state.sp().wrapping_add(2));
    value
}

/// Pushes a far pointer the way `CALL FAR` does: CS first, then IP.
pub fn push_far(state: &mut ExecutionState, memory: &mut dyn Memory, address: SegmentedAddress) {
    push16(state, memory, address.segment());
    push16(state, memory, address.offset());
}

/// Pops IP then CS.
pub fn pop_far(state: &mut ExecutionState, memory: &dyn Memory) -> SegmentedAddress {
    let offset = pop16(state, memory);
    let segment = pop16(state, memory);
    SegmentedAddress::new(segment, offset)
}

/// Reads SS:(SP+offset) without moving SP.
pub fn peek16(state: &ExecutionState, memory: &dyn Memory, offset: u16) -> u16 {
    memory.read_u16(slot(state, offset))
}

/// Writes SS:(SP+offset) without moving SP.
pub fn poke16(state: &ExecutionState, memory: &mut dyn Memory, offset: u16, value: u16) {
    memory.write_u16(slot(state, offset), value);
}

/// Far pointer stored at SS:(SP+offset), IP first.
pub fn peek_far(state: &ExecutionState, memory: &dyn Memory, offset: u16) -> SegmentedAddress {
    let ip = peek16(state, memory, offset);
    let cs = peek16(state, memory, offset.wrapping_add(2));
    SegmentedAddress::new(cs, ip)
}

/// [`peek16`] for inspection by tooling: memory breakpoints do not see it.
pub fn inspect16(state: &ExecutionState, memory: &dyn Memory, offset: u16) -> u16 {
    memory.peek_u16(slot(state, offset))
}

/// [`peek_far`] without notifying memory breakpoints.
pub fn inspect_far(state: &ExecutionState, memory: &dyn Memory, offset: u16) -> SegmentedAddress {
    let ip = inspect16(state, memory, offset);
    let cs = inspect16(state, memory, offset.wrapping_add(2));
    SegmentedAddress::new(cs, ip)
}
