//! Native replacements for guest functions.

use std::collections::BTreeMap;

use dosre_cpu::{CpuContext, Result};
use dosre_mem::SegmentedAddress;

use super::information::FunctionInformation;

/// How an override leaves the emulated stack once it has done its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnAction {
    /// `RET imm16`: pop IP, then discard `pop` bytes of arguments.
    NearRet { pop: u16 },
    /// `RETF imm16`.
    FarRet { pop: u16 },
    /// `IRET`.
    InterruptRet,
    /// Continue at an arbitrary address without touching the stack.
    Jump(SegmentedAddress),
}

impl ReturnAction {
    pub const NEAR_RET: ReturnAction = ReturnAction::NearRet { pop: 0 };
    pub const FAR_RET: ReturnAction = ReturnAction::FarRet { pop: 0 };
}

pub type OverrideFn = Box<dyn FnMut(&mut CpuContext<'_>) -> Result<ReturnAction> + Send>;

/// Source of named functions and overrides, consulted once before execution.
pub trait OverrideSupplier {
    fn generate_function_informations(
        &mut self,
        program_start_segment: u16,
    ) -> BTreeMap<SegmentedAddress, FunctionInformation>;
}

enum SegmentBase {
    Absolute(u16),
    /// Added to the program start segment at generation time.
    Relative(u16),
}

struct Definition {
    segment: SegmentBase,
    offset: u16,
    name: String,
    override_fn: Option<OverrideFn>,
}

/// Builder for an [`OverrideSupplier`].
///
/// ```ignore
/// let mut registry = OverrideRegistry::new();
/// registry
///     .define_function(0xF000, 0x0100, "print_string", None)
///     .define_relative(0x0010, 0x0042, "draw_sprite", Some(Box::new(draw_sprite)));
/// machine.add_override_supplier(&mut registry);
/// ```
#[derive(Default)]
pub struct OverrideRegistry {
    definitions: Vec<Definition>,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_function(
        &mut self,
        segment: u16,
        offset: u16,
        name: impl Into<String>,
        override_fn: Option<OverrideFn>,
    ) -> &mut Self {
        self.definitions.push(Definition {
            segment: SegmentBase::Absolute(segment),
            offset,
            name: name.into(),
            override_fn,
        });
        self
    }

    /// Like [`OverrideRegistry::define_function`] with `segment` counted from
    /// the segment the program was loaded at.
    pub fn define_relative(
        &mut self,
        segment: u16,
        offset: u16,
        name: impl Into<String>,
        override_fn: Option<OverrideFn>,
    ) -> &mut Self {
        self.definitions.push(Definition {
            segment: SegmentBase::Relative(segment),
            offset,
            name: name.into(),
            override_fn,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl OverrideSupplier for OverrideRegistry {
    fn generate_function_informations(
        &mut self,
        program_start_segment: u16,
    ) -> BTreeMap<SegmentedAddress, FunctionInformation> {
        let mut out = BTreeMap::new();
        for def in self.definitions.drain(..) {
            let segment = match def.segment {
                SegmentBase::Absolute(segment) => segment,
                SegmentBase::Relative(delta) => program_start_segment.wrapping_add(delta),
            };
            let address = SegmentedAddress::new(segment, def.offset);
            let info = match def.override_fn {
                Some(f) => FunctionInformation::with_override(address, def.name, f),
                None => FunctionInformation::new(address, def.name),
            };
            out.insert(address, info);
        }
        out
    }
}
