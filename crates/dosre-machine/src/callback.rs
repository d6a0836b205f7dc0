//! Native handlers reachable from guest code.
//!
//! Each callback owns a small index. Guest code reaches it through a five byte
//! trampoline `FE 38 <index:u16> CF` written into the callback segment: the
//! reserved `FE /7` encoding hands control to the dispatcher, and the trailing
//! `IRET` returns to the caller when the trampoline was entered through an
//! interrupt vector.

use std::collections::BTreeMap;

use dosre_cpu::{CpuContext, CpuError, Result, UnhandledKind};
use dosre_mem::{physical, Memory, SegmentedAddress};
use tracing::debug;

pub const CALLBACK_PREFIX: [u8; 2] = [0xFE, 0x38];
pub const DEFAULT_CALLBACK_SEGMENT: u16 = 0xF000;
pub const TRAMPOLINE_LEN: u16 = 5;
const IRET: u8 = 0xCF;

pub trait Callback: Send {
    fn index(&self) -> u16;
    fn run(&mut self, ctx: &mut CpuContext<'_>) -> Result<()>;
}

/// Adapts a closure into a [`Callback`].
pub struct FnCallback<F> {
    index: u16,
    run: F,
}

impl<F> FnCallback<F>
where
    F: FnMut(&mut CpuContext<'_>) -> Result<()> + Send,
{
    pub fn new(index: u16, run: F) -> Self {
        Self { index, run }
    }
}

impl<F> Callback for FnCallback<F>
where
    F: FnMut(&mut CpuContext<'_>) -> Result<()> + Send,
{
    fn index(&self) -> u16 {
        self.index
    }

    fn run(&mut self, ctx: &mut CpuContext<'_>) -> Result<()> {
        (self.run)(ctx)
    }
}

pub struct CallbackDispatcher {
    callbacks: BTreeMap<u16, Box<dyn Callback>>,
    segment: u16,
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CALLBACK_SEGMENT)
    }
}

impl CallbackDispatcher {
    pub fn new(segment: u16) -> Self {
        Self {
            callbacks: BTreeMap::new(),
            segment,
        }
    }

    pub fn segment(&self) -> u16 {
        self.segment
    }

    /// Registers `callback` under its own index, returning the handler it
    /// replaced.
    pub fn add_callback(&mut self, callback: Box<dyn Callback>) -> Option<Box<dyn Callback>> {
        self.callbacks.insert(callback.index(), callback)
    }

    pub fn add_fn<F>(&mut self, index: u16, run: F) -> Option<Box<dyn Callback>>
    where
        F: FnMut(&mut CpuContext<'_>) -> Result<()> + Send + 'static,
    {
        self.add_callback(Box::new(FnCallback::new(index, run)))
    }

    pub fn remove(&mut self, index: u16) -> Option<Box<dyn Callback>> {
        self.callbacks.remove(&index)
    }

    pub fn contains(&self, index: u16) -> bool {
        self.callbacks.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn run(&mut self, index: u16, ctx: &mut CpuContext<'_>) -> Result<()> {
        let Some(callback) = self.callbacks.get_mut(&index) else {
            return Err(CpuError::unhandled(ctx.state, UnhandledKind::Callback, index));
        };
        debug!(index, at = %ctx.state.current_instruction_address(), "running callback");
        callback.run(ctx)
    }

    /// Writes one trampoline per callback, in ascending index order, and points
    /// the matching interrupt vector at it. Indices above 0xFF get a trampoline
    /// but no vector.
    ///
    /// Returns the trampoline address of every callback.
    pub fn install_all_callbacks_in_interrupt_table(
        &self,
        memory: &mut dyn Memory,
    ) -> Vec<(u16, SegmentedAddress)> {
        let mut installed = Vec::with_capacity(self.callbacks.len());
        let mut offset: u16 = 0;
        for &index in self.callbacks.keys() {
            let base = physical(self.segment, offset);
            memory.write_u8(base, CALLBACK_PREFIX[0]);
            memory.write_u8(base + 1, CALLBACK_PREFIX[1]);
            memory.write_u16(base + 2, index);
            memory.write_u8(base + 4, IRET);

            let trampoline = SegmentedAddress::new(self.segment, offset);
            if index <= 0xFF {
                let vector = u32::from(index) * 4;
                memory.write_u16(vector, offset);
                memory.write_u16(vector + 2, self.segment);
            }
            debug!(index, %trampoline, "installed callback");
            installed.push((index, trampoline));
            offset = offset.wrapping_add(TRAMPOLINE_LEN);
        }
        installed
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("segment", &format_args!("{:#06x}", self.segment))
            .field("indices", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}
