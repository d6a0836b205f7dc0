//! Dynamic function-call tracking.
//!
//! Every `CALL`, `INT` and return the interpreter executes goes through
//! [`FunctionHandler`]. With debug mode on it keeps a shadow call stack and
//! learns, per entry point, who calls it and where it returns. It also runs
//! native overrides in place of guest functions when code override is
//! enabled.
//!
//! A return whose target differs from what the matching call pushed is
//! "unaligned": the guest swapped its return address or used `RET` as a
//! jump. Those are recorded separately and the frame stays on the shadow
//! stack, so tracking survives such tricks.

mod information;
mod overrides;

use std::collections::BTreeMap;

use dosre_cpu::{stack, CpuContext, ExecutionState, Result};
use dosre_mem::{Memory, SegmentedAddress};
use tracing::{debug, info, warn};

pub use information::{
    CallType, FunctionCall, FunctionInformation, FunctionReturn, FunctionSummary, ReturnSummary,
    ReturnTargets,
};
pub use overrides::{OverrideFn, OverrideRegistry, OverrideSupplier, ReturnAction};

pub const UNKNOWN_FUNCTION_NAME: &str = "unknown";

#[derive(Debug, Default)]
pub struct FunctionHandler {
    function_informations: BTreeMap<SegmentedAddress, FunctionInformation>,
    call_stack: Vec<FunctionCall>,
    debug_mode: bool,
    use_code_override: bool,
}

impl FunctionHandler {
    pub fn new(debug_mode: bool, use_code_override: bool) -> Self {
        Self {
            debug_mode,
            use_code_override,
            ..Self::default()
        }
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, debug_mode: bool) {
        self.debug_mode = debug_mode;
    }

    pub fn is_code_override_enabled(&self) -> bool {
        self.use_code_override
    }

    pub fn set_code_override(&mut self, enabled: bool) {
        self.use_code_override = enabled;
    }

    /// Merges names and overrides from a supplier. Entries already present
    /// keep their statistics.
    pub fn add_function_informations(
        &mut self,
        informations: BTreeMap<SegmentedAddress, FunctionInformation>,
    ) {
        for (address, info) in informations {
            match self.function_informations.get_mut(&address) {
                Some(existing) => existing.merge(info),
                None => {
                    self.function_informations.insert(address, info);
                }
            }
        }
    }

    pub fn function_information(&self, address: SegmentedAddress) -> Option<&FunctionInformation> {
        self.function_informations.get(&address)
    }

    pub fn function_informations(&self) -> &BTreeMap<SegmentedAddress, FunctionInformation> {
        &self.function_informations
    }

    /// Live shadow stack, outermost frame first.
    pub fn call_stack(&self) -> &[FunctionCall] {
        &self.call_stack
    }

    pub fn current_call(&self) -> Option<&FunctionCall> {
        self.call_stack.last()
    }

    /// Tracks a `CALL` (or the machine root) to `entry`.
    ///
    /// The return information must already be on the guest stack and CS:IP
    /// must point at `entry`. If the function has an override it runs now and
    /// its return action is applied before this returns.
    pub fn call(
        &mut self,
        ctx: &mut CpuContext<'_>,
        kind: CallType,
        entry: SegmentedAddress,
        expected_return: Option<SegmentedAddress>,
    ) -> Result<()> {
        self.call_named(ctx, kind, entry, expected_return, true, || {
            UNKNOWN_FUNCTION_NAME.to_owned()
        })
    }

    /// Tracks an interrupt through `vector`. CS:IP must already point at the
    /// handler the interrupt vector table holds.
    ///
    /// External interrupts pass no expected return and `record_return =
    /// false`: where they land says nothing about the handler.
    pub fn icall(
        &mut self,
        ctx: &mut CpuContext<'_>,
        vector: u8,
        expected_return: Option<SegmentedAddress>,
        record_return: bool,
    ) -> Result<()> {
        let entry = ctx.state.ip_address();
        self.call_named(
            ctx,
            CallType::Interrupt,
            entry,
            expected_return,
            record_return,
            || format!("interrupt_handler_{vector:02X}"),
        )
    }

    pub fn call_named(
        &mut self,
        ctx: &mut CpuContext<'_>,
        kind: CallType,
        entry: SegmentedAddress,
        expected_return: Option<SegmentedAddress>,
        record_return: bool,
        name: impl FnOnce() -> String,
    ) -> Result<()> {
        let caller = self.call_stack.last().map(|frame| frame.entry);
        let info = self
            .function_informations
            .entry(entry)
            .or_insert_with(|| FunctionInformation::new(entry, name()));

        if self.debug_mode {
            self.call_stack.push(FunctionCall {
                kind,
                entry,
                expected_return,
                stack_at_call: ctx.state.stack_address(),
                record_return,
            });
            info.enter(caller);
        }

        if !self.use_code_override || !info.has_override() {
            return Ok(());
        }
        let qualified = info.qualified_name();
        let Some(override_fn) = info.override_fn_mut() else {
            return Ok(());
        };
        debug!(function = %qualified, ?kind, "running override");
        let action = override_fn(ctx)?;
        if matches!(action, ReturnAction::Jump(_))
            && self.call_stack.last().is_some_and(|frame| frame.entry == entry)
        {
            // A tail jump never returns through this frame.
            self.call_stack.pop();
        }
        self.apply(ctx, action);
        Ok(())
    }

    /// Executes the stack cleanup an override asked for.
    pub fn apply(&mut self, ctx: &mut CpuContext<'_>, action: ReturnAction) {
        match action {
            ReturnAction::NearRet { pop } => self.near_ret(ctx, pop),
            ReturnAction::FarRet { pop } => self.far_ret(ctx, pop),
            ReturnAction::InterruptRet => self.interrupt_ret(ctx),
            ReturnAction::Jump(target) => ctx.state.set_ip_address(target),
        }
    }

    /// `RET imm16` including tracking.
    pub fn near_ret(&mut self, ctx: &mut CpuContext<'_>, pop: u16) {
        self.ret(ctx.state, ctx.memory, CallType::Near);
        let ip = stack::pop16(ctx.state, ctx.memory);
        ctx.state.set_ip(ip);
        ctx.state.set_sp(ctx.state.sp().wrapping_add(pop));
    }

    /// `RETF imm16` including tracking.
    pub fn far_ret(&mut self, ctx: &mut CpuContext<'_>, pop: u16) {
        self.ret(ctx.state, ctx.memory, CallType::Far);
        let target = stack::pop_far(ctx.state, ctx.memory);
        ctx.state.set_ip_address(target);
        ctx.state.set_sp(ctx.state.sp().wrapping_add(pop));
    }

    /// `IRET` including tracking.
    pub fn interrupt_ret(&mut self, ctx: &mut CpuContext<'_>) {
        self.ret(ctx.state, ctx.memory, CallType::Interrupt);
        let target = stack::pop_far(ctx.state, ctx.memory);
        ctx.state.set_ip_address(target);
        let flags = stack::pop16(ctx.state, ctx.memory);
        ctx.state.flags.set_value(flags);
    }

    fn actual_return(
        state: &ExecutionState,
        memory: &dyn Memory,
        kind: CallType,
    ) -> Option<SegmentedAddress> {
        match kind {
            CallType::Near => Some(SegmentedAddress::new(
                state.cs(),
                stack::inspect16(state, memory, 0),
            )),
            CallType::Far | CallType::Interrupt => Some(stack::inspect_far(state, memory, 0)),
            CallType::Machine => None,
        }
    }

    /// Checks a return against the shadow stack before the guest pops its
    /// return address.
    ///
    /// Returns `true` when the return lands where the matching call said it
    /// would (or when tracking is off). An unaligned return leaves the frame
    /// on the shadow stack and returns `false`.
    pub fn ret(&mut self, state: &ExecutionState, memory: &dyn Memory, kind: CallType) -> bool {
        if !self.debug_mode {
            return true;
        }
        let Some(frame) = self.call_stack.pop() else {
            warn!(
                ?kind,
                at = %state.current_instruction_address(),
                "return with an empty call stack"
            );
            return false;
        };

        let actual = Self::actual_return(state, memory, kind);
        let aligned = match frame.expected_return {
            None => true,
            Some(expected) => actual == Some(expected),
        };

        if !aligned {
            Self::log_unaligned(state, memory, &frame, actual);
            self.call_stack.push(frame);
        }

        if frame.record_return {
            if let Some(info) = self.function_informations.get_mut(&frame.entry) {
                if !info.has_override() {
                    let ret = FunctionReturn {
                        kind,
                        address: state.current_instruction_address(),
                    };
                    info.add_return(ret, actual, aligned);
                }
            }
        }
        aligned
    }

    fn log_unaligned(
        state: &ExecutionState,
        memory: &dyn Memory,
        frame: &FunctionCall,
        actual: Option<SegmentedAddress>,
    ) {
        let call_sp = frame.stack_at_call.physical();
        let original = match frame.kind {
            CallType::Near => Some(SegmentedAddress::new(
                frame.expected_return.map_or(state.cs(), |e| e.segment()),
                memory.peek_u16(call_sp),
            )),
            CallType::Far | CallType::Interrupt => Some(SegmentedAddress::new(
                memory.peek_u16(call_sp + 2),
                memory.peek_u16(call_sp),
            )),
            CallType::Machine => None,
        };
        let sp_moved = frame.stack_at_call != state.stack_address();
        info!(
            entry = %frame.entry,
            expected = ?frame.expected_return,
            actual = ?actual,
            call_stack = %frame.stack_at_call,
            current_stack = %state.stack_address(),
            sp_moved,
            original_return_slot = ?original,
            "unaligned return"
        );
    }

    /// Innermost frame first.
    pub fn dump_call_stack(&self) -> String {
        let mut out = String::new();
        for frame in self.call_stack.iter().rev() {
            let name = self
                .function_informations
                .get(&frame.entry)
                .map(FunctionInformation::qualified_name)
                .unwrap_or_else(|| {
                    format!(
                        "{UNKNOWN_FUNCTION_NAME}_{:04X}_{:04X}_{:05X}",
                        frame.entry.segment(),
                        frame.entry.offset(),
                        frame.entry.physical()
                    )
                });
            let target = frame
                .expected_return
                .map_or_else(|| "none".to_owned(), |addr| addr.to_string());
            out.push_str(&format!(" - {name} expected to return to {target}\n"));
        }
        out
    }

    pub fn report(&self) -> Vec<FunctionSummary> {
        self.function_informations
            .values()
            .map(FunctionSummary::from)
            .collect()
    }

    pub fn export_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&self.report())
    }
}
