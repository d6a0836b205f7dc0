use dosre_cpu::{stack, CpuContext, ExecutionState, StaticAddressesRecorder};
use dosre_machine::{CallType, FunctionHandler, FunctionReturn};
use dosre_mem::{Memory, Ram, SegmentedAddress};

const CODE: u16 = 0x1000;

struct Fixture {
    state: ExecutionState,
    ram: Ram,
    recorder: StaticAddressesRecorder,
    functions: FunctionHandler,
}

impl Fixture {
    fn new(debug_mode: bool) -> Self {
        let mut state = ExecutionState::default();
        state.set_cs(CODE);
        state.set_ss(0x2000);
        state.set_sp(0x0100);
        Self {
            state,
            ram: Ram::new(0x40000),
            recorder: StaticAddressesRecorder::new(false),
            functions: FunctionHandler::new(debug_mode, true),
        }
    }

    /// What `CALL near` at `CODE:call_site` to `CODE:target` leaves behind.
    fn near_call(&mut self, call_site: u16, target: u16) {
        let return_offset = call_site + 3;
        stack::push16(&mut self.state, &mut self.ram, return_offset);
        self.state.set_ip(target);
        let mut ctx = CpuContext::new(&mut self.state, &mut self.ram, &mut self.recorder);
        self.functions
            .call(
                &mut ctx,
                CallType::Near,
                SegmentedAddress::new(CODE, target),
                Some(SegmentedAddress::new(CODE, return_offset)),
            )
            .unwrap();
    }

    /// Executes `RET` located at `CODE:at`.
    fn near_ret(&mut self, at: u16) {
        self.state.set_ip(at);
        self.state.start_instruction();
        self.state.advance_ip(1);
        let mut ctx = CpuContext::new(&mut self.state, &mut self.ram, &mut self.recorder);
        self.functions.near_ret(&mut ctx, 0);
    }
}

#[test]
fn aligned_near_return_is_recorded_and_pops_the_frame() {
    let mut fx = Fixture::new(true);
    fx.near_call(0x0000, 0x0100);
    assert_eq!(fx.functions.call_stack().len(), 1);

    fx.near_ret(0x0110);

    assert_eq!(fx.state.ip(), 0x0003);
    assert_eq!(fx.state.sp(), 0x0100);
    assert!(fx.functions.call_stack().is_empty());

    let info = fx
        .functions
        .function_information(SegmentedAddress::new(CODE, 0x0100))
        .unwrap();
    assert_eq!(info.called_count(), 1);
    let ret = FunctionReturn {
        kind: CallType::Near,
        address: SegmentedAddress::new(CODE, 0x0110),
    };
    let targets = &info.returns()[&ret];
    assert!(targets.contains(&SegmentedAddress::new(CODE, 0x0003)));
    assert!(info.unaligned_returns().is_empty());
}

#[test]
fn swapped_return_address_is_unaligned_and_keeps_the_frame() {
    let mut fx = Fixture::new(true);
    fx.near_call(0x0000, 0x0100);
    stack::poke16(&fx.state, &mut fx.ram, 0, 0x0777);

    let aligned = fx.functions.ret(&fx.state, &fx.ram, CallType::Near);
    assert!(!aligned);
    assert_eq!(fx.functions.call_stack().len(), 1);
    assert_eq!(
        fx.functions.current_call().unwrap().entry,
        SegmentedAddress::new(CODE, 0x0100)
    );

    let info = fx
        .functions
        .function_information(SegmentedAddress::new(CODE, 0x0100))
        .unwrap();
    assert!(info.returns().is_empty());
    let targets: Vec<_> = info.unaligned_returns().values().flatten().copied().collect();
    assert_eq!(targets, vec![SegmentedAddress::new(CODE, 0x0777)]);
}

#[test]
fn nested_calls_unwind_innermost_first() {
    let mut fx = Fixture::new(true);
    fx.near_call(0x0000, 0x0100);
    fx.near_call(0x0105, 0x0200);
    assert_eq!(fx.functions.call_stack().len(), 2);

    fx.near_ret(0x0210);
    assert_eq!(fx.state.ip(), 0x0108);
    assert_eq!(fx.functions.call_stack().len(), 1);

    fx.near_ret(0x0120);
    assert_eq!(fx.state.ip(), 0x0003);
    assert!(fx.functions.call_stack().is_empty());

    let inner = fx
        .functions
        .function_information(SegmentedAddress::new(CODE, 0x0200))
        .unwrap();
    assert!(inner.callers().contains(&SegmentedAddress::new(CODE, 0x0100)));
}

#[test]
fn return_with_empty_call_stack_is_not_aligned() {
    let mut fx = Fixture::new(true);
    assert!(!fx.functions.ret(&fx.state, &fx.ram, CallType::Near));
}

#[test]
fn tracking_off_accepts_every_return_and_learns_nothing() {
    let mut fx = Fixture::new(false);
    fx.near_call(0x0000, 0x0100);
    assert!(fx.functions.call_stack().is_empty());
    assert!(fx.functions.ret(&fx.state, &fx.ram, CallType::Near));

    let info = fx
        .functions
        .function_information(SegmentedAddress::new(CODE, 0x0100))
        .unwrap();
    assert_eq!(info.called_count(), 0);
}

#[test]
fn external_interrupt_frames_do_not_record_returns() {
    let mut fx = Fixture::new(true);
    // IVT entry 8 -> F000:1234.
    fx.ram.write_u16(8 * 4, 0x1234);
    fx.ram.write_u16(8 * 4 + 2, 0xF000);

    let interrupted = SegmentedAddress::new(CODE, 0x0042);
    stack::push16(&mut fx.state, &mut fx.ram, 0x0202);
    stack::push_far(&mut fx.state, &mut fx.ram, interrupted);
    fx.state.set_ip_address(SegmentedAddress::new(0xF000, 0x1234));
    {
        let mut ctx = CpuContext::new(&mut fx.state, &mut fx.ram, &mut fx.recorder);
        fx.functions.icall(&mut ctx, 8, None, false).unwrap();
    }
    assert_eq!(fx.functions.current_call().unwrap().kind, CallType::Interrupt);

    fx.state.set_ip(0x1240);
    fx.state.start_instruction();
    {
        let mut ctx = CpuContext::new(&mut fx.state, &mut fx.ram, &mut fx.recorder);
        fx.functions.interrupt_ret(&mut ctx);
    }

    assert_eq!(fx.state.ip_address(), interrupted);
    assert_eq!(fx.state.flags.value() & 0x0202, 0x0202);
    assert!(fx.functions.call_stack().is_empty());

    let handler = fx
        .functions
        .function_information(SegmentedAddress::new(0xF000, 0x1234))
        .unwrap();
    assert_eq!(handler.name(), "interrupt_handler_08");
    assert!(handler.returns().is_empty());
    assert!(handler.unaligned_returns().is_empty());
}

#[test]
fn call_stack_dump_lists_innermost_frame_first() {
    let mut fx = Fixture::new(true);
    fx.near_call(0x0000, 0x0100);
    fx.near_call(0x0105, 0x0200);

    let dump = fx.functions.dump_call_stack();
    assert_eq!(
        dump,
        " - unknown_1000_0200_10200 expected to return to 1000:0108\n \
         - unknown_1000_0100_10100 expected to return to 1000:0003\n"
    );
}

#[test]
fn report_serializes_every_function() {
    let mut fx = Fixture::new(true);
    fx.near_call(0x0000, 0x0100);
    fx.near_ret(0x0110);

    let report = fx.functions.report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].called_count, 1);
    assert_eq!(report[0].returns.len(), 1);

    let json: serde_json::Value =
        serde_json::from_slice(&fx.functions.export_json().unwrap()).unwrap();
    assert_eq!(json[0]["name"], "unknown");
    assert_eq!(json[0]["called_count"], 1);
    assert_eq!(json[0]["overridden"], false);
}
