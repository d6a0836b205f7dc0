use std::sync::{Arc, Mutex};

use dosre_cpu::{CpuContext, CpuError, ExecutionState, StaticAddressesRecorder, UnhandledKind};
use dosre_machine::{
    CallType, CallbackDispatcher, FnCallback, FunctionReturn, Machine, MachineConfig, RunExit,
};
use dosre_mem::{Memory, Ram, SegmentedAddress};

#[test]
fn trampolines_are_laid_out_in_index_order() {
    let mut callbacks = CallbackDispatcher::new(0xF000);
    callbacks.add_fn(0x21, |_| Ok(()));
    callbacks.add_fn(0x10, |_| Ok(()));
    callbacks.add_fn(0x100, |_| Ok(()));

    let mut ram = Ram::new(0x11_0000);
    let installed = callbacks.install_all_callbacks_in_interrupt_table(&mut ram);
    assert_eq!(
        installed,
        vec![
            (0x10, SegmentedAddress::new(0xF000, 0)),
            (0x21, SegmentedAddress::new(0xF000, 5)),
            (0x100, SegmentedAddress::new(0xF000, 10)),
        ]
    );

    assert_eq!(ram.slice(0xF0000, 5), &[0xFE, 0x38, 0x10, 0x00, 0xCF]);
    assert_eq!(ram.slice(0xF0005, 5), &[0xFE, 0x38, 0x21, 0x00, 0xCF]);
    assert_eq!(ram.slice(0xF000A, 5), &[0xFE, 0x38, 0x00, 0x01, 0xCF]);

    assert_eq!(ram.read_u16(0x10 * 4), 0x0000);
    assert_eq!(ram.read_u16(0x10 * 4 + 2), 0xF000);
    assert_eq!(ram.read_u16(0x21 * 4), 0x0005);
    assert_eq!(ram.read_u16(0x21 * 4 + 2), 0xF000);
    // 0x100 has no vector, so nothing is written past the table.
    assert_eq!(ram.read_u32(0x400), 0);
}

#[test]
fn replacing_a_callback_returns_the_previous_one() {
    let mut callbacks = CallbackDispatcher::default();
    assert!(callbacks.add_fn(0x33, |_| Ok(())).is_none());
    assert!(callbacks.add_fn(0x33, |_| Ok(())).is_some());
    assert_eq!(callbacks.len(), 1);
    assert!(callbacks.remove(0x33).is_some());
    assert!(callbacks.is_empty());
}

#[test]
fn running_an_unregistered_index_is_unhandled() {
    let mut callbacks = CallbackDispatcher::default();
    let mut state = ExecutionState::default();
    let mut ram = Ram::new(0x1000);
    let mut recorder = StaticAddressesRecorder::new(false);
    let mut ctx = CpuContext::new(&mut state, &mut ram, &mut recorder);

    let err = callbacks.run(0x2F, &mut ctx).unwrap_err();
    assert!(matches!(
        err,
        CpuError::UnhandledOperation {
            kind: UnhandledKind::Callback,
            index: 0x2F,
            ..
        }
    ));
}

#[test]
fn callback_sees_and_changes_guest_state() {
    let mut callbacks = CallbackDispatcher::default();
    callbacks.add_fn(0x16, |ctx| {
        let ah = ctx.state.ah();
        ctx.state.set_ax(u16::from(ah) << 8 | 0x0D);
        Ok(())
    });

    let mut state = ExecutionState::default();
    state.set_ah(0x1C);
    let mut ram = Ram::new(0x1000);
    let mut recorder = StaticAddressesRecorder::new(false);
    let mut ctx = CpuContext::new(&mut state, &mut ram, &mut recorder);
    callbacks.run(0x16, &mut ctx).unwrap();
    assert_eq!(state.ax(), 0x1C0D);
}

#[test]
fn software_interrupt_runs_callback_through_its_trampoline() {
    let mut machine = Machine::new(MachineConfig {
        debug_mode: true,
        ..MachineConfig::default()
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    machine.add_callback(Box::new(FnCallback::new(0x21, move |ctx: &mut CpuContext<'_>| {
        sink.lock().unwrap().push(ctx.state.ah());
        ctx.state.set_al(0x42);
        Ok(())
    })));
    machine.install_callbacks();

    // mov ah, 0x30; int 0x21; hlt
    machine.load(0x10000, &[0xB4, 0x30, 0xCD, 0x21, 0xF4]).unwrap();
    let exit = machine.run().unwrap();

    assert!(matches!(exit, RunExit::Halted { .. }));
    assert_eq!(*seen.lock().unwrap(), vec![0x30]);
    assert_eq!(machine.cpu().state.ax(), 0x3042);
    assert_eq!(machine.cpu().state.sp(), 0xFFFE);

    let handler = machine
        .function_handler()
        .function_information(SegmentedAddress::new(0xF000, 0))
        .unwrap();
    assert_eq!(handler.name(), "interrupt_handler_21");
    let iret = FunctionReturn {
        kind: CallType::Interrupt,
        address: SegmentedAddress::new(0xF000, 4),
    };
    assert!(handler.returns()[&iret].contains(&SegmentedAddress::new(0x1000, 4)));
    assert!(handler.unaligned_returns().is_empty());
}

#[test]
fn callback_error_stops_the_run() {
    let mut machine = Machine::new(MachineConfig::default());
    machine.add_callback(Box::new(FnCallback::new(0x20, |_: &mut CpuContext<'_>| {
        Err(CpuError::Unrecoverable("program terminated abnormally".into()))
    })));
    machine.install_callbacks();
    machine.load(0x10000, &[0xCD, 0x20, 0xF4]).unwrap();

    let err = machine.run().unwrap_err();
    assert!(matches!(err, CpuError::Unrecoverable(_)));
}
