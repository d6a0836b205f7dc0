use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use dosre_debug::{BreakPoint, BreakPointType};
use dosre_machine::{Machine, MachineConfig, RunExit};

/// 0000: inc cx; 0001: jmp 0000
const SPIN: [u8; 3] = [0x41, 0xEB, 0xFD];
const JMP_ADDRESS: u32 = 0x10001;

fn spinning(max_cycles: Option<u64>) -> Machine {
    let mut machine = Machine::new(MachineConfig {
        max_cycles,
        ..MachineConfig::default()
    });
    machine.load(0x10000, &SPIN).unwrap();
    machine
}

fn counter() -> (Arc<AtomicU32>, impl Fn(&BreakPoint) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicU32::new(0));
    let sink = hits.clone();
    (hits, move |_: &BreakPoint| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn cycle_limit_ends_the_run() {
    let mut machine = spinning(Some(20));
    let exit = machine.run().unwrap();
    assert_eq!(exit, RunExit::CycleLimit { executed: 20 });
    assert_eq!(machine.cpu().state.cx(), 10);
}

#[test]
fn persistent_execution_breakpoint_fires_every_visit() {
    let mut machine = spinning(Some(20));
    let (hits, callback) = counter();
    machine.toggle_breakpoint(BreakPoint::execution(JMP_ADDRESS, false, callback), true);
    machine.run().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn one_shot_execution_breakpoint_fires_once() {
    let mut machine = spinning(Some(20));
    let (hits, callback) = counter();
    machine.toggle_breakpoint(BreakPoint::execution(JMP_ADDRESS, true, callback), true);
    machine.run().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(machine.breakpoints().summaries().is_empty());
}

#[test]
fn disarmed_breakpoint_never_fires() {
    let mut machine = spinning(Some(20));
    let (hits, callback) = counter();
    let breakpoint = BreakPoint::execution(JMP_ADDRESS, false, callback);
    machine.toggle_breakpoint(breakpoint.clone(), true);
    machine.toggle_breakpoint(breakpoint, false);
    machine.run().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn cycle_breakpoint_can_stop_the_machine() {
    let mut machine = spinning(None);
    let stop = machine.stop_handle();
    machine.toggle_breakpoint(BreakPoint::cycles(100, true, move |_| stop.stop()), true);

    let exit = machine.run().unwrap();
    // Fires at the first boundary where the counter exceeds the threshold.
    assert_eq!(exit, RunExit::Stopped { executed: 101 });
    assert!(!machine.stop_handle().is_running());
}

#[test]
fn memory_write_breakpoint_sees_guest_stores() {
    // mov [0x0200], ax; mov ax, [0x0200]; hlt
    let mut machine = Machine::new(MachineConfig::default());
    machine
        .load(0x10000, &[0xA3, 0x00, 0x02, 0xA1, 0x00, 0x02, 0xF4])
        .unwrap();
    machine.cpu_mut().state.set_ds(0x1000);

    let (writes, on_write) = counter();
    let (reads, on_read) = counter();
    machine.toggle_breakpoint(
        BreakPoint::memory(BreakPointType::MemoryWrite, 0x10200, false, on_write),
        true,
    );
    machine.toggle_breakpoint(
        BreakPoint::memory(BreakPointType::MemoryRead, 0x10200, false, on_read),
        true,
    );
    machine.run().unwrap();

    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn call_tracking_does_not_trigger_read_breakpoints() {
    // 0000: call 0004; 0003: hlt; 0004: ret
    let program = [0xE8, 0x01, 0x00, 0xF4, 0xC3];
    // Return address slot just below the initial SS:SP of 2000:FFFE.
    let slot = 0x2FFFC;

    let hits_with = |debug_mode: bool| {
        let mut machine = Machine::new(MachineConfig {
            debug_mode,
            ..MachineConfig::default()
        });
        machine.load(0x10000, &program).unwrap();
        let (hits, callback) = counter();
        machine.toggle_breakpoint(
            BreakPoint::memory(BreakPointType::MemoryRead, slot, false, callback),
            true,
        );
        machine.run().unwrap();
        hits.load(Ordering::SeqCst)
    };

    assert_eq!(hits_with(false), 1);
    assert_eq!(hits_with(true), 1);
}

#[test]
fn machine_stop_breakpoint_fires_after_halt_and_after_errors() {
    let mut halting = Machine::new(MachineConfig::default());
    halting.load(0x10000, &[0xF4]).unwrap();
    let (hits, callback) = counter();
    halting.toggle_breakpoint(BreakPoint::machine_stop(callback), true);
    halting.run().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let mut failing = Machine::new(MachineConfig::default());
    failing.load(0x10000, &[0x0F, 0x0B]).unwrap();
    let (hits, callback) = counter();
    failing.toggle_breakpoint(BreakPoint::machine_stop(callback), true);
    assert!(failing.run().is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn controller_thread_pauses_resumes_and_stops() {
    let mut machine = spinning(None);
    let pause = machine.pause_handler();
    let stop = machine.stop_handle();

    let exit = thread::scope(|s| {
        let runner = s.spawn(|| machine.run());

        pause.request_pause_and_wait();
        assert!(pause.is_paused());

        stop.stop();
        pause.request_resume();
        runner.join().unwrap()
    })
    .unwrap();

    assert!(matches!(exit, RunExit::Stopped { .. }));
    assert!(pause.is_pause_ended());
    assert!(!pause.is_paused());
}

#[test]
fn breakpoint_callback_can_request_a_pause() {
    let mut machine = spinning(Some(1_000));
    let pause = machine.pause_handler();
    let requester = pause.clone();
    machine.toggle_breakpoint(
        BreakPoint::execution(JMP_ADDRESS, true, move |_| requester.request_pause()),
        true,
    );

    let exit = thread::scope(|s| {
        let runner = s.spawn(|| machine.run());
        // Only the breakpoint requests a pause here.
        while !pause.is_paused() {
            thread::yield_now();
        }
        assert!(pause.is_pause_requested());
        pause.request_resume();
        runner.join().unwrap()
    })
    .unwrap();

    assert_eq!(exit, RunExit::CycleLimit { executed: 1_000 });
    assert!(pause.is_pause_ended());
}

#[test]
fn breakpoints_export_as_json() {
    let machine = spinning(None);
    machine.toggle_breakpoint(BreakPoint::execution(JMP_ADDRESS, false, |_| {}), true);
    machine.toggle_breakpoint(BreakPoint::cycles(5_000, true, |_| {}), true);

    let json: serde_json::Value =
        serde_json::from_slice(&machine.breakpoints().export_json().unwrap()).unwrap();
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 2);
}
