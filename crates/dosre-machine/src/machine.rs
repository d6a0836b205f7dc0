use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dosre_cpu::Result;
use dosre_debug::{BreakPoint, MachineBreakpoints, MemoryBreakpoints, PauseHandler};
use dosre_mem::{Ram, SegmentedAddress};
use tracing::{debug, error, info};

use crate::callback::Callback;
use crate::config::MachineConfig;
use crate::cpu::{Cpu, CpuExit};
use crate::function::{CallType, FunctionHandler, OverrideSupplier};

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The guest executed `HLT`.
    Halted { executed: u64 },
    /// [`MachineStopHandle::stop`] was called.
    Stopped { executed: u64 },
    /// [`MachineConfig::max_cycles`] was reached.
    CycleLimit { executed: u64 },
}

impl RunExit {
    pub fn executed(&self) -> u64 {
        match *self {
            RunExit::Halted { executed }
            | RunExit::Stopped { executed }
            | RunExit::CycleLimit { executed } => executed,
        }
    }
}

/// Cloneable handle that ends a run after the current instruction.
#[derive(Debug, Clone)]
pub struct MachineStopHandle {
    running: Arc<AtomicBool>,
}

impl MachineStopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// CPU, memory and the execution gate wired together.
///
/// Breakpoints and pause/resume are shared through `Arc` handles so a
/// controller thread can drive them while [`Machine::run`] executes.
pub struct Machine {
    config: MachineConfig,
    cpu: Cpu,
    memory: Ram,
    breakpoints: Arc<MachineBreakpoints>,
    pause: Arc<PauseHandler>,
    running: Arc<AtomicBool>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let memory_breakpoints = Arc::new(MemoryBreakpoints::new());
        let memory = Ram::with_breakpoints(config.memory_size, memory_breakpoints.clone());
        Self {
            cpu: Cpu::new(&config),
            memory,
            breakpoints: Arc::new(MachineBreakpoints::new(memory_breakpoints)),
            pause: Arc::new(PauseHandler::new()),
            running: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Ram {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Ram {
        &mut self.memory
    }

    pub fn function_handler(&self) -> &FunctionHandler {
        &self.cpu.function_handler
    }

    pub fn breakpoints(&self) -> Arc<MachineBreakpoints> {
        self.breakpoints.clone()
    }

    pub fn pause_handler(&self) -> Arc<PauseHandler> {
        self.pause.clone()
    }

    pub fn stop_handle(&self) -> MachineStopHandle {
        MachineStopHandle {
            running: self.running.clone(),
        }
    }

    pub fn toggle_breakpoint(&self, breakpoint: BreakPoint, on: bool) {
        self.breakpoints.toggle_breakpoint(breakpoint, on);
    }

    /// Copies a program image into memory.
    pub fn load(&mut self, address: u32, image: &[u8]) -> Result<()> {
        self.memory.load(address, image)?;
        Ok(())
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.cpu.callbacks.add_callback(callback);
    }

    /// Writes every registered callback's trampoline and interrupt vector.
    pub fn install_callbacks(&mut self) -> Vec<(u16, SegmentedAddress)> {
        self.cpu
            .callbacks
            .install_all_callbacks_in_interrupt_table(&mut self.memory)
    }

    pub fn add_override_supplier(&mut self, supplier: &mut dyn OverrideSupplier) {
        let informations =
            supplier.generate_function_informations(self.config.program_start_segment);
        info!(count = informations.len(), "registered function definitions");
        self.cpu.function_handler.add_function_informations(informations);
    }

    pub fn request_external_interrupt(&mut self, vector: u8) {
        self.cpu.request_external_interrupt(vector);
    }

    /// Runs until `HLT`, a stop request, the cycle limit or an error.
    ///
    /// Machine-stop breakpoints fire on every exit path, errors included.
    pub fn run(&mut self) -> Result<RunExit> {
        self.running.store(true, Ordering::SeqCst);
        let start_cycles = self.cpu.state.cycles();
        let entry = self.cpu.state.ip_address();
        debug!(%entry, "starting execution");

        let memory = &mut self.memory;
        let outcome = self
            .cpu
            .with_context(memory, |ctx, functions| {
                functions.call_named(ctx, CallType::Machine, entry, None, false, || {
                    "entry".to_owned()
                })
            })
            .and_then(|()| self.run_loop());

        let executed = self.cpu.state.cycles() - start_cycles;
        self.running.store(false, Ordering::SeqCst);
        let memory = &mut self.memory;
        self.cpu.with_context(memory, |ctx, functions| {
            // Frames left above the root by unaligned returns stay for inspection.
            if functions.current_call().map(|call| call.kind) == Some(CallType::Machine) {
                functions.ret(ctx.state, ctx.memory, CallType::Machine);
            }
        });
        self.breakpoints.on_machine_stop();

        match outcome {
            Ok(reason) => {
                let exit = match reason {
                    LoopExit::Halted => RunExit::Halted { executed },
                    LoopExit::Stopped => RunExit::Stopped { executed },
                    LoopExit::CycleLimit => RunExit::CycleLimit { executed },
                };
                info!(?exit, "execution finished");
                Ok(exit)
            }
            Err(err) => {
                let call_stack = self.cpu.function_handler.dump_call_stack();
                error!(%err, %call_stack, "execution failed");
                Err(err)
            }
        }
    }

    fn run_loop(&mut self) -> Result<LoopExit> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(LoopExit::Stopped);
            }
            if let Some(limit) = self.config.max_cycles {
                if self.cpu.state.cycles() >= limit {
                    return Ok(LoopExit::CycleLimit);
                }
            }

            self.breakpoints
                .check_breakpoints(self.cpu.state.cycles(), self.cpu.state.ip_physical());
            self.pause.wait_if_paused();
            if !self.running.load(Ordering::SeqCst) {
                return Ok(LoopExit::Stopped);
            }

            if self.cpu.execute_next_instruction(&mut self.memory)? == CpuExit::Halt {
                return Ok(LoopExit::Halted);
            }
        }
    }
}

enum LoopExit {
    Halted,
    Stopped,
    CycleLimit,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("config", &self.config)
            .field("state", &self.cpu.state)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
