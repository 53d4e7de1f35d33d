//! The VM: register file, memory, SWI bridge, and optional trace/stats overlays bound together
//! behind a single `step`/`reset`/`load_program` surface.

use log::{error, info};

use crate::cpu::Cpu;
use crate::decode::{self, DecodedInstruction};
use crate::execute::{self, ExecError, StepOutcome};
use crate::memory::{Memory, CODE_BASE, STACK_BASE, STACK_SIZE};
use crate::program::ProgramImage;
use crate::swi::SwiBridge;
use crate::trace::{ExecutionTrace, OpcodeCategory, PerformanceStatistics};

/// Observable VM lifecycle state, surfaced to the debugger and the HTTP API.
#[derive(Debug, Clone, PartialEq)]
pub enum VmState {
    /// Loaded but not yet run, or freshly reset.
    Ready,
    /// A `RunUntilHalt` is currently executing (or the caller is mid-`Step`).
    Running,
    /// Stopped by the debugger (breakpoint, watchpoint, or step-mode completion).
    Breakpoint { reason: String },
    /// The guest called `SWI #EXIT`.
    Halted { exit_code: i32 },
    /// A VM-integrity error occurred; recoverable only via `Reset`.
    Error { message: String },
}

/// Default ceiling `RunUntilHalt` applies when nothing overrides it, chosen so a runaway loop in
/// guest code can't wedge a session forever.
pub const DEFAULT_CYCLE_LIMIT: u64 = 50_000_000;

pub struct Vm {
    pub cpu: Cpu,
    pub memory: Memory,
    pub swi: SwiBridge,
    pub state: VmState,
    pub cycle_limit: Option<u64>,
    entry_point: u32,
    program: Option<ProgramImage>,
    trace: Option<ExecutionTrace>,
    stats: Option<PerformanceStatistics>,
    running: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut cpu = Cpu::new();
        cpu.set_sp(STACK_BASE + STACK_SIZE);
        Self {
            cpu,
            memory: Memory::with_default_layout(),
            swi: SwiBridge::new(),
            state: VmState::Ready,
            cycle_limit: Some(DEFAULT_CYCLE_LIMIT),
            entry_point: CODE_BASE,
            program: None,
            trace: None,
            stats: None,
            running: false,
        }
    }

    /// Resets registers (SP restored to the stack top) and re-copies the last-loaded program
    /// image, if any, back into the code segment and PC.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.cpu.set_sp(STACK_BASE + STACK_SIZE);
        self.running = false;
        self.state = VmState::Ready;
        if let Some(program) = self.program.clone() {
            self.memory = Memory::with_default_layout();
            let _ = self.memory.load_bytes(program.origin, &program.code);
            self.cpu.set_pc(self.entry_point);
        }
    }

    /// Loads `image`, copying its bytes into the code segment and setting PC to `entry_point`.
    pub fn load_program(&mut self, image: ProgramImage, entry_point: u32) {
        self.memory = Memory::with_default_layout();
        if let Err(e) = self.memory.load_bytes(image.origin, &image.code) {
            error!("failed to load program at {:#010x}: {e}", image.origin);
        }
        self.cpu = Cpu::new();
        self.cpu.set_sp(STACK_BASE + STACK_SIZE);
        self.cpu.set_pc(entry_point);
        self.entry_point = entry_point;
        self.program = Some(image);
        self.state = VmState::Ready;
        self.running = false;
    }

    pub fn program(&self) -> Option<&ProgramImage> {
        self.program.as_ref()
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
        if running {
            self.state = VmState::Running;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn enable_trace(&mut self, enabled: bool, capacity: usize) {
        self.trace = if enabled { Some(ExecutionTrace::new(capacity)) } else { None };
    }

    pub fn enable_stats(&mut self, enabled: bool) {
        self.stats = if enabled { Some(PerformanceStatistics::new()) } else { None };
    }

    pub fn trace(&self) -> Option<&ExecutionTrace> {
        self.trace.as_ref()
    }

    pub fn stats(&self) -> Option<&PerformanceStatistics> {
        self.stats.as_ref()
    }

    /// Executes exactly one instruction, updating `state` and any attached overlays. Does
    /// nothing (returns immediately) if the VM is already `Halted` or `Error`.
    pub fn step(&mut self) -> &VmState {
        if matches!(self.state, VmState::Halted { .. } | VmState::Error { .. }) {
            return &self.state;
        }

        let pc = self.cpu.get_pc();
        let opcode = match self.memory.read_code_word(pc) {
            Ok(opcode) => opcode,
            Err(e) => {
                self.state = VmState::Error { message: e.to_string() };
                return &self.state;
            }
        };
        let decoded = decode::decode(opcode, pc);
        let condition_true = decoded.condition().evaluate(self.cpu.cpsr);

        if let Some(trace) = self.trace.as_mut() {
            trace.before_step(&self.cpu, pc, opcode, &decoded);
        }

        match execute::step(&mut self.cpu, &mut self.memory, &mut self.swi, self.cycle_limit) {
            Ok(StepOutcome::Continue) => {
                self.state = VmState::Running;
            }
            Ok(StepOutcome::Halted { exit_code }) => {
                info!("VM halted with exit code {exit_code}");
                self.state = VmState::Halted { exit_code };
                self.running = false;
            }
            Err(e) => {
                self.on_error(&decoded, e);
            }
        }

        if let Some(trace) = self.trace.as_mut() {
            trace.after_step(&self.cpu);
        }
        if let Some(stats) = self.stats.as_mut() {
            stats.record_step(OpcodeCategory::from(&decoded), condition_true, 1);
            stats.record_memory(
                self.memory.reads,
                self.memory.writes,
                self.memory.bytes_read,
                self.memory.bytes_written,
            );
        }

        &self.state
    }

    fn on_error(&mut self, decoded: &DecodedInstruction, err: ExecError) {
        let _ = decoded;
        error!("VM error: {err}");
        self.state = VmState::Error { message: err.to_string() };
        self.running = false;
    }

    /// Register snapshot including the raw (non-prefetch-biased) PC and serialized CPSR, for
    /// debugger/HTTP consumption.
    pub fn register_snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            registers: *self.cpu.registers_raw(),
            cpsr: self.cpu.cpsr.to_bits(),
            cycles: self.cpu.cycles,
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterSnapshot {
    pub registers: [u32; 16],
    pub cpsr: u32,
    pub cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(vm: &mut Vm, addr: u32, opcode: u32) {
        vm.memory.load_bytes(addr, &opcode.to_le_bytes()).unwrap();
    }

    #[test]
    fn mov_and_exit_end_to_end() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xE3A0_002A); // MOV R0,#42
        install(&mut vm, CODE_BASE + 4, 0xEF00_0000); // SWI #0
        vm.step();
        assert_eq!(vm.state, VmState::Running);
        vm.step();
        assert_eq!(vm.state, VmState::Halted { exit_code: 42 });
        assert_eq!(vm.cpu.get_register(0), 42);
        assert_eq!(vm.cpu.cycles, 2);
    }

    #[test]
    fn undefined_instruction_enters_error_state() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xE600_0010);
        vm.step();
        assert!(matches!(vm.state, VmState::Error { .. }));
        assert_eq!(vm.cpu.get_pc(), CODE_BASE);
    }

    #[test]
    fn reset_restores_stack_pointer_and_entry() {
        let mut vm = Vm::new();
        let image = ProgramImage::new(CODE_BASE, vec![0x2A, 0x00, 0xA0, 0xE3]);
        vm.load_program(image, CODE_BASE);
        vm.cpu.set_register(0, 99);
        vm.reset();
        assert_eq!(vm.cpu.get_register(0), 0);
        assert_eq!(vm.cpu.get_sp(), STACK_BASE + STACK_SIZE);
        assert_eq!(vm.cpu.get_pc(), CODE_BASE);
    }

    #[test]
    fn stopping_at_halted_step_is_a_no_op() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xEF00_0000); // SWI #0, exit code = R0 = 0
        vm.step();
        assert_eq!(vm.state, VmState::Halted { exit_code: 0 });
        let cycles_before = vm.cpu.cycles;
        vm.step();
        assert_eq!(vm.cpu.cycles, cycles_before);
    }
}
