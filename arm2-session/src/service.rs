//! Per-session façade: owns the VM, the debugger, and the output sink, and exposes the
//! operations the HTTP layer consumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arm2_core::asm;
use arm2_core::cpu::PC;
use arm2_core::memory::MemoryError;
use arm2_core::program::ProgramImage;
use arm2_core::swi::{stdin_channel, SwiBridge, StdinHandle};
use arm2_core::trace::PerformanceStatistics;
use arm2_core::vm::{RegisterSnapshot, Vm, VmState};
use arm2_debug::{Breakpoint, Debugger, StopReason, WatchKind, WatchTarget, Watchpoint};
use serde::Serialize;

use crate::broadcaster::{BroadcasterHandle, Event, EventKind};
use crate::output::{ConsoleBuffers, SessionOutputSink};

#[derive(Debug, Serialize)]
pub struct Flags {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub status: String,
    pub pc: u32,
    pub sp: u32,
    pub lr: u32,
    pub cycles: u64,
    pub registers: [u32; 13],
    pub flags: Flags,
}

fn status_name(state: &VmState) -> String {
    match state {
        VmState::Ready => "ready".to_string(),
        VmState::Running => "running".to_string(),
        VmState::Breakpoint { .. } => "breakpoint".to_string(),
        VmState::Halted { .. } => "halted".to_string(),
        VmState::Error { .. } => "error".to_string(),
    }
}

fn snapshot_of(vm: &Vm) -> StateSnapshot {
    let RegisterSnapshot { registers, cpsr, cycles } = vm.register_snapshot();
    let mut r = [0u32; 13];
    r.copy_from_slice(&registers[0..13]);
    StateSnapshot {
        status: status_name(&vm.state),
        pc: registers[PC],
        sp: registers[13],
        lr: registers[14],
        cycles,
        registers: r,
        flags: Flags {
            n: cpsr & (1 << 31) != 0,
            z: cpsr & (1 << 30) != 0,
            c: cpsr & (1 << 29) != 0,
            v: cpsr & (1 << 28) != 0,
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("program did not assemble: {0}")]
    Assemble(#[from] asm::AsmError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("a run is already in progress for this session")]
    AlreadyRunning,
}

/// One session's VM, debugger, and I/O wiring. `vm` is a plain (non-async) mutex: `RunUntilHalt`
/// is a blocking loop meant to be driven from a dedicated OS thread or `spawn_blocking`, never
/// awaited directly.
pub struct Service {
    session_id: String,
    vm: Mutex<Vm>,
    pub debugger: Debugger,
    running: AtomicBool,
    cancel: AtomicBool,
    buffers: ConsoleBuffers,
    broadcaster: BroadcasterHandle,
    stdin: StdinHandle,
}

impl Service {
    pub fn new(session_id: String, broadcaster: BroadcasterHandle, fs_root: Option<std::path::PathBuf>) -> Self {
        let buffers = ConsoleBuffers::default();
        let sink = SessionOutputSink::new(session_id.clone(), broadcaster.clone(), buffers.clone());
        let (stdin_handle, stdin) = stdin_channel();

        let mut vm = Vm::new();
        let mut swi = SwiBridge::new().with_output_sink(Box::new(sink)).with_stdin(stdin);
        if let Some(root) = fs_root {
            swi.set_filesystem_root(root);
        }
        vm.swi = swi;

        Self {
            session_id,
            vm: Mutex::new(vm),
            debugger: Debugger::new(),
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            buffers,
            broadcaster,
            stdin: stdin_handle,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mutating operations (load, reset, step, breakpoint/watchpoint CRUD) must not race a
    /// `RunUntilHalt` in flight on another thread; each one calls this first.
    fn ensure_not_running(&self) -> Result<(), ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyRunning);
        }
        Ok(())
    }

    /// Sets the observable running flag synchronously. The HTTP `run` handler must call this
    /// before returning so the very next status GET sees `state=running`.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn emit_event(&self, name: &str, extra: serde_json::Value) {
        let mut data = serde_json::json!({ "event": name });
        if let serde_json::Value::Object(extra_map) = extra {
            if let serde_json::Value::Object(map) = &mut data {
                map.extend(extra_map);
            }
        }
        self.broadcaster.broadcast(Event { kind: EventKind::Event, session_id: self.session_id.clone(), data });
    }

    fn emit_state(&self, vm: &Vm) {
        let snapshot = snapshot_of(vm);
        let data = serde_json::to_value(&snapshot).unwrap_or(serde_json::json!({}));
        self.broadcaster.broadcast(Event { kind: EventKind::State, session_id: self.session_id.clone(), data });
    }

    pub fn load_program(&self, image: ProgramImage, entry_point: u32) -> Result<(), ServiceError> {
        self.ensure_not_running()?;
        let mut vm = self.vm.lock().unwrap();
        vm.load_program(image, entry_point);
        self.debugger.clear_step_mode();
        self.cancel.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.emit_state(&vm);
        Ok(())
    }

    /// Assembles `source` and loads the result at `origin`, returning the resulting symbol map.
    pub fn assemble_and_load(&self, source: &str, origin: u32) -> Result<std::collections::BTreeMap<String, u32>, ServiceError> {
        self.ensure_not_running()?;
        let image = asm::assemble(source, origin)?;
        let symbols = image.symbols.clone();
        self.debugger.set_symbols(symbols.clone());
        self.load_program(image, origin)?;
        Ok(symbols)
    }

    /// `None` leaves the VM's own default cycle limit untouched; `Some(n)` overrides it.
    pub fn set_cycle_limit(&self, limit: Option<u64>) {
        if let Some(limit) = limit {
            self.vm.lock().unwrap().cycle_limit = Some(limit);
        }
    }

    pub fn reset(&self) -> Result<(), ServiceError> {
        self.ensure_not_running()?;
        let mut vm = self.vm.lock().unwrap();
        vm.reset();
        self.debugger.clear_step_mode();
        self.cancel.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.emit_state(&vm);
        Ok(())
    }

    pub fn request_pause(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Blocking: steps the VM until it halts, errors, or the debugger / cooperative-cancel flag
    /// decides to stop it. Checks `ShouldBreak` *before* each instruction, including the first --
    /// resuming from a breakpoint must not immediately re-trigger it.
    pub fn run_until_halt(&self) -> StopReason {
        self.running.store(true, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);

        let reason = loop {
            if self.cancel.swap(false, Ordering::SeqCst) {
                break StopReason::VmStopped;
            }
            let mut vm = self.vm.lock().unwrap();
            if let Some(reason) = self.debugger.should_break(&vm) {
                self.emit_state(&vm);
                break reason;
            }
            vm.step();
            let running = matches!(vm.state, VmState::Running);
            if !running {
                self.report_terminal(&vm);
                drop(vm);
                break StopReason::VmStopped;
            }
        };

        self.running.store(false, Ordering::SeqCst);
        reason
    }

    fn report_terminal(&self, vm: &Vm) {
        self.emit_state(vm);
        match &vm.state {
            VmState::Halted { exit_code } => self.emit_event("halted", serde_json::json!({ "exitCode": exit_code })),
            VmState::Error { message } => self.emit_event("error", serde_json::json!({ "message": message })),
            _ => {}
        }
    }

    fn step_common(&self) -> StopReason {
        let mut vm = self.vm.lock().unwrap();
        let reason = self.debugger.step_with_mode(&mut vm);
        if !matches!(vm.state, VmState::Running) {
            self.report_terminal(&vm);
        } else {
            self.emit_state(&vm);
        }
        reason
    }

    pub fn step(&self) -> Result<StopReason, ServiceError> {
        self.ensure_not_running()?;
        self.debugger.arm_single_step();
        Ok(self.step_common())
    }

    pub fn step_over(&self) -> Result<StopReason, ServiceError> {
        self.ensure_not_running()?;
        {
            let vm = self.vm.lock().unwrap();
            self.debugger.arm_step_over(&vm);
        }
        Ok(self.step_common())
    }

    pub fn step_out(&self) -> Result<StopReason, ServiceError> {
        self.ensure_not_running()?;
        {
            let vm = self.vm.lock().unwrap();
            self.debugger.arm_step_out(&vm);
        }
        Ok(self.step_common())
    }

    pub fn register_state(&self) -> StateSnapshot {
        let vm = self.vm.lock().unwrap();
        snapshot_of(&vm)
    }

    /// The guest's own exit code, if the VM halted via the `exit` SWI. `None` while running or
    /// if the VM stopped for any other reason (breakpoint, error, still ready).
    pub fn exit_code(&self) -> Option<i32> {
        match self.vm.lock().unwrap().state {
            VmState::Halted { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    pub fn read_memory(&self, address: u32, length: u32) -> Result<Vec<u8>, MemoryError> {
        let vm = self.vm.lock().unwrap();
        vm.memory.read_range(address, length)
    }

    pub fn last_memory_write(&self) -> Option<arm2_core::memory::MemoryWriteEvent> {
        let vm = self.vm.lock().unwrap();
        vm.memory.last_write().copied()
    }

    pub fn symbols(&self) -> std::collections::BTreeMap<String, u32> {
        let vm = self.vm.lock().unwrap();
        vm.program().map(|p| p.symbols.clone()).unwrap_or_default()
    }

    pub fn console_snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        self.buffers.snapshot()
    }

    pub fn send_input(&self, text: &str) {
        self.stdin.send(text);
    }

    pub fn evaluate(&self, expr: &str) -> Result<u32, arm2_debug::EvalError> {
        let vm = self.vm.lock().unwrap();
        self.debugger.evaluate(expr, &vm)
    }

    pub fn add_breakpoint(&self, address: u32, temporary: bool, condition: Option<String>) -> Result<Breakpoint, ServiceError> {
        self.ensure_not_running()?;
        Ok(self.debugger.breakpoints.add(address, temporary, condition))
    }

    pub fn remove_breakpoint(&self, id: u64) -> Result<bool, ServiceError> {
        self.ensure_not_running()?;
        Ok(self.debugger.breakpoints.delete(id))
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.debugger.breakpoints.get_all()
    }

    pub fn add_watchpoint(&self, kind: WatchKind, target: WatchTarget) -> Result<Watchpoint, ServiceError> {
        self.ensure_not_running()?;
        let vm = self.vm.lock().unwrap();
        Ok(self.debugger.add_watchpoint(&vm, kind, target))
    }

    pub fn remove_watchpoint(&self, id: u64) -> Result<bool, ServiceError> {
        self.ensure_not_running()?;
        Ok(self.debugger.watchpoints.delete(id))
    }

    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.debugger.watchpoints.get_all()
    }

    pub fn enable_trace(&self, enabled: bool) {
        self.vm.lock().unwrap().enable_trace(enabled, 1024);
    }

    pub fn trace_data(&self) -> Vec<arm2_core::trace::TraceEntry> {
        self.vm.lock().unwrap().trace().map(|t| t.entries().to_vec()).unwrap_or_default()
    }

    pub fn enable_stats(&self, enabled: bool) {
        self.vm.lock().unwrap().enable_stats(enabled);
    }

    pub fn stats_snapshot(&self) -> Option<StatsSnapshot> {
        let vm = self.vm.lock().unwrap();
        vm.stats().map(StatsSnapshot::from)
    }

    /// Decodes up to `count` instructions starting at `address`. Stops early on a memory read
    /// failure rather than erroring the whole request -- a partial disassembly past the end of
    /// the code segment is still useful to a caller.
    pub fn disassembly(&self, address: u32, count: u32) -> Vec<DisassembledLine> {
        let vm = self.vm.lock().unwrap();
        let mut lines = Vec::new();
        let mut addr = address;
        for _ in 0..count {
            let Ok(bytes) = vm.memory.read_range(addr, 4) else { break };
            let opcode = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let decoded = arm2_core::decode::decode(opcode, addr);
            lines.push(DisassembledLine { address: addr, opcode, text: arm2_core::trace::disassemble(&decoded) });
            addr = addr.wrapping_add(4);
        }
        lines
    }
}

#[derive(Debug, Serialize)]
pub struct DisassembledLine {
    pub address: u32,
    pub opcode: u32,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub total_instructions: u64,
    pub total_cycles: u64,
    pub instructions_per_second: f64,
}

impl From<&PerformanceStatistics> for StatsSnapshot {
    fn from(stats: &PerformanceStatistics) -> Self {
        Self {
            total_instructions: stats.total_instructions,
            total_cycles: stats.total_cycles,
            instructions_per_second: stats.instructions_per_second(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm2_core::memory::CODE_BASE;

    fn service() -> Service {
        let broadcaster = crate::broadcaster::spawn();
        Service::new("s1".to_string(), broadcaster, None)
    }

    #[test]
    fn load_run_and_observe_exit_code() {
        let svc = service();
        let image = ProgramImage::new(
            CODE_BASE,
            [0xE3A0_002A_u32.to_le_bytes(), 0xEF00_0000_u32.to_le_bytes()].concat(),
        );
        svc.load_program(image, CODE_BASE).unwrap();
        let reason = svc.run_until_halt();
        assert_eq!(reason, StopReason::VmStopped);
        assert_eq!(svc.register_state().registers[0], 42);
        assert!(!svc.is_running());
    }

    #[test]
    fn assemble_and_load_scenario_one() {
        let svc = service();
        let source = "MOV R0, #42\nSWI #0\n";
        svc.assemble_and_load(source, CODE_BASE).unwrap();
        svc.run_until_halt();
        assert_eq!(svc.register_state().registers[0], 42);
    }

    #[test]
    fn breakpoint_then_step_reaches_halted() {
        let svc = service();
        let image = ProgramImage::new(
            CODE_BASE,
            [0xE3A0_002A_u32.to_le_bytes(), 0xEF00_0000_u32.to_le_bytes()].concat(),
        );
        svc.load_program(image, CODE_BASE).unwrap();
        svc.add_breakpoint(CODE_BASE + 4, false, None).unwrap();
        let reason = svc.run_until_halt();
        assert!(matches!(reason, StopReason::Breakpoint(b) if b.address == CODE_BASE + 4));
        let reason = svc.step().unwrap();
        assert_eq!(reason, StopReason::VmStopped);
        assert_eq!(svc.register_state().status, "halted");
    }

    #[test]
    fn mutating_calls_are_rejected_while_running() {
        let svc = service();
        let image = ProgramImage::new(
            CODE_BASE,
            [0xEAFF_FFFE_u32.to_le_bytes()].concat(), // B . (infinite loop)
        );
        svc.load_program(image, CODE_BASE).unwrap();
        svc.set_running(true);
        assert!(matches!(svc.reset(), Err(ServiceError::AlreadyRunning)));
        assert!(matches!(svc.step(), Err(ServiceError::AlreadyRunning)));
        assert!(matches!(svc.add_breakpoint(CODE_BASE, false, None), Err(ServiceError::AlreadyRunning)));
        svc.set_running(false);
        assert!(svc.reset().is_ok());
    }
}
