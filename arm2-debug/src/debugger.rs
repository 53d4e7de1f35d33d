//! The debugger façade: breakpoints, watchpoints, the expression evaluator, and step-mode
//! combined behind a single `ShouldBreak` check and a supervising run loop.

use std::collections::BTreeMap;
use std::sync::Mutex;

use arm2_core::decode;
use arm2_core::vm::{Vm, VmState};
use log::debug;

use crate::breakpoint::{Breakpoint, BreakpointManager};
use crate::expr;
use crate::step_mode::StepMode;
use crate::watchpoint::{WatchKind, WatchTarget, Watchpoint, WatchpointManager};

/// Why a run loop stopped before the VM itself halted or errored.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Breakpoint(Breakpoint),
    Watchpoint(Watchpoint),
    StepComplete,
    /// The VM itself stopped running (halted, errored, or hit its cycle limit) before the
    /// debugger found a reason to.
    VmStopped,
}

pub struct Debugger {
    pub breakpoints: BreakpointManager,
    pub watchpoints: WatchpointManager,
    step_mode: Mutex<StepMode>,
    history: Mutex<Vec<u32>>,
    symbols: Mutex<BTreeMap<String, u32>>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            breakpoints: BreakpointManager::new(),
            watchpoints: WatchpointManager::new(),
            step_mode: Mutex::new(StepMode::None),
            history: Mutex::new(Vec::new()),
            symbols: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_symbols(&self, symbols: BTreeMap<String, u32>) {
        *self.symbols.lock().unwrap() = symbols;
    }

    pub fn value_history(&self) -> Vec<u32> {
        self.history.lock().unwrap().clone()
    }

    /// Evaluates `expr_text` against `vm`. Pushes the result onto the value history, for later
    /// `$N` references (a `print` command); use [`Self::evaluate_condition`] for breakpoint
    /// conditions, which must not pollute history.
    pub fn evaluate(&self, expr_text: &str, vm: &Vm) -> Result<u32, expr::EvalError> {
        let symbols = self.symbols.lock().unwrap().clone();
        let history = self.history.lock().unwrap().clone();
        let value = expr::evaluate(expr_text, vm, &symbols, &history)?;
        self.history.lock().unwrap().push(value);
        Ok(value)
    }

    /// Evaluates a breakpoint condition. Does not touch the value history.
    fn evaluate_condition(&self, expr_text: &str, vm: &Vm) -> Result<bool, expr::EvalError> {
        let symbols = self.symbols.lock().unwrap().clone();
        let history = self.history.lock().unwrap().clone();
        expr::evaluate_bool(expr_text, vm, &symbols, &history)
    }

    /// Checks whether execution should stop *before* the next instruction dispatches, in the
    /// fixed order: step-mode completion, then an enabled breakpoint at the current PC (a
    /// condition that fails to evaluate counts as a hit -- a broken condition should surface,
    /// not silently pass through), then any watchpoint whose value has changed since the last
    /// check.
    pub fn should_break(&self, vm: &Vm) -> Option<StopReason> {
        {
            let mode = *self.step_mode.lock().unwrap();
            if mode.completed_after_step(vm) {
                *self.step_mode.lock().unwrap() = StepMode::None;
                return Some(StopReason::StepComplete);
            }
        }

        let pc = vm.cpu.get_pc();
        if let Some(bp) = self.breakpoints.get_by_address(pc) {
            if bp.enabled {
                let should_hit = match &bp.condition_text {
                    None => true,
                    Some(cond) => self.evaluate_condition(cond, vm).unwrap_or(true),
                };
                if should_hit {
                    let hit = self.breakpoints.process_hit(pc).unwrap_or(bp);
                    return Some(StopReason::Breakpoint(hit));
                }
            }
        }

        if let Some(wp) = self.watchpoints.check_watchpoints(vm) {
            return Some(StopReason::Watchpoint(wp));
        }

        None
    }

    pub fn arm_single_step(&self) {
        *self.step_mode.lock().unwrap() = StepMode::Single;
    }

    pub fn arm_step_over(&self, vm: &Vm) {
        let decoded = decode_at_pc(vm);
        *self.step_mode.lock().unwrap() = StepMode::start_over(vm, &decoded);
    }

    pub fn arm_step_out(&self, vm: &Vm) {
        *self.step_mode.lock().unwrap() = StepMode::start_out(vm);
    }

    pub fn clear_step_mode(&self) {
        *self.step_mode.lock().unwrap() = StepMode::None;
    }

    pub fn add_watchpoint(&self, vm: &Vm, kind: WatchKind, target: WatchTarget) -> Watchpoint {
        self.watchpoints.add(vm, kind, target)
    }

    /// Runs `vm` until it halts, errors, or the debugger decides to stop it -- the asymmetry
    /// between `Step`/`StepOver`/`StepOut` (which always execute at least one instruction before
    /// checking) and `RunUntilHalt` (which checks `should_break` before every instruction,
    /// including the very first) is deliberate: resuming from a breakpoint must not immediately
    /// re-trigger it.
    pub fn run_until_stop(&self, vm: &mut Vm) -> StopReason {
        loop {
            if let Some(reason) = self.should_break(vm) {
                return reason;
            }
            vm.step();
            if !matches!(vm.state, VmState::Running) {
                debug!("run_until_stop: VM left running state: {:?}", vm.state);
                return StopReason::VmStopped;
            }
        }
    }

    /// Runs exactly one debugger-level step: dispatches one VM instruction, then applies the
    /// currently armed step mode to decide whether further instructions run before returning
    /// control (used by `Step`/`StepOver`/`StepOut`, which must make forward progress even when
    /// standing on a breakpoint).
    pub fn step_with_mode(&self, vm: &mut Vm) -> StopReason {
        loop {
            vm.step();
            if !matches!(vm.state, VmState::Running) {
                return StopReason::VmStopped;
            }
            let mode = *self.step_mode.lock().unwrap();
            if mode.completed_after_step(vm) {
                *self.step_mode.lock().unwrap() = StepMode::None;
                return StopReason::StepComplete;
            }
            if let Some(reason) = self.should_break_mid_run(vm) {
                return reason;
            }
        }
    }

    fn should_break_mid_run(&self, vm: &Vm) -> Option<StopReason> {
        let pc = vm.cpu.get_pc();
        if let Some(bp) = self.breakpoints.get_by_address(pc) {
            if bp.enabled {
                let should_hit = match &bp.condition_text {
                    None => true,
                    Some(cond) => self.evaluate_condition(cond, vm).unwrap_or(true),
                };
                if should_hit {
                    let hit = self.breakpoints.process_hit(pc).unwrap_or(bp);
                    return Some(StopReason::Breakpoint(hit));
                }
            }
        }
        self.watchpoints.check_watchpoints(vm).map(StopReason::Watchpoint)
    }
}

fn decode_at_pc(vm: &Vm) -> decode::DecodedInstruction {
    let pc = vm.cpu.get_pc();
    let opcode = vm.memory.read_range(pc, 4).ok().map_or(0, |bytes| {
        u32::from_le_bytes(bytes.try_into().unwrap())
    });
    decode::decode(opcode, pc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm2_core::memory::CODE_BASE;
    use arm2_core::program::ProgramImage;

    fn install(vm: &mut Vm, addr: u32, opcode: u32) {
        vm.memory.load_bytes(addr, &opcode.to_le_bytes()).unwrap();
    }

    #[test]
    fn breakpoint_halts_run_until_stop() {
        let mut vm = Vm::new();
        let image = ProgramImage::new(
            CODE_BASE,
            [0xE3A0_002A_u32.to_le_bytes(), 0xEF00_0000_u32.to_le_bytes()].concat(),
        );
        vm.load_program(image, CODE_BASE);
        let dbg = Debugger::new();
        dbg.breakpoints.add(CODE_BASE + 4, false, None);
        let reason = dbg.run_until_stop(&mut vm);
        assert!(matches!(reason, StopReason::Breakpoint(b) if b.address == CODE_BASE + 4));
        assert_eq!(vm.cpu.get_pc(), CODE_BASE + 4);
    }

    #[test]
    fn conditional_breakpoint_only_fires_when_true() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xE3A0_0000); // MOV R0, #0
        install(&mut vm, CODE_BASE + 4, 0xE3A0_002A); // MOV R0, #42
        install(&mut vm, CODE_BASE + 8, 0xEF00_0000); // SWI #0
        let dbg = Debugger::new();
        dbg.breakpoints.add(CODE_BASE + 4, false, Some("r0 == 1".to_string()));
        let reason = dbg.run_until_stop(&mut vm);
        assert_eq!(reason, StopReason::VmStopped);
        assert_eq!(vm.cpu.get_register(0), 42);
    }

    #[test]
    fn breakpoint_condition_does_not_pollute_value_history() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xE3A0_0001); // MOV R0, #1
        install(&mut vm, CODE_BASE + 4, 0xEF00_0000); // SWI #0
        let dbg = Debugger::new();
        dbg.breakpoints.add(CODE_BASE + 4, false, Some("r0 == 1".to_string()));
        dbg.run_until_stop(&mut vm);
        assert!(dbg.value_history().is_empty());
    }

    #[test]
    fn single_step_runs_exactly_one_instruction() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(CODE_BASE);
        install(&mut vm, CODE_BASE, 0xE3A0_0001); // MOV R0, #1
        install(&mut vm, CODE_BASE + 4, 0xE3A0_0002); // MOV R0, #2
        let dbg = Debugger::new();
        dbg.arm_single_step();
        let reason = dbg.step_with_mode(&mut vm);
        assert_eq!(reason, StopReason::StepComplete);
        assert_eq!(vm.cpu.get_register(0), 1);
    }
}
