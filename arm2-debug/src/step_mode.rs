//! Step-mode state machine: `Single`, `Over` (skip called subroutines), `Out` (run to return).

use arm2_core::cpu::LR;
use arm2_core::decode::DecodedInstruction;
use arm2_core::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    None,
    Single,
    /// Armed at `return_pc`: the instruction immediately after a `BL` we stepped over.
    Over { return_pc: u32 },
    /// Armed at `return_lr`: the caller's LR captured when `StepOut` was issued.
    Out { return_lr: u32 },
}

/// Is `decoded` a call that pushes a return address into LR (`BL`)?
fn is_call(decoded: &DecodedInstruction) -> bool {
    matches!(decoded, DecodedInstruction::Branch { link: true, .. })
}

impl StepMode {
    /// Starts a `StepOver`: if the next instruction is a call, arms `Over` at `pc + 4`;
    /// otherwise behaves exactly like `Single`.
    pub fn start_over(vm: &Vm, decoded: &DecodedInstruction) -> StepMode {
        if is_call(decoded) {
            StepMode::Over { return_pc: vm.cpu.get_pc().wrapping_add(4) }
        } else {
            StepMode::Single
        }
    }

    /// Starts a `StepOut`: arms `Out` at the current LR, the address the enclosing function will
    /// return to. This is an approximation -- it assumes the current frame's LR has not yet been
    /// overwritten by a nested call that hasn't returned.
    pub fn start_out(vm: &Vm) -> StepMode {
        StepMode::Out { return_lr: vm.cpu.get_register(LR) }
    }

    /// After a VM step has executed, decides whether this step-mode has "completed" (the
    /// debugger should stop) or should continue running.
    pub fn completed_after_step(self, vm: &Vm) -> bool {
        match self {
            StepMode::None => false,
            StepMode::Single => true,
            StepMode::Over { return_pc } => vm.cpu.get_pc() == return_pc,
            StepMode::Out { return_lr } => vm.cpu.get_pc() == return_lr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm2_core::cpu::Condition;

    fn branch(link: bool) -> DecodedInstruction {
        DecodedInstruction::Branch { cond: Condition::AL, link, offset: 0 }
    }

    fn mov() -> DecodedInstruction {
        DecodedInstruction::Undefined { cond: Condition::AL, opcode: 0 }
    }

    #[test]
    fn single_step_completes_immediately() {
        let vm = Vm::new();
        assert!(StepMode::Single.completed_after_step(&vm));
    }

    #[test]
    fn step_over_non_call_behaves_like_single() {
        let vm = Vm::new();
        let mode = StepMode::start_over(&vm, &mov());
        assert_eq!(mode, StepMode::Single);
    }

    #[test]
    fn step_over_call_arms_return_address() {
        let mut vm = Vm::new();
        vm.cpu.set_pc(0x8000);
        let mode = StepMode::start_over(&vm, &branch(true));
        assert_eq!(mode, StepMode::Over { return_pc: 0x8004 });
        assert!(!mode.completed_after_step(&vm));
        vm.cpu.set_pc(0x8004);
        assert!(mode.completed_after_step(&vm));
    }

    #[test]
    fn step_out_arms_current_lr() {
        let mut vm = Vm::new();
        vm.cpu.set_register(LR, 0x9000);
        let mode = StepMode::start_out(&vm);
        assert_eq!(mode, StepMode::Out { return_lr: 0x9000 });
        assert!(!mode.completed_after_step(&vm));
        vm.cpu.set_pc(0x9000);
        assert!(mode.completed_after_step(&vm));
    }
}
