//! Instruction execution: consumes a decoded instruction plus [`Cpu`]/[`Memory`]/SWI bridge,
//! mutates state, advances PC, and signals terminal/error states.

use log::trace;
use thiserror::Error;

use crate::cpu::{Cpsr, Cpu, LR, PC};
use crate::decode::{self, DataOp, DecodedInstruction, LoadStoreOffset, Operand2, ShiftAmount, ShiftType, ShiftedRegister};
use crate::memory::{Memory, MemoryError};
use crate::swi::{SwiBridge, SwiError, SwiOutcome};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("undefined instruction at {address:#010x}: {opcode:#010x}")]
    UndefinedInstruction { address: u32, opcode: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("cycle limit of {limit} exceeded")]
    CycleLimitExceeded { limit: u64 },
    #[error("security violation: {0}")]
    Security(String),
}

impl From<SwiError> for ExecError {
    fn from(e: SwiError) -> Self {
        match e {
            SwiError::Memory(m) => ExecError::Memory(m),
            other => ExecError::Security(other.to_string()),
        }
    }
}

/// Result of executing a single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Normal completion; execution may continue.
    Continue,
    /// The guest requested `SWI #EXIT`; carries the signed exit code from R0.
    Halted { exit_code: i32 },
}

/// Executes one instruction starting at `cpu.get_pc()`.
///
/// Implements the five-step contract: optional cycle-limit check, fetch+decode,
/// condition evaluation, dispatch, and cycle increment. Returns `Err` for VM-integrity
/// failures (undefined instruction, memory fault, security violation); the caller (the VM
/// owning this step) is responsible for leaving the state in `Error` and NOT advancing PC in
/// that case.
pub fn step(
    cpu: &mut Cpu,
    memory: &mut Memory,
    swi: &mut SwiBridge,
    cycle_limit: Option<u64>,
) -> Result<StepOutcome, ExecError> {
    if let Some(limit) = cycle_limit {
        if cpu.cycles >= limit {
            return Err(ExecError::CycleLimitExceeded { limit });
        }
    }

    let pc = cpu.get_pc();
    memory.set_cycle(cpu.cycles);
    let opcode = memory.read_code_word(pc)?;
    let decoded = decode::decode(opcode, pc);

    if !decoded.condition().evaluate(cpu.cpsr) {
        trace!("pc={pc:#010x} opcode={opcode:#010x} condition false, skipped");
        cpu.increment_pc();
        cpu.cycles += 1;
        return Ok(StepOutcome::Continue);
    }

    let outcome = match decoded {
        DecodedInstruction::DataProcessing { op, s, rn, rd, op2, .. } => {
            exec_data_processing(cpu, op, s, rn, rd, op2)
        }
        DecodedInstruction::Multiply { accumulate, s, rd, rn, rs, rm, .. } => {
            exec_multiply(cpu, accumulate, s, rd, rn, rs, rm)
        }
        DecodedInstruction::LoadStore { p, u, b, w, l, rn, rd, offset, .. } => {
            exec_load_store(cpu, memory, p, u, b, w, l, rn, rd, offset)
        }
        DecodedInstruction::BlockLoadStore { p, u, s: _, w, l, rn, register_list, .. } => {
            exec_block_transfer(cpu, memory, p, u, w, l, rn, register_list)
        }
        DecodedInstruction::Branch { link, offset, .. } => {
            exec_branch(cpu, link, offset);
            Ok(StepOutcome::Continue)
        }
        DecodedInstruction::Swi { imm24, .. } => exec_swi(cpu, memory, swi, imm24),
        DecodedInstruction::Undefined { opcode, .. } => {
            return Err(ExecError::UndefinedInstruction { address: pc, opcode })
        }
    }?;

    // Branches, PC-targeted data-processing/load/LDM, and SWI all set PC themselves; anything
    // else falls through to the normal +4 advance.
    if cpu.get_pc() == pc {
        cpu.increment_pc();
    }
    cpu.cycles += 1;
    Ok(outcome)
}

/// Computes the shifter operand's value and carry-out. `carry_out = None` means the current
/// carry flag is unaffected (used when S is clear, or per the ARM2 "unchanged carry" cases).
fn shifter_operand(cpu: &Cpu, op2: Operand2) -> (u32, Option<bool>) {
    match op2 {
        Operand2::Immediate { imm8, rotate } => decode::rotate_immediate(imm8, rotate),
        Operand2::Register(sr) => shifted_register_value(cpu, sr),
    }
}

fn shifted_register_value(cpu: &Cpu, sr: ShiftedRegister) -> (u32, Option<bool>) {
    let rm = cpu.get_register(sr.rm as usize);
    let (amount, is_register_shift) = match sr.amount {
        ShiftAmount::Immediate(amount) => (amount as u32, false),
        ShiftAmount::Register(rs) => (cpu.get_register(rs as usize) & 0xFF, true),
    };

    if is_register_shift && amount == 0 {
        return (rm, None);
    }
    if !is_register_shift && amount == 0 && sr.shift_type == ShiftType::Lsl {
        return (rm, None);
    }

    match sr.shift_type {
        ShiftType::Lsl => {
            if amount >= 32 {
                (0, Some(amount == 32 && rm & 1 != 0))
            } else {
                (rm << amount, Some((rm >> (32 - amount)) & 1 != 0))
            }
        }
        ShiftType::Lsr => {
            let amount = if !is_register_shift && amount == 0 { 32 } else { amount };
            if amount >= 32 {
                (0, Some(amount == 32 && rm & (1 << 31) != 0))
            } else {
                (rm >> amount, Some((rm >> (amount - 1)) & 1 != 0))
            }
        }
        ShiftType::Asr => {
            let amount = if !is_register_shift && amount == 0 { 32 } else { amount };
            if amount >= 32 {
                let bit = rm & (1 << 31) != 0;
                (if bit { u32::MAX } else { 0 }, Some(bit))
            } else {
                (((rm as i32) >> amount) as u32, Some((rm >> (amount - 1)) & 1 != 0))
            }
        }
        ShiftType::Ror => {
            if !is_register_shift && amount == 0 {
                // RRX: rotate right through carry by one bit.
                let carry_in = cpu.cpsr.c as u32;
                let value = (rm >> 1) | (carry_in << 31);
                (value, Some(rm & 1 != 0))
            } else {
                let amount = amount % 32;
                if amount == 0 {
                    (rm, Some(rm & (1 << 31) != 0))
                } else {
                    (rm.rotate_right(amount), Some((rm >> (amount - 1)) & 1 != 0))
                }
            }
        }
    }
}

/// `a + b + carry_in`, returning `(result, carry_out, overflow)`.
fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (r2, c2) = r1.overflowing_add(carry_in as u32);
    let carry_out = c1 | c2;
    let overflow = ((a ^ r2) & (b ^ r2)) & (1 << 31) != 0;
    (r2, carry_out, overflow)
}

fn exec_data_processing(
    cpu: &mut Cpu,
    op: DataOp,
    s: bool,
    rn: u8,
    rd: u8,
    op2: Operand2,
) -> Result<StepOutcome, ExecError> {
    let (shifter_value, shifter_carry) = shifter_operand(cpu, op2);
    let rn_val = cpu.get_register(rn as usize);

    let update_flags = s || op.is_test();

    let (result, carry_for_flags, overflow_for_flags): (u32, Option<bool>, Option<bool>) = match op
    {
        DataOp::And | DataOp::Tst => (rn_val & shifter_value, shifter_carry, None),
        DataOp::Eor | DataOp::Teq => (rn_val ^ shifter_value, shifter_carry, None),
        DataOp::Orr => (rn_val | shifter_value, shifter_carry, None),
        DataOp::Mov => (shifter_value, shifter_carry, None),
        DataOp::Bic => (rn_val & !shifter_value, shifter_carry, None),
        DataOp::Mvn => (!shifter_value, shifter_carry, None),
        DataOp::Add | DataOp::Cmn => {
            let (r, c, v) = add_with_carry(rn_val, shifter_value, false);
            (r, Some(c), Some(v))
        }
        DataOp::Adc => {
            let (r, c, v) = add_with_carry(rn_val, shifter_value, cpu.cpsr.c);
            (r, Some(c), Some(v))
        }
        DataOp::Sub | DataOp::Cmp => {
            let (r, c, v) = add_with_carry(rn_val, !shifter_value, true);
            (r, Some(c), Some(v))
        }
        DataOp::Sbc => {
            let (r, c, v) = add_with_carry(rn_val, !shifter_value, cpu.cpsr.c);
            (r, Some(c), Some(v))
        }
        DataOp::Rsb => {
            let (r, c, v) = add_with_carry(shifter_value, !rn_val, true);
            (r, Some(c), Some(v))
        }
        DataOp::Rsc => {
            let (r, c, v) = add_with_carry(shifter_value, !rn_val, cpu.cpsr.c);
            (r, Some(c), Some(v))
        }
    };

    if update_flags {
        cpu.cpsr.n = result & (1 << 31) != 0;
        cpu.cpsr.z = result == 0;
        if let Some(c) = carry_for_flags {
            cpu.cpsr.c = c;
        }
        if let Some(v) = overflow_for_flags {
            cpu.cpsr.v = v;
        }
    }

    if !op.is_test() {
        if rd as usize == PC {
            cpu.set_pc(result);
        } else {
            cpu.set_register(rd as usize, result);
        }
    }

    Ok(StepOutcome::Continue)
}

fn exec_multiply(
    cpu: &mut Cpu,
    accumulate: bool,
    s: bool,
    rd: u8,
    rn: u8,
    rs: u8,
    rm: u8,
) -> Result<StepOutcome, ExecError> {
    let a = cpu.get_register(rm as usize);
    let b = cpu.get_register(rs as usize);
    let mut result = a.wrapping_mul(b);
    if accumulate {
        result = result.wrapping_add(cpu.get_register(rn as usize));
    }
    cpu.set_register(rd as usize, result);
    if s {
        cpu.cpsr.n = result & (1 << 31) != 0;
        cpu.cpsr.z = result == 0;
        // C is UNPREDICTABLE on ARM2 for multiply; V is left unchanged.
    }
    Ok(StepOutcome::Continue)
}

fn effective_address(cpu: &Cpu, rn: u8, u: bool, offset: LoadStoreOffset) -> (u32, u32) {
    let base = cpu.get_register(rn as usize);
    let delta = match offset {
        LoadStoreOffset::Immediate(imm) => imm,
        LoadStoreOffset::Register(sr) => shifted_register_value(cpu, sr).0,
    };
    let indexed = if u { base.wrapping_add(delta) } else { base.wrapping_sub(delta) };
    (base, indexed)
}

#[allow(clippy::too_many_arguments)]
fn exec_load_store(
    cpu: &mut Cpu,
    memory: &mut Memory,
    p: bool,
    u: bool,
    b: bool,
    w: bool,
    l: bool,
    rn: u8,
    rd: u8,
    offset: LoadStoreOffset,
) -> Result<StepOutcome, ExecError> {
    let (base, indexed) = effective_address(cpu, rn, u, offset);
    let transfer_addr = if p { indexed } else { base };

    if l {
        let value = if b {
            memory.read_byte(transfer_addr)? as u32
        } else {
            // ARM2 rotates unaligned word loads rather than rejecting them.
            let raw = memory.read_word(transfer_addr & !0b11)?;
            let rotate_bits = (transfer_addr & 0b11) * 8;
            raw.rotate_right(rotate_bits)
        };
        if rd as usize == PC {
            cpu.set_pc(value);
        } else {
            cpu.set_register(rd as usize, value);
        }
    } else {
        let value = cpu.get_register(rd as usize);
        if b {
            memory.write_byte(transfer_addr, value as u8)?;
        } else {
            memory.write_word(transfer_addr & !0b11, value)?;
        }
    }

    // Writeback: post-indexed addressing always writes back; pre-indexed only if W is set.
    if !p || w {
        if rn as usize != PC {
            cpu.set_register(rn as usize, indexed);
        }
    }

    Ok(StepOutcome::Continue)
}

fn exec_block_transfer(
    cpu: &mut Cpu,
    memory: &mut Memory,
    p: bool,
    u: bool,
    w: bool,
    l: bool,
    rn: u8,
    register_list: u16,
) -> Result<StepOutcome, ExecError> {
    let count = register_list.count_ones();
    let base = cpu.get_register(rn as usize);

    // Lowest transferred address for each of the four addressing modes (IA/IB/DA/DB).
    let lowest = if u {
        base.wrapping_add(if p { 4 } else { 0 })
    } else {
        base.wrapping_sub(count * 4).wrapping_add(if p { 0 } else { 4 })
    };

    let mut addr = lowest;
    for i in 0..16u8 {
        if register_list & (1 << i) == 0 {
            continue;
        }
        if l {
            let value = memory.read_word(addr)?;
            if i as usize == PC {
                cpu.set_pc(value);
            } else {
                cpu.set_register(i as usize, value);
            }
        } else {
            let value = cpu.get_register(i as usize);
            memory.write_word(addr, value)?;
        }
        addr = addr.wrapping_add(4);
    }

    if w && rn as usize != PC {
        let new_base = if u { base.wrapping_add(count * 4) } else { base.wrapping_sub(count * 4) };
        cpu.set_register(rn as usize, new_base);
    }

    Ok(StepOutcome::Continue)
}

fn exec_branch(cpu: &mut Cpu, link: bool, offset: i32) {
    let pc = cpu.get_pc();
    let target = (pc as i64 + 8 + offset as i64) as u32;
    if link {
        cpu.set_register(LR, pc.wrapping_add(4));
    }
    cpu.set_pc(target);
}

fn exec_swi(
    cpu: &mut Cpu,
    memory: &mut Memory,
    swi: &mut SwiBridge,
    imm24: u32,
) -> Result<StepOutcome, ExecError> {
    // PC advance for the non-PcAlreadySet cases is handled uniformly by the caller (`step`),
    // which only advances PC when the dispatched instruction left it untouched.
    match swi.dispatch(cpu, memory, imm24)? {
        SwiOutcome::Continue => Ok(StepOutcome::Continue),
        SwiOutcome::PcAlreadySet => Ok(StepOutcome::Continue),
        SwiOutcome::Exit { exit_code } => Ok(StepOutcome::Halted { exit_code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::memory::{Memory, CODE_BASE};
    use crate::swi::SwiBridge;

    fn setup() -> (Cpu, Memory, SwiBridge) {
        let cpu = Cpu::new();
        let memory = Memory::with_default_layout();
        let swi = SwiBridge::new();
        (cpu, memory, swi)
    }

    fn install(memory: &mut Memory, addr: u32, opcode: u32) {
        memory.load_bytes(addr, &opcode.to_le_bytes()).unwrap();
    }

    #[test]
    fn mov_and_swi_exit() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        // MOV R0, #42
        install(&mut memory, CODE_BASE, 0xE3A0_002A);
        // SWI #0
        install(&mut memory, CODE_BASE + 4, 0xEF00_0000);

        let r1 = step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(r1, StepOutcome::Continue);
        assert_eq!(cpu.get_register(0), 42);

        let r2 = step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(r2, StepOutcome::Halted { exit_code: 42 });
        assert_eq!(cpu.cycles, 2);
    }

    #[test]
    fn adds_sets_flags_on_unsigned_overflow() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        // MOV R0, #0xFF, ROR#0 won't reach 0xFFFFFFFF via 8-bit immediate+rotate; use rotate=0
        // with value encoded for 0xFFFFFFFF: imm8=0xFF rotate=2*? Actually 0xFFFFFFFF is not
        // representable as a rotated 8-bit immediate either: build it via MVN R0, #0 instead.
        // MVN R0, #0
        install(&mut memory, CODE_BASE, 0xE3E0_0000);
        // ADDS R1, R0, #1
        install(&mut memory, CODE_BASE + 4, 0xE290_1001);
        // SWI #0
        install(&mut memory, CODE_BASE + 8, 0xEF00_0000);

        step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(cpu.get_register(0), 0xFFFF_FFFF);
        step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(cpu.get_register(1), 0);
        assert!(cpu.cpsr.z);
        assert!(cpu.cpsr.c);
        assert!(!cpu.cpsr.n);
        assert!(!cpu.cpsr.v);
    }

    #[test]
    fn conditional_branch_taken() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        // MOV R0, #5
        install(&mut memory, CODE_BASE, 0xE3A0_0005);
        // CMP R0, #5
        install(&mut memory, CODE_BASE + 4, 0xE350_0005);
        // BEQ target (skip the next MOV, landing on CODE_BASE+16)
        install(&mut memory, CODE_BASE + 8, 0x0A00_0000);
        // MOV R1, #1 (skipped)
        install(&mut memory, CODE_BASE + 12, 0xE3A0_1001);
        // MOV R1, #2 (target)
        install(&mut memory, CODE_BASE + 16, 0xE3A0_1002);

        for _ in 0..4 {
            step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        }
        assert_eq!(cpu.get_register(1), 2);
    }

    #[test]
    fn bl_sets_link_register() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        // BL +8 (call sub at CODE_BASE+16)
        install(&mut memory, CODE_BASE, 0xEB00_0002);
        // MOV R0, #1 (return site)
        install(&mut memory, CODE_BASE + 4, 0xE3A0_0001);
        // SWI #0
        install(&mut memory, CODE_BASE + 8, 0xEF00_0000);
        // padding
        install(&mut memory, CODE_BASE + 12, 0xE1A0_0000);
        // sub: MOV R0, #7
        install(&mut memory, CODE_BASE + 16, 0xE3A0_0007);
        // MOV PC, LR
        install(&mut memory, CODE_BASE + 20, 0xE1A0_F00E);

        step(&mut cpu, &mut memory, &mut swi, None).unwrap(); // BL
        assert_eq!(cpu.get_pc(), CODE_BASE + 16);
        assert_eq!(cpu.get_register(LR), CODE_BASE + 4);
        step(&mut cpu, &mut memory, &mut swi, None).unwrap(); // MOV R0,#7
        step(&mut cpu, &mut memory, &mut swi, None).unwrap(); // MOV PC,LR
        assert_eq!(cpu.get_pc(), CODE_BASE + 4);
        step(&mut cpu, &mut memory, &mut swi, None).unwrap(); // MOV R0,#1
        assert_eq!(cpu.get_register(0), 1);
    }

    #[test]
    fn undefined_instruction_errors_without_advancing_pc() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        install(&mut memory, CODE_BASE, 0xE600_0010); // undefined encoding
        let err = step(&mut cpu, &mut memory, &mut swi, None).unwrap_err();
        assert!(matches!(err, ExecError::UndefinedInstruction { .. }));
        assert_eq!(cpu.get_pc(), CODE_BASE);
    }

    #[test]
    fn cycle_limit_exceeded() {
        let (mut cpu, mut memory, mut swi) = setup();
        cpu.set_pc(CODE_BASE);
        install(&mut memory, CODE_BASE, 0xE1A0_0000); // NOP (MOV R0,R0)
        assert!(step(&mut cpu, &mut memory, &mut swi, Some(0)).is_err());
    }
}
