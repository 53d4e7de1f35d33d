//! A minimal two-pass assembler for a useful subset of ARM2 assembly.
//!
//! This is deliberately not a complete ARM assembler (see the crate's accompanying design
//! notes): it covers data-processing, single-word load/store, branch, multiply, and `SWI`
//! mnemonics with register/immediate operands, condition-code and `S` suffixes, and `:`-labels
//! -- enough to express the end-to-end scenarios this emulator is tested against and ordinary
//! hand-written example programs.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cpu::{LR, PC, SP};
use crate::program::ProgramImage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    #[error("line {line}: {message}")]
    Syntax { line: u32, message: String },
    #[error("line {line}: unknown label '{name}'")]
    UnknownLabel { line: u32, name: String },
    #[error("line {line}: immediate {value} cannot be encoded as a rotated 8-bit value")]
    ImmediateNotEncodable { line: u32, value: u32 },
    #[error("line {line}: branch target out of range")]
    BranchOutOfRange { line: u32 },
}

/// Assembles `source` into a [`ProgramImage`] at `origin`. Each non-empty, non-comment line is
/// either a `label:`, a `.word <value>` directive, or one instruction.
pub fn assemble(source: &str, origin: u32) -> Result<ProgramImage, AsmError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut symbols: BTreeMap<String, u32> = BTreeMap::new();
    let mut addr = origin;

    // Pass 1: record label addresses; each instruction/.word occupies 4 bytes.
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx as u32 + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            symbols.insert(label.trim().to_string(), addr);
            continue;
        }
        let _ = line_no;
        addr += 4;
    }

    // Pass 2: encode.
    let mut code = Vec::new();
    let mut image = ProgramImage::new(origin, Vec::new());
    let mut cursor = origin;
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx as u32 + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() || line.ends_with(':') {
            continue;
        }
        let word = encode_line(line, cursor, &symbols, line_no)?;
        code.extend_from_slice(&word.to_le_bytes());
        image.record_line(cursor, line_no);
        cursor += 4;
    }

    image.code = code;
    image.symbols = symbols;
    Ok(image)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn encode_line(
    line: &str,
    addr: u32,
    symbols: &BTreeMap<String, u32>,
    line_no: u32,
) -> Result<u32, AsmError> {
    if let Some(rest) = line.strip_prefix(".word") {
        let value = parse_immediate(rest.trim(), line_no)?;
        return Ok(value);
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let mnemonic_raw = parts.next().unwrap_or_default();
    let operands = parts.next().unwrap_or_default().trim();

    let (mnemonic, cond) = split_condition(mnemonic_raw);
    let cond_bits = cond as u32;

    match mnemonic.as_str() {
        "MOV" | "MVN" | "AND" | "ORR" | "EOR" | "BIC" | "ADD" | "ADC" | "SUB" | "SBC" | "RSB"
        | "RSC" | "CMP" | "CMN" | "TST" | "TEQ" | "MOVS" | "MVNS" | "ANDS" | "ORRS" | "EORS"
        | "BICS" | "ADDS" | "ADCS" | "SUBS" | "SBCS" | "RSBS" | "RSCS" => {
            encode_data_processing(&mnemonic, operands, symbols, line_no)
                .map(|v| v | (cond_bits << 28))
        }
        "MUL" | "MULS" => encode_multiply(&mnemonic, operands, line_no).map(|v| v | (cond_bits << 28)),
        "MLA" | "MLAS" => encode_mla(&mnemonic, operands, line_no).map(|v| v | (cond_bits << 28)),
        "LDR" | "STR" | "LDRB" | "STRB" => {
            encode_load_store(&mnemonic, operands, line_no).map(|v| v | (cond_bits << 28))
        }
        "B" | "BL" => encode_branch(&mnemonic, operands, addr, symbols, line_no)
            .map(|v| v | (cond_bits << 28)),
        "SWI" => {
            let imm = parse_immediate(operands, line_no)? & 0x00FF_FFFF;
            Ok((cond_bits << 28) | (0b1111 << 24) | imm)
        }
        other => Err(AsmError::Syntax { line: line_no, message: format!("unknown mnemonic '{other}'") }),
    }
}

fn split_condition(mnemonic: &str) -> (String, u8) {
    const CONDS: [(&str, u8); 15] = [
        ("EQ", 0x0), ("NE", 0x1), ("CS", 0x2), ("CC", 0x3), ("MI", 0x4), ("PL", 0x5),
        ("VS", 0x6), ("VC", 0x7), ("HI", 0x8), ("LS", 0x9), ("GE", 0xA), ("LT", 0xB),
        ("GT", 0xC), ("LE", 0xD), ("AL", 0xE),
    ];
    let upper = mnemonic.to_ascii_uppercase();
    for (suffix, bits) in CONDS {
        if let Some(base) = upper.strip_suffix(suffix) {
            if !base.is_empty() && is_known_base(base) {
                return (base.to_string(), bits);
            }
        }
    }
    (upper, 0xE)
}

fn is_known_base(base: &str) -> bool {
    matches!(
        base,
        "MOV" | "MVN" | "AND" | "ORR" | "EOR" | "BIC" | "ADD" | "ADC" | "SUB" | "SBC" | "RSB"
            | "RSC" | "CMP" | "CMN" | "TST" | "TEQ" | "MOVS" | "MVNS" | "ANDS" | "ORRS" | "EORS"
            | "BICS" | "ADDS" | "ADCS" | "SUBS" | "SBCS" | "RSBS" | "RSCS" | "MUL" | "MULS"
            | "MLA" | "MLAS" | "LDR" | "STR" | "LDRB" | "STRB" | "B" | "BL"
    )
}

fn parse_register(token: &str, line_no: u32) -> Result<u8, AsmError> {
    let t = token.trim().trim_end_matches(',').to_ascii_uppercase();
    match t.as_str() {
        "SP" => Ok(SP as u8),
        "LR" => Ok(LR as u8),
        "PC" => Ok(PC as u8),
        _ => {
            let digits = t.strip_prefix('R').ok_or_else(|| AsmError::Syntax {
                line: line_no,
                message: format!("expected register, found '{token}'"),
            })?;
            digits.parse::<u8>().map_err(|_| AsmError::Syntax {
                line: line_no,
                message: format!("bad register '{token}'"),
            })
        }
    }
}

fn parse_immediate(token: &str, line_no: u32) -> Result<u32, AsmError> {
    let t = token.trim().trim_start_matches('#').trim_end_matches(',');
    let (digits, radix) = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(neg) = t.strip_prefix('-') {
        return parse_immediate(neg, line_no).map(|v| (v as i64).wrapping_neg() as u32);
    } else {
        (t, 10)
    };
    u32::from_str_radix(digits, radix)
        .map_err(|_| AsmError::Syntax { line: line_no, message: format!("bad immediate '{token}'") })
}

/// Encodes a rotated-8-bit immediate, trying every even rotate amount (ARM2's shifter-operand
/// encoding for data-processing immediates).
fn encode_rotated_immediate(value: u32, line_no: u32) -> Result<(u8, u8), AsmError> {
    for rotate in 0..16u32 {
        let amount = rotate * 2;
        let rotated = value.rotate_left(amount);
        if rotated <= 0xFF {
            return Ok((rotated as u8, rotate as u8));
        }
    }
    Err(AsmError::ImmediateNotEncodable { line: line_no, value })
}

fn encode_data_processing(
    mnemonic: &str,
    operands: &str,
    _symbols: &BTreeMap<String, u32>,
    line_no: u32,
) -> Result<u32, AsmError> {
    let (base, s) = match mnemonic.strip_suffix('S') {
        Some(base) if is_known_base(base) && base != "B" => (base, true),
        _ => (mnemonic, false),
    };
    let op_bits: u32 = match base {
        "AND" => 0x0, "EOR" => 0x1, "SUB" => 0x2, "RSB" => 0x3, "ADD" => 0x4, "ADC" => 0x5,
        "SBC" => 0x6, "RSC" => 0x7, "TST" => 0x8, "TEQ" => 0x9, "CMP" => 0xA, "CMN" => 0xB,
        "ORR" => 0xC, "MOV" => 0xD, "BIC" => 0xE, "MVN" => 0xF,
        _ => return Err(AsmError::Syntax { line: line_no, message: format!("unknown op '{base}'") }),
    };
    let is_test = matches!(base, "TST" | "TEQ" | "CMP" | "CMN");
    let is_unary = matches!(base, "MOV" | "MVN");

    let tokens: Vec<&str> = operands.split(',').map(str::trim).collect();
    let (rd, rn, op2_token) = if is_test {
        (0u8, parse_register(tokens[0], line_no)?, tokens.get(1).copied().unwrap_or_default())
    } else if is_unary {
        (parse_register(tokens[0], line_no)?, 0u8, tokens.get(1).copied().unwrap_or_default())
    } else {
        (
            parse_register(tokens[0], line_no)?,
            parse_register(tokens[1], line_no)?,
            tokens.get(2).copied().unwrap_or_default(),
        )
    };

    let s_bit = if s || is_test { 1u32 } else { 0u32 };
    let mut word = (0b00 << 26) | (op_bits << 21) | (s_bit << 20) | ((rn as u32) << 16) | ((rd as u32) << 12);

    if let Some(imm) = op2_token.trim().strip_prefix('#') {
        let value = parse_immediate(imm, line_no)?;
        let (imm8, rotate) = encode_rotated_immediate(value, line_no)?;
        word |= 1 << 25;
        word |= (rotate as u32) << 8;
        word |= imm8 as u32;
    } else {
        let rm = parse_register(op2_token, line_no)?;
        word |= rm as u32;
    }
    Ok(word)
}

fn parse_three_registers(operands: &str, line_no: u32) -> Result<(u8, u8, u8), AsmError> {
    let tokens: Vec<&str> = operands.split(',').map(str::trim).collect();
    if tokens.len() < 3 {
        return Err(AsmError::Syntax { line: line_no, message: "expected 3 registers".to_string() });
    }
    Ok((
        parse_register(tokens[0], line_no)?,
        parse_register(tokens[1], line_no)?,
        parse_register(tokens[2], line_no)?,
    ))
}

fn encode_multiply(mnemonic: &str, operands: &str, line_no: u32) -> Result<u32, AsmError> {
    let s = mnemonic.ends_with('S');
    let (rd, rm, rs) = parse_three_registers(operands, line_no)?;
    Ok((0b000000 << 22)
        | ((s as u32) << 20)
        | ((rd as u32) << 16)
        | ((rs as u32) << 8)
        | (0b1001 << 4)
        | (rm as u32))
}

fn encode_mla(mnemonic: &str, operands: &str, line_no: u32) -> Result<u32, AsmError> {
    let s = mnemonic.ends_with('S');
    let tokens: Vec<&str> = operands.split(',').map(str::trim).collect();
    if tokens.len() < 4 {
        return Err(AsmError::Syntax { line: line_no, message: "expected 4 registers".to_string() });
    }
    let rd = parse_register(tokens[0], line_no)?;
    let rm = parse_register(tokens[1], line_no)?;
    let rs = parse_register(tokens[2], line_no)?;
    let rn = parse_register(tokens[3], line_no)?;
    Ok((0b0000001 << 21)
        | ((s as u32) << 20)
        | ((rd as u32) << 16)
        | ((rn as u32) << 12)
        | ((rs as u32) << 8)
        | (0b1001 << 4)
        | (rm as u32))
}

fn encode_load_store(mnemonic: &str, operands: &str, line_no: u32) -> Result<u32, AsmError> {
    let (base, byte) = match mnemonic.strip_suffix('B') {
        Some(b) if b == "LDR" || b == "STR" => (b, true),
        _ => (mnemonic, false),
    };
    let load = base == "LDR";

    let inner = operands
        .trim()
        .trim_start_matches(|c: char| c.is_whitespace())
        .split_once(',')
        .ok_or_else(|| AsmError::Syntax { line: line_no, message: "expected 'Rd, [Rn, #imm]'".to_string() })?;
    let rd = parse_register(inner.0, line_no)?;
    let addr_part = inner.1.trim().trim_start_matches('[').trim_end_matches(']');
    let addr_tokens: Vec<&str> = addr_part.split(',').map(str::trim).collect();
    let rn = parse_register(addr_tokens[0], line_no)?;
    let imm = if let Some(offset_tok) = addr_tokens.get(1) {
        let signed = offset_tok.trim_start_matches('#');
        let (value, negative) = if let Some(stripped) = signed.strip_prefix('-') {
            (parse_immediate(stripped, line_no)?, true)
        } else {
            (parse_immediate(signed, line_no)?, false)
        };
        (value, !negative)
    } else {
        (0u32, true)
    };

    let word = (0b01 << 26)
        | (1 << 24) // P: pre-indexed, offset addressing (no writeback)
        | ((imm.1 as u32) << 23) // U
        | ((byte as u32) << 22)
        | ((load as u32) << 20)
        | ((rn as u32) << 16)
        | ((rd as u32) << 12)
        | (imm.0 & 0xFFF);
    Ok(word)
}

fn encode_branch(
    mnemonic: &str,
    operands: &str,
    addr: u32,
    symbols: &BTreeMap<String, u32>,
    line_no: u32,
) -> Result<u32, AsmError> {
    let link = mnemonic == "BL";
    let label = operands.trim();
    let target = *symbols
        .get(label)
        .ok_or_else(|| AsmError::UnknownLabel { line: line_no, name: label.to_string() })?;
    let delta = (target as i64) - (addr as i64 + 8);
    if delta % 4 != 0 {
        return Err(AsmError::BranchOutOfRange { line: line_no });
    }
    let word_offset = delta / 4;
    if !(-(1 << 23)..(1 << 23)).contains(&word_offset) {
        return Err(AsmError::BranchOutOfRange { line: line_no });
    }
    let raw24 = (word_offset as u32) & 0x00FF_FFFF;
    Ok((0b101 << 25) | ((link as u32) << 24) | raw24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::decode::{decode, DataOp, DecodedInstruction};
    use crate::memory::{Memory, CODE_BASE};
    use crate::swi::SwiBridge;

    #[test]
    fn assembles_mov_and_swi_exit_scenario() {
        let source = "MOV R0, #42\nSWI #0\n";
        let image = assemble(source, CODE_BASE).unwrap();
        assert_eq!(image.code.len(), 8);

        let mut cpu = Cpu::new();
        let mut memory = Memory::with_default_layout();
        let mut swi = SwiBridge::new();
        memory.load_bytes(CODE_BASE, &image.code).unwrap();
        cpu.set_pc(CODE_BASE);
        crate::execute::step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(cpu.get_register(0), 42);
        let outcome = crate::execute::step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        assert_eq!(outcome, crate::execute::StepOutcome::Halted { exit_code: 42 });
    }

    #[test]
    fn assembles_conditional_branch_scenario() {
        let source = "MOV R0, #5\nCMP R0, #5\nBEQ target\nMOV R1, #1\nSWI #0\ntarget:\nMOV R1, #2\nSWI #0\n";
        let image = assemble(source, CODE_BASE).unwrap();
        let mut cpu = Cpu::new();
        let mut memory = Memory::with_default_layout();
        let mut swi = SwiBridge::new();
        memory.load_bytes(CODE_BASE, &image.code).unwrap();
        cpu.set_pc(CODE_BASE);
        for _ in 0..4 {
            crate::execute::step(&mut cpu, &mut memory, &mut swi, None).unwrap();
        }
        assert_eq!(cpu.get_register(1), 2);
    }

    #[test]
    fn decodes_assembled_add_as_data_processing() {
        let image = assemble("ADDS R1, R0, #1\n", CODE_BASE).unwrap();
        let opcode = u32::from_le_bytes(image.code[0..4].try_into().unwrap());
        match decode(opcode, CODE_BASE) {
            DecodedInstruction::DataProcessing { op: DataOp::Add, s, rd, rn, .. } => {
                assert!(s);
                assert_eq!(rd, 1);
                assert_eq!(rn, 0);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_label_is_an_error() {
        let err = assemble("BEQ nowhere\n", CODE_BASE).unwrap_err();
        assert!(matches!(err, AsmError::UnknownLabel { .. }));
    }

    #[test]
    fn immediate_requiring_no_rotation_roundtrips() {
        let image = assemble("MOV R0, #255\n", CODE_BASE).unwrap();
        let opcode = u32::from_le_bytes(image.code[0..4].try_into().unwrap());
        match decode(opcode, CODE_BASE) {
            DecodedInstruction::DataProcessing { op2, .. } => {
                assert_eq!(op2, crate::decode::Operand2::Immediate { imm8: 255, rotate: 0 });
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
