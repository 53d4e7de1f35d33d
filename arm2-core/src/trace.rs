//! Execution tracing and performance counters. Memory writes are already captured
//! by [`crate::memory::Memory`]'s own write log; this module covers per-step execution
//! snapshots and aggregate statistics.

use std::time::Instant;

use crate::cpu::{Cpsr, Cpu, NUM_REGISTERS};
use crate::decode::DecodedInstruction;

/// One entry in an [`ExecutionTrace`]: register state and the decoded instruction before a
/// step, and the register deltas plus flags after it.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub sequence: u64,
    pub address: u32,
    pub opcode: u32,
    pub disasm: String,
    pub register_snapshot: [u32; NUM_REGISTERS],
    pub register_changes: Vec<(usize, u32, u32)>,
    pub flags_after: Cpsr,
}

/// Bounded, drop-oldest ring buffer of per-step traces.
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
    capacity: usize,
    next_sequence: u64,
    pending: Option<(u32, u32, String, [u32; NUM_REGISTERS])>,
}

impl ExecutionTrace {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity, next_sequence: 0, pending: None }
    }

    /// Called before a step executes.
    pub fn before_step(&mut self, cpu: &Cpu, address: u32, opcode: u32, decoded: &DecodedInstruction) {
        self.pending = Some((address, opcode, disassemble(decoded), *cpu.registers_raw()));
    }

    /// Called after the step completes; computes the diff against the snapshot taken in
    /// [`Self::before_step`]. Does nothing if `before_step` was not called first.
    pub fn after_step(&mut self, cpu: &Cpu) {
        let Some((address, opcode, disasm, before)) = self.pending.take() else { return };
        let after = cpu.registers_raw();
        let mut changes = Vec::new();
        for i in 0..NUM_REGISTERS {
            if before[i] != after[i] {
                changes.push((i, before[i], after[i]));
            }
        }
        let entry = TraceEntry {
            sequence: self.next_sequence,
            address,
            opcode,
            disasm,
            register_snapshot: before,
            register_changes: changes,
            flags_after: cpu.cpsr,
        };
        self.next_sequence += 1;
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_sequence = 0;
        self.pending = None;
    }
}

/// A very small mnemonic renderer, enough for trace/debugger display; not a full disassembler.
pub fn disassemble(decoded: &DecodedInstruction) -> String {
    match decoded {
        DecodedInstruction::DataProcessing { op, rd, .. } => format!("{op:?} R{rd}, ..."),
        DecodedInstruction::Multiply { rd, .. } => format!("MUL R{rd}, ..."),
        DecodedInstruction::LoadStore { l, rd, .. } => {
            format!("{} R{rd}, [...]", if *l { "LDR" } else { "STR" })
        }
        DecodedInstruction::BlockLoadStore { l, rn, .. } => {
            format!("{} R{rn}, {{...}}", if *l { "LDM" } else { "STM" })
        }
        DecodedInstruction::Branch { link, .. } => if *link { "BL ...".to_string() } else { "B ...".to_string() },
        DecodedInstruction::Swi { imm24, .. } => format!("SWI #{imm24:#x}"),
        DecodedInstruction::Undefined { opcode, .. } => format!("UNDEFINED {opcode:#010x}"),
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpcodeCategory {
    DataProcessing,
    Multiply,
    LoadStore,
    BlockLoadStore,
    Branch,
    Swi,
    Undefined,
}

impl From<&DecodedInstruction> for OpcodeCategory {
    fn from(d: &DecodedInstruction) -> Self {
        match d {
            DecodedInstruction::DataProcessing { .. } => OpcodeCategory::DataProcessing,
            DecodedInstruction::Multiply { .. } => OpcodeCategory::Multiply,
            DecodedInstruction::LoadStore { .. } => OpcodeCategory::LoadStore,
            DecodedInstruction::BlockLoadStore { .. } => OpcodeCategory::BlockLoadStore,
            DecodedInstruction::Branch { .. } => OpcodeCategory::Branch,
            DecodedInstruction::Swi { .. } => OpcodeCategory::Swi,
            DecodedInstruction::Undefined { .. } => OpcodeCategory::Undefined,
        }
    }
}

/// Aggregate counters for a run; IPS is derived at read time from wall-clock elapsed.
#[derive(Debug, Clone)]
pub struct PerformanceStatistics {
    pub total_instructions: u64,
    pub total_cycles: u64,
    pub data_processing: u64,
    pub multiply: u64,
    pub load_store: u64,
    pub block_load_store: u64,
    pub branches_taken: u64,
    pub branches_not_taken: u64,
    pub swi: u64,
    pub memory_reads: u64,
    pub memory_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    started_at: Instant,
}

impl Default for PerformanceStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceStatistics {
    pub fn new() -> Self {
        Self {
            total_instructions: 0,
            total_cycles: 0,
            data_processing: 0,
            multiply: 0,
            load_store: 0,
            block_load_store: 0,
            branches_taken: 0,
            branches_not_taken: 0,
            swi: 0,
            memory_reads: 0,
            memory_writes: 0,
            bytes_read: 0,
            bytes_written: 0,
            started_at: Instant::now(),
        }
    }

    /// Resets all counters; called whenever statistics collection is (re-)enabled mid-run.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_step(&mut self, category: OpcodeCategory, condition_true: bool, cycles_added: u64) {
        self.total_instructions += 1;
        self.total_cycles += cycles_added;
        match category {
            OpcodeCategory::DataProcessing => self.data_processing += 1,
            OpcodeCategory::Multiply => self.multiply += 1,
            OpcodeCategory::LoadStore => self.load_store += 1,
            OpcodeCategory::BlockLoadStore => self.block_load_store += 1,
            OpcodeCategory::Swi => self.swi += 1,
            OpcodeCategory::Branch => {
                if condition_true {
                    self.branches_taken += 1;
                } else {
                    self.branches_not_taken += 1;
                }
            }
            OpcodeCategory::Undefined => {}
        }
    }

    pub fn record_memory(&mut self, reads: u64, writes: u64, bytes_read: u64, bytes_written: u64) {
        self.memory_reads = reads;
        self.memory_writes = writes;
        self.bytes_read = bytes_read;
        self.bytes_written = bytes_written;
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn instructions_per_second(&self) -> f64 {
        let elapsed = self.elapsed_seconds();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.total_instructions as f64 / elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[test]
    fn trace_ring_buffer_drops_oldest() {
        let mut trace = ExecutionTrace::new(2);
        let mut cpu = Cpu::new();
        for i in 0..3u32 {
            let decoded = decode(0xE1A0_0000, 0);
            trace.before_step(&cpu, 0x8000 + i * 4, 0xE1A0_0000, &decoded);
            cpu.set_register(0, i);
            trace.after_step(&cpu);
        }
        assert_eq!(trace.entries().len(), 2);
        assert_eq!(trace.entries()[0].sequence, 1);
        assert_eq!(trace.entries()[1].sequence, 2);
    }

    #[test]
    fn register_changes_capture_diff() {
        let mut trace = ExecutionTrace::new(8);
        let mut cpu = Cpu::new();
        let decoded = decode(0xE3A0_002A, 0);
        trace.before_step(&cpu, 0x8000, 0xE3A0_002A, &decoded);
        cpu.set_register(0, 42);
        trace.after_step(&cpu);
        assert_eq!(trace.entries()[0].register_changes, vec![(0, 0, 42)]);
    }

    #[test]
    fn stats_reset_clears_counters() {
        let mut stats = PerformanceStatistics::new();
        stats.record_step(OpcodeCategory::DataProcessing, true, 1);
        assert_eq!(stats.total_instructions, 1);
        stats.reset();
        assert_eq!(stats.total_instructions, 0);
    }
}
