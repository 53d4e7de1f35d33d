//! Watchpoints: fire when a register or memory word's value changes, independent of the
//! requested access kind -- the executor has no instruction-level read/write hooks to attach to,
//! so watchpoints are evaluated by comparison after each step.

use std::sync::Mutex;

use arm2_core::vm::Vm;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum WatchTarget {
    Register(usize),
    Memory(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watchpoint {
    pub id: u64,
    pub kind: WatchKind,
    pub target: WatchTarget,
    pub enabled: bool,
    pub last_value: u32,
    pub hit_count: u64,
}

fn read_target(vm: &Vm, target: WatchTarget) -> u32 {
    match target {
        WatchTarget::Register(n) => vm.cpu.registers_raw()[n],
        WatchTarget::Memory(addr) => vm.memory.read_range(addr, 4).ok().map_or(0, |bytes| {
            u32::from_le_bytes(bytes.try_into().unwrap())
        }),
    }
}

struct Inner {
    watchpoints: Vec<Watchpoint>,
    next_id: u64,
}

/// Guarded the same way as [`crate::breakpoint::BreakpointManager`]: additions/removals can race
/// with the executor thread's per-step scan.
pub struct WatchpointManager {
    inner: Mutex<Inner>,
}

impl Default for WatchpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchpointManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { watchpoints: Vec::new(), next_id: 1 }) }
    }

    /// Adds a watchpoint, seeding `last_value` from `vm`'s current state so the first
    /// `check_watchpoints` call after arming does not spuriously fire.
    pub fn add(&self, vm: &Vm, kind: WatchKind, target: WatchTarget) -> Watchpoint {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let wp = Watchpoint {
            id,
            kind,
            target,
            enabled: true,
            last_value: read_target(vm, target),
            hit_count: 0,
        };
        inner.watchpoints.push(wp.clone());
        wp
    }

    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let len_before = inner.watchpoints.len();
        inner.watchpoints.retain(|w| w.id != id);
        inner.watchpoints.len() != len_before
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.watchpoints.iter_mut().find(|w| w.id == id) {
            Some(w) => {
                w.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get_all(&self) -> Vec<Watchpoint> {
        self.inner.lock().unwrap().watchpoints.clone()
    }

    /// Scans all enabled watchpoints against `vm`'s current state. Updates every watchpoint's
    /// `last_value`, increments `hit_count` for every one whose value changed, and returns a copy
    /// of the first that changed (in insertion order), if any.
    pub fn check_watchpoints(&self, vm: &Vm) -> Option<Watchpoint> {
        let mut inner = self.inner.lock().unwrap();
        let mut first_hit = None;
        for w in inner.watchpoints.iter_mut().filter(|w| w.enabled) {
            let current = read_target(vm, w.target);
            if current != w.last_value {
                w.last_value = current;
                w.hit_count += 1;
                if first_hit.is_none() {
                    first_hit = Some(w.clone());
                }
            }
        }
        first_hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm2_core::memory::DATA_BASE;

    #[test]
    fn register_change_is_detected() {
        let mut vm = Vm::new();
        let mgr = WatchpointManager::new();
        mgr.add(&vm, WatchKind::ReadWrite, WatchTarget::Register(0));
        assert!(mgr.check_watchpoints(&vm).is_none());
        vm.cpu.set_register(0, 7);
        let hit = mgr.check_watchpoints(&vm).unwrap();
        assert_eq!(hit.hit_count, 1);
        assert!(mgr.check_watchpoints(&vm).is_none());
    }

    #[test]
    fn memory_change_is_detected() {
        let mut vm = Vm::new();
        let mgr = WatchpointManager::new();
        mgr.add(&vm, WatchKind::Write, WatchTarget::Memory(DATA_BASE));
        vm.memory.write_word(DATA_BASE, 0x1234).unwrap();
        let hit = mgr.check_watchpoints(&vm).unwrap();
        assert_eq!(hit.last_value, 0x1234);
    }

    #[test]
    fn disabled_watchpoint_is_skipped() {
        let mut vm = Vm::new();
        let mgr = WatchpointManager::new();
        let wp = mgr.add(&vm, WatchKind::ReadWrite, WatchTarget::Register(0));
        mgr.set_enabled(wp.id, false);
        vm.cpu.set_register(0, 99);
        assert!(mgr.check_watchpoints(&vm).is_none());
    }

    #[test]
    fn delete_removes_watchpoint() {
        let vm = Vm::new();
        let mgr = WatchpointManager::new();
        let wp = mgr.add(&vm, WatchKind::ReadWrite, WatchTarget::Register(1));
        assert!(mgr.delete(wp.id));
        assert_eq!(mgr.get_all().len(), 0);
    }
}
