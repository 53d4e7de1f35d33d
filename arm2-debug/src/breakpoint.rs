//! Breakpoint storage and the atomic "process hit" operation.

use std::sync::Mutex;

use serde::Serialize;

/// One breakpoint. `id` is stable and monotonically assigned; `address` is unique per manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: u64,
    pub address: u32,
    pub enabled: bool,
    pub temporary: bool,
    pub condition_text: Option<String>,
    pub hit_count: u64,
}

struct Inner {
    breakpoints: Vec<Breakpoint>,
    next_id: u64,
}

/// Guarded by an internal mutex: debugger commands (add/delete/enable) can race with the
/// executor's `ShouldBreak` lookups on another thread.
pub struct BreakpointManager {
    inner: Mutex<Inner>,
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { breakpoints: Vec::new(), next_id: 1 }) }
    }

    /// Adds a breakpoint at `address`. If one already exists there, it is updated in place:
    /// `temporary`/`condition` are replaced, `enabled` is reset to `true`, and the existing
    /// `id` is preserved.
    pub fn add(&self, address: u32, temporary: bool, condition: Option<String>) -> Breakpoint {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.breakpoints.iter_mut().find(|b| b.address == address) {
            existing.enabled = true;
            existing.temporary = temporary;
            existing.condition_text = condition;
            return existing.clone();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let bp = Breakpoint {
            id,
            address,
            enabled: true,
            temporary,
            condition_text: condition,
            hit_count: 0,
        };
        inner.breakpoints.push(bp.clone());
        bp
    }

    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let len_before = inner.breakpoints.len();
        inner.breakpoints.retain(|b| b.id != id);
        inner.breakpoints.len() != len_before
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.breakpoints.iter_mut().find(|b| b.id == id) {
            Some(b) => {
                b.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get_by_address(&self, address: u32) -> Option<Breakpoint> {
        self.inner.lock().unwrap().breakpoints.iter().find(|b| b.address == address).cloned()
    }

    pub fn get_all(&self) -> Vec<Breakpoint> {
        self.inner.lock().unwrap().breakpoints.clone()
    }

    /// Atomically increments `hit_count`, returns a copy of the breakpoint as it was at the
    /// moment of the hit, and deletes it if temporary. Returns `None` if `address` has no
    /// breakpoint (the caller should not call this speculatively).
    pub fn process_hit(&self, address: u32) -> Option<Breakpoint> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.breakpoints.iter().position(|b| b.address == address)?;
        inner.breakpoints[idx].hit_count += 1;
        let snapshot = inner.breakpoints[idx].clone();
        if snapshot.temporary {
            inner.breakpoints.remove(idx);
        }
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_delete_clears_lookup() {
        let mgr = BreakpointManager::new();
        let bp = mgr.add(0x8000, false, None);
        assert!(mgr.get_by_address(0x8000).is_some());
        assert!(mgr.delete(bp.id));
        assert!(mgr.get_by_address(0x8000).is_none());
    }

    #[test]
    fn re_adding_at_existing_address_preserves_id() {
        let mgr = BreakpointManager::new();
        let first = mgr.add(0x8000, false, None);
        let second = mgr.add(0x8000, true, Some("r0 == 1".to_string()));
        assert_eq!(first.id, second.id);
        assert!(second.temporary);
    }

    #[test]
    fn process_hit_is_atomic_and_removes_temporary() {
        let mgr = BreakpointManager::new();
        mgr.add(0x8000, true, None);
        let hit = mgr.process_hit(0x8000).unwrap();
        assert_eq!(hit.hit_count, 1);
        assert!(mgr.get_by_address(0x8000).is_none());
    }

    #[test]
    fn process_hit_on_permanent_breakpoint_keeps_it() {
        let mgr = BreakpointManager::new();
        mgr.add(0x8000, false, None);
        mgr.process_hit(0x8000);
        mgr.process_hit(0x8000);
        assert_eq!(mgr.get_by_address(0x8000).unwrap().hit_count, 2);
    }
}
