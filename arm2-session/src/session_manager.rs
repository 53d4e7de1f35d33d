//! Process-wide session registry: a mutex-guarded map keyed by a 128-bit CSPRNG id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::RngCore;

use crate::broadcaster::BroadcasterHandle;
use crate::service::Service;

pub struct SessionManager {
    broadcaster: BroadcasterHandle,
    fs_root: Option<PathBuf>,
    default_cycle_limit: Option<u64>,
    sessions: Mutex<HashMap<String, Arc<Service>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session id collision")]
    IdCollision,
    #[error("no session with id {0}")]
    NotFound(String),
}

/// 128 bits of entropy, hex-encoded. No `uuid` crate in the dependency graph, so this is
/// hand-rolled rather than pulling one in for four lines of logic.
fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SessionManager {
    pub fn new(broadcaster: BroadcasterHandle, fs_root: Option<PathBuf>) -> Self {
        Self::with_cycle_limit(broadcaster, fs_root, None)
    }

    /// `default_cycle_limit` is applied to every session this manager creates; `None` leaves
    /// each session's VM at its own built-in default cycle limit.
    pub fn with_cycle_limit(
        broadcaster: BroadcasterHandle,
        fs_root: Option<PathBuf>,
        default_cycle_limit: Option<u64>,
    ) -> Self {
        Self { broadcaster, fs_root, default_cycle_limit, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn create(&self) -> Result<Arc<Service>, SessionError> {
        let id = random_session_id();
        let service = Service::new(id.clone(), self.broadcaster.clone(), self.fs_root.clone());
        service.set_cycle_limit(self.default_cycle_limit);
        let service = Arc::new(service);
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&id) {
            return Err(SessionError::IdCollision);
        }
        sessions.insert(id, service.clone());
        Ok(service)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().remove(id).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_destroy_roundtrip() {
        let mgr = SessionManager::new(crate::broadcaster::spawn(), None);
        let svc = mgr.create().unwrap();
        let id = svc.session_id().to_string();
        assert!(mgr.get(&id).is_some());
        assert_eq!(mgr.count(), 1);
        assert!(mgr.destroy(&id));
        assert!(mgr.get(&id).is_none());
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn ids_are_distinct() {
        let mgr = SessionManager::new(crate::broadcaster::spawn(), None);
        let a = mgr.create().unwrap();
        let b = mgr.create().unwrap();
        assert_ne!(a.session_id(), b.session_id());
    }
}
