//! Shared application state handed to every handler via axum's `State` extractor.

use std::path::PathBuf;
use std::sync::Arc;

use arm2_session::{BroadcasterHandle, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub broadcaster: BroadcasterHandle,
    pub examples_dir: PathBuf,
}

impl AppState {
    pub fn new(fs_root: Option<PathBuf>, examples_dir: PathBuf) -> Self {
        Self::with_cycle_limit(fs_root, examples_dir, None)
    }

    pub fn with_cycle_limit(fs_root: Option<PathBuf>, examples_dir: PathBuf, cycle_limit: Option<u64>) -> Self {
        let broadcaster = arm2_session::broadcaster::spawn();
        let sessions = Arc::new(SessionManager::with_cycle_limit(broadcaster.clone(), fs_root, cycle_limit));
        Self { sessions, broadcaster, examples_dir }
    }
}
