//! Watches the OS-reported parent pid and runs a shutdown callback if it changes (meaning the
//! parent that launched this process has died and been replaced, or the process was reparented
//! to init). Used by the CLI's serve mode to avoid outliving an IDE or supervisor that spawned it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[cfg(unix)]
fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

pub struct ProcessMonitor {
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProcessMonitor {
    /// Spawns the watchdog. `on_orphaned` runs once, the first time the parent pid is observed
    /// to change from its value at spawn time.
    pub fn spawn<F>(on_orphaned: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();
        let initial = parent_pid();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                if stopped_clone.load(Ordering::SeqCst) {
                    break;
                }
                let current = parent_pid();
                if current != initial {
                    warn!("parent pid changed from {initial} to {current}, shutting down");
                    on_orphaned();
                    break;
                }
            }
            info!("process monitor stopped");
        });

        Self { stopped, task }
    }

    /// Idempotent: calling this more than once, or after the watchdog already fired, is a no-op.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn reports_its_own_parent_pid() {
        assert_eq!(parent_pid(), unsafe { libc::getppid() as u32 });
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let monitor = ProcessMonitor::spawn(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        monitor.stop();
        monitor.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
