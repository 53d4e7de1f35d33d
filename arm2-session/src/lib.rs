//! Multi-session fabric around `arm2-core`: a per-session service façade, a process-wide
//! registry of sessions, an event broadcaster feeding WebSocket subscribers, and a watchdog
//! tying the server's lifetime to its parent process.

pub mod broadcaster;
pub mod output;
pub mod process_monitor;
pub mod service;
pub mod session_manager;

pub use broadcaster::{BroadcasterHandle, Event, EventKind, Subscriber};
pub use output::ConsoleBuffers;
pub use process_monitor::ProcessMonitor;
pub use service::{DisassembledLine, Service, ServiceError, StateSnapshot, StatsSnapshot};
pub use session_manager::{SessionError, SessionManager};
