//! Breakpoints, watchpoints, expression evaluation, and step-mode control for `arm2-core` VMs.

pub mod breakpoint;
pub mod debugger;
pub mod expr;
pub mod step_mode;
pub mod watchpoint;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use debugger::{Debugger, StopReason};
pub use expr::EvalError;
pub use step_mode::StepMode;
pub use watchpoint::{WatchKind, WatchTarget, Watchpoint, WatchpointManager};
