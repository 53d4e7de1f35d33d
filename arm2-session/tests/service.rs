//! Integration tests exercising the `Service` façade and `SessionManager` the way the HTTP
//! layer drives them, as opposed to the unit tests beside the implementation.

use arm2_core::memory::CODE_BASE;
use arm2_session::{broadcaster, Service, SessionManager};

fn new_service(id: &str) -> Service {
    Service::new(id.to_string(), broadcaster::spawn(), None)
}

#[tokio::test]
async fn assemble_run_and_observe_exit_code() {
    let svc = new_service("t1");
    svc.assemble_and_load("MOV R0, #7\nSWI #0\n", CODE_BASE).unwrap();
    svc.run_until_halt();
    assert_eq!(svc.register_state().status, "halted");
    assert_eq!(svc.exit_code(), Some(7));
}

#[tokio::test]
async fn mutating_calls_reject_while_a_run_is_in_progress() {
    let svc = new_service("t2");
    svc.assemble_and_load("loop: B loop\n", CODE_BASE).unwrap();
    svc.set_running(true);
    assert!(svc.reset().is_err());
    assert!(svc.step().is_err());
    assert!(svc.add_breakpoint(CODE_BASE, false, None).is_err());
    svc.set_running(false);
    assert!(svc.reset().is_ok());
}

#[tokio::test]
async fn session_manager_applies_its_default_cycle_limit() {
    let mgr = SessionManager::with_cycle_limit(broadcaster::spawn(), None, Some(5));
    let svc = mgr.create().unwrap();
    svc.assemble_and_load("loop: B loop\n", CODE_BASE).unwrap();
    svc.run_until_halt();
    assert_eq!(svc.register_state().status, "error");
}
