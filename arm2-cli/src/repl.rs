//! Line-oriented debugger: a thin stdin/stdout loop around [`arm2_session::Service`]'s existing
//! breakpoint/watchpoint/step/evaluate operations, in the spirit of a gdb-style console.

use std::io::Write;

use anyhow::Result;
use arm2_debug::{StopReason, WatchKind, WatchTarget};
use arm2_session::Service;

const HELP: &str = "\
commands:
  run                      continue until breakpoint, watchpoint, halt, or error
  step | s                 single instruction
  next | n                 step over a branch-and-link
  finish                   run until the current function returns
  break <addr> [if <expr>] set a breakpoint, optionally conditional
  delete <id>              remove a breakpoint or watchpoint by id
  watch <addr|reg>         add a read/write watchpoint
  info regs                print the register file
  info break               list breakpoints
  info watch               list watchpoints
  print <expr>             evaluate a debugger expression
  reset                    reload the program to its initial state
  quit | q                 exit the debugger";

pub fn run(service: &Service) -> Result<i32> {
    println!("arm2 debugger -- type 'help' for commands");
    let stdin = std::io::stdin();

    loop {
        print!("(arm2) ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            return Ok(0);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match dispatch(service, line) {
            Ok(Some(code)) => return Ok(code),
            Ok(None) => {}
            Err(e) => println!("error: {e}"),
        }
    }
}

fn dispatch(service: &Service, line: &str) -> Result<Option<i32>> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "help" | "h" | "?" => println!("{HELP}"),
        "quit" | "q" | "exit" => return Ok(Some(0)),
        "run" | "r" | "c" | "continue" => {
            let reason = service.run_until_halt();
            report_stop(service, &reason);
            if let Some(code) = terminal_exit_code(service) {
                return Ok(Some(code));
            }
        }
        "step" | "s" => {
            let reason = service.step()?;
            report_stop(service, &reason);
            if let Some(code) = terminal_exit_code(service) {
                return Ok(Some(code));
            }
        }
        "next" | "n" => {
            let reason = service.step_over()?;
            report_stop(service, &reason);
            if let Some(code) = terminal_exit_code(service) {
                return Ok(Some(code));
            }
        }
        "finish" => {
            let reason = service.step_out()?;
            report_stop(service, &reason);
            if let Some(code) = terminal_exit_code(service) {
                return Ok(Some(code));
            }
        }
        "reset" => service.reset()?,
        "break" | "b" => add_breakpoint(service, rest)?,
        "delete" | "d" => {
            let id: u64 = rest.trim().parse()?;
            let removed = if service.remove_breakpoint(id)? { true } else { service.remove_watchpoint(id)? };
            if !removed {
                println!("no breakpoint or watchpoint with id {id}");
            }
        }
        "watch" | "w" => add_watchpoint(service, rest)?,
        "info" => info_command(service, rest),
        "print" | "p" => {
            let value = service.evaluate(rest)?;
            println!("= {value} (0x{value:08x})");
        }
        other => println!("unknown command '{other}' (try 'help')"),
    }
    Ok(None)
}

fn terminal_exit_code(service: &Service) -> Option<i32> {
    match service.register_state().status.as_str() {
        "halted" => Some(service.exit_code().unwrap_or(0) & 0xFF),
        "error" => Some(1),
        _ => None,
    }
}

fn report_stop(service: &Service, reason: &StopReason) {
    let state = service.register_state();
    match reason {
        StopReason::Breakpoint(bp) => println!("breakpoint {} hit at 0x{:08x}", bp.id, bp.address),
        StopReason::Watchpoint(wp) => println!("watchpoint {} changed to {}", wp.id, wp.last_value),
        StopReason::StepComplete => {}
        StopReason::VmStopped => {}
    }
    println!("pc=0x{:08x} status={}", state.pc, state.status);
}

fn add_breakpoint(service: &Service, rest: &str) -> Result<()> {
    let (addr_text, condition) = match rest.split_once(" if ") {
        Some((addr, cond)) => (addr.trim(), Some(cond.trim().to_string())),
        None => (rest.trim(), None),
    };
    let address = parse_addr(addr_text)?;
    let bp = service.add_breakpoint(address, false, condition)?;
    println!("breakpoint {} at 0x{:08x}", bp.id, bp.address);
    Ok(())
}

fn add_watchpoint(service: &Service, rest: &str) -> Result<()> {
    let target = if let Some(reg) = rest.strip_prefix('r').and_then(|n| n.parse::<usize>().ok()) {
        WatchTarget::Register(reg)
    } else {
        WatchTarget::Memory(parse_addr(rest)?)
    };
    let wp = service.add_watchpoint(WatchKind::ReadWrite, target)?;
    println!("watchpoint {}", wp.id);
    Ok(())
}

fn info_command(service: &Service, rest: &str) {
    match rest {
        "regs" | "registers" => {
            let state = service.register_state();
            for (i, r) in state.registers.iter().enumerate() {
                println!("r{i:<2} = 0x{r:08x}");
            }
            println!(
                "pc=0x{:08x} sp=0x{:08x} lr=0x{:08x} cycles={} flags=n{} z{} c{} v{}",
                state.pc,
                state.sp,
                state.lr,
                state.cycles,
                state.flags.n as u8,
                state.flags.z as u8,
                state.flags.c as u8,
                state.flags.v as u8
            );
        }
        "break" | "breaks" | "breakpoints" => {
            for bp in service.breakpoints() {
                println!("{:<4} 0x{:08x} hits={} enabled={}", bp.id, bp.address, bp.hit_count, bp.enabled);
            }
        }
        "watch" | "watches" | "watchpoints" => {
            for wp in service.watchpoints() {
                println!("{:<4} {:?} hits={} enabled={}", wp.id, wp.target, wp.hit_count, wp.enabled);
            }
        }
        other => println!("unknown 'info {other}' (try 'info regs', 'info break', 'info watch')"),
    }
}

fn parse_addr(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u32::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse::<u32>()?)
    }
}
