mod repl;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info};

use arm2_session::Service;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    /// Assemble and run to completion with no interaction, then exit.
    Run,
    /// Interactive line-oriented debugger on stdin/stdout.
    Debug,
    /// HTTP + WebSocket server (see `arm2-server`).
    Serve,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file to load. Required for `run` and `debug`; ignored for `serve`.
    source: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Run)]
    mode: Mode,

    /// Root directory guest filesystem SWIs are sandboxed to. Defaults to the current directory.
    #[arg(long = "fsroot")]
    fs_root: Option<PathBuf>,

    /// Address to load the program at.
    #[arg(long, default_value_t = arm2_core::memory::CODE_BASE)]
    origin: u32,

    /// Address to bind the HTTP server to (`serve` mode only).
    #[arg(long, default_value = "127.0.0.1:7878")]
    bind: SocketAddr,

    /// Directory of read-only `.s` example programs served over `/api/v1/examples`.
    #[arg(long, default_value = "assets/examples")]
    examples_dir: PathBuf,

    /// Caps total executed cycles before the VM is forced into an error state. Defaults to the
    /// VM's own built-in ceiling if unset.
    #[arg(long)]
    cycle_limit: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let exit_code = match args.mode {
        Mode::Serve => match serve(args) {
            Ok(()) => 0,
            Err(e) => {
                error!("{e:#}");
                3
            }
        },
        Mode::Run | Mode::Debug => {
            let rt = match tokio::runtime::Runtime::new().context("failed to start tokio runtime") {
                Ok(rt) => rt,
                Err(e) => {
                    error!("{e:#}");
                    std::process::exit(3);
                }
            };
            match rt.block_on(run_local(args)) {
                Ok(code) => code,
                Err(e) => {
                    error!("{e:#}");
                    3
                }
            }
        }
    };

    std::process::exit(exit_code);
}

fn serve(args: Args) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async move {
        let state = arm2_server::AppState::with_cycle_limit(args.fs_root, args.examples_dir, args.cycle_limit);
        let monitor = arm2_session::ProcessMonitor::spawn(|| {
            info!("parent process is gone, shutting down");
            std::process::exit(0);
        });
        let result = arm2_server::serve(args.bind, state).await;
        monitor.stop();
        result
    })?;
    Ok(())
}

async fn run_local(args: Args) -> Result<i32> {
    let source_path = args.source.as_ref().context("a source file is required in this mode")?;
    let source = std::fs::read_to_string(source_path)
        .with_context(|| format!("failed to read {}", source_path.display()))?;

    let broadcaster = arm2_session::broadcaster::spawn();
    let service = Service::new("local".to_string(), broadcaster, args.fs_root.clone());
    service.set_cycle_limit(args.cycle_limit);

    if let Err(e) = service.assemble_and_load(&source, args.origin) {
        error!("load failed: {e}");
        return Ok(2);
    }

    match args.mode {
        Mode::Run => Ok(run_to_completion(&service)),
        Mode::Debug => repl::run(&service),
        Mode::Serve => unreachable!(),
    }
}

/// Runs the loaded program to completion, mirroring the guest's own exit code on the process.
fn run_to_completion(service: &Service) -> i32 {
    service.run_until_halt();
    match service.register_state().status.as_str() {
        "halted" => service.exit_code().unwrap_or(0) & 0xFF,
        "error" => 1,
        _ => 0,
    }
}
