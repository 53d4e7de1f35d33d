//! SWI dispatch table: routes `SWI #imm24` to host services.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Instant;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::cpu::Cpu;
use crate::memory::{Memory, MemoryError};
use crate::sandbox::{self, SandboxError};

pub const EXIT: u32 = 0x00;
pub const WRITE_CHAR: u32 = 0x01;
pub const WRITE_INT: u32 = 0x02;
pub const WRITE_STRING: u32 = 0x03;
pub const WRITE_NEWLINE: u32 = 0x04;
pub const READ_CHAR: u32 = 0x10;
pub const READ_STRING: u32 = 0x11;
pub const OPEN: u32 = 0x20;
pub const CLOSE: u32 = 0x21;
pub const READ: u32 = 0x22;
pub const WRITE: u32 = 0x23;
pub const ALLOC: u32 = 0x30;
pub const TIME: u32 = 0x40;
pub const RANDOM: u32 = 0x41;

/// Longest guest string `WRITE_STRING` will consume before treating the unterminated run as a
/// VM-integrity error.
pub const MAX_STRING_LENGTH: u32 = 4096;
/// Ceiling on a single `READ`/`WRITE` transfer length.
pub const MAX_READ_SIZE: u32 = 1 << 20;
pub const MAX_WRITE_SIZE: u32 = 1 << 20;
/// Bounds the fd table's memory use.
pub const MAX_OPEN_FILES: usize = 1024;

const GUEST_SERVICE_FAILURE: u32 = 0xFFFF_FFFF;

#[derive(Error, Debug)]
pub enum SwiError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("guest string at {address:#010x} exceeds the {limit}-byte limit or wrapped the address space")]
    StringTooLong { address: u32, limit: u32 },
    #[error("sandbox violation: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("unknown SWI number {0:#x}")]
    UnknownSwi(u32),
}

/// Result of dispatching one SWI, fed back into the executor's PC-advance logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwiOutcome {
    Continue,
    PcAlreadySet,
    Exit { exit_code: i32 },
}

/// Destination for guest console output. `Session`-owning callers (the `arm2-session` crate)
/// implement this over a buffer+broadcast sink; tests and headless runs can use
/// [`NullSink`]/[`CollectingSink`].
pub trait OutputSink: Send {
    fn write(&mut self, stream: OutputStream, data: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Discards all output; the default when no sink is attached.
#[derive(Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _stream: OutputStream, _data: &[u8]) {}
}

/// Buffers output in memory; useful for headless runs and tests.
#[derive(Default)]
pub struct CollectingSink {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl OutputSink for CollectingSink {
    fn write(&mut self, stream: OutputStream, data: &[u8]) {
        match stream {
            OutputStream::Stdout => self.stdout.extend_from_slice(data),
            OutputStream::Stderr => self.stderr.extend_from_slice(data),
        }
    }
}

/// The guest-facing end of a stdin pipe: `READ_CHAR`/`READ_STRING` block (synchronously, from
/// the VM's perspective) on this receiver until bytes are enqueued via [`StdinHandle::send`].
pub struct Stdin {
    rx: mpsc::Receiver<u8>,
}

/// The host-facing end; `SendInput` HTTP/CLI commands push bytes here.
#[derive(Clone)]
pub struct StdinHandle {
    tx: mpsc::Sender<u8>,
}

pub fn stdin_channel() -> (StdinHandle, Stdin) {
    let (tx, rx) = mpsc::channel();
    (StdinHandle { tx }, Stdin { rx })
}

impl StdinHandle {
    pub fn send(&self, text: &str) {
        for b in text.bytes() {
            let _ = self.tx.send(b);
        }
    }
}

impl Default for Stdin {
    fn default() -> Self {
        let (_tx, rx) = mpsc::channel();
        Stdin { rx }
    }
}

impl Stdin {
    fn read_byte_blocking(&self) -> Option<u8> {
        self.rx.recv().ok()
    }
}

enum OpenFile {
    Read(File),
    Write(File),
}

/// Host-services bridge reachable from guest code via `SWI`. Owns the fd table, the output
/// sink, the stdin pipe, and the sandbox root; everything here is process-local state specific
/// to one VM instance, so each session can be given its own output destination and stdin feed.
pub struct SwiBridge {
    fs_root: Option<PathBuf>,
    files: Vec<Option<OpenFile>>,
    output: Box<dyn OutputSink>,
    stdin: Stdin,
    start: Instant,
    rng: StdRng,
}

impl SwiBridge {
    pub fn new() -> Self {
        Self {
            fs_root: None,
            files: Vec::new(),
            output: Box::new(NullSink),
            stdin: Stdin::default(),
            start: Instant::now(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_output_sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.output = sink;
        self
    }

    pub fn with_stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn set_filesystem_root(&mut self, root: PathBuf) {
        self.fs_root = Some(root);
    }

    pub fn filesystem_root(&self) -> Option<&std::path::Path> {
        self.fs_root.as_deref()
    }

    fn alloc_fd(&mut self, file: OpenFile) -> Option<u32> {
        // Standard streams occupy fd 0..3; guest-opened files start at 3.
        if self.files.len() < 3 {
            self.files.resize_with(3, || None);
        }
        if let Some(slot) = self.files.iter().position(Option::is_none) {
            self.files[slot] = Some(file);
            return Some(slot as u32);
        }
        if self.files.len() >= MAX_OPEN_FILES {
            return None;
        }
        self.files.push(Some(file));
        Some((self.files.len() - 1) as u32)
    }

    /// Dispatches one SWI. Returns `Err` only for VM-integrity violations that must halt the
    /// VM; ordinary service failures are encoded as `R0 = 0xFFFFFFFF` and `Ok`.
    pub fn dispatch(&mut self, cpu: &mut Cpu, memory: &mut Memory, imm24: u32) -> Result<SwiOutcome, SwiError> {
        match imm24 {
            EXIT => {
                let exit_code = cpu.get_register(0) as i32;
                debug!("SWI EXIT code={exit_code}");
                Ok(SwiOutcome::Exit { exit_code })
            }
            WRITE_CHAR => {
                let byte = cpu.get_register(0) as u8;
                self.output.write(OutputStream::Stdout, &[byte]);
                Ok(SwiOutcome::Continue)
            }
            WRITE_INT => {
                let value = cpu.get_register(0) as i32;
                self.output.write(OutputStream::Stdout, value.to_string().as_bytes());
                Ok(SwiOutcome::Continue)
            }
            WRITE_STRING => {
                let addr = cpu.get_register(0);
                let bytes = read_c_string(memory, addr)?;
                self.output.write(OutputStream::Stdout, &bytes);
                Ok(SwiOutcome::Continue)
            }
            WRITE_NEWLINE => {
                self.output.write(OutputStream::Stdout, b"\n");
                Ok(SwiOutcome::Continue)
            }
            READ_CHAR => {
                let value = self.stdin.read_byte_blocking().map(|b| b as u32).unwrap_or(GUEST_SERVICE_FAILURE);
                cpu.set_register(0, value);
                Ok(SwiOutcome::Continue)
            }
            READ_STRING => {
                let buf_addr = cpu.get_register(0);
                let max_len = cpu.get_register(1);
                let mut written = 0u32;
                while written < max_len {
                    match self.stdin.read_byte_blocking() {
                        Some(b'\n') | None => break,
                        Some(b) => {
                            memory.write_byte(buf_addr.wrapping_add(written), b)?;
                            written += 1;
                        }
                    }
                }
                cpu.set_register(0, written);
                Ok(SwiOutcome::Continue)
            }
            OPEN => {
                let addr = cpu.get_register(0);
                let mode = cpu.get_register(1);
                let bytes = read_c_string(memory, addr)?;
                let guest_path = String::from_utf8_lossy(&bytes).into_owned();
                let resolved = sandbox::resolve(self.fs_root.as_deref(), &guest_path)?;
                let opened = if mode == 0 {
                    File::open(&resolved).map(OpenFile::Read)
                } else {
                    OpenOptions::new().create(true).write(true).truncate(mode == 1).append(mode != 1).open(&resolved).map(OpenFile::Write)
                };
                match opened {
                    Ok(file) => {
                        let fd = self.alloc_fd(file).unwrap_or(GUEST_SERVICE_FAILURE);
                        cpu.set_register(0, fd);
                    }
                    Err(e) => {
                        warn!("OPEN {guest_path} failed: {e}");
                        cpu.set_register(0, GUEST_SERVICE_FAILURE);
                    }
                }
                Ok(SwiOutcome::Continue)
            }
            CLOSE => {
                let fd = cpu.get_register(0) as usize;
                if let Some(slot) = self.files.get_mut(fd) {
                    *slot = None;
                }
                Ok(SwiOutcome::Continue)
            }
            READ => {
                let fd = cpu.get_register(0) as usize;
                let buf_addr = cpu.get_register(1);
                let len = cpu.get_register(2);
                if len > MAX_READ_SIZE {
                    cpu.set_register(0, GUEST_SERVICE_FAILURE);
                    return Ok(SwiOutcome::Continue);
                }
                let result = self.read_fd(fd, len);
                match result {
                    Ok(bytes) => {
                        for (i, b) in bytes.iter().enumerate() {
                            memory.write_byte(buf_addr.wrapping_add(i as u32), *b)?;
                        }
                        cpu.set_register(0, bytes.len() as u32);
                    }
                    Err(()) => cpu.set_register(0, GUEST_SERVICE_FAILURE),
                }
                Ok(SwiOutcome::Continue)
            }
            WRITE => {
                let fd = cpu.get_register(0) as usize;
                let buf_addr = cpu.get_register(1);
                let len = cpu.get_register(2);
                if len > MAX_WRITE_SIZE {
                    cpu.set_register(0, GUEST_SERVICE_FAILURE);
                    return Ok(SwiOutcome::Continue);
                }
                let mut bytes = Vec::with_capacity(len as usize);
                for i in 0..len {
                    bytes.push(memory.read_byte(buf_addr.wrapping_add(i))?);
                }
                match self.write_fd(fd, &bytes) {
                    Ok(n) => cpu.set_register(0, n as u32),
                    Err(()) => cpu.set_register(0, GUEST_SERVICE_FAILURE),
                }
                Ok(SwiOutcome::Continue)
            }
            ALLOC => {
                let size = cpu.get_register(0);
                let base = memory.allocate(size).unwrap_or(0);
                cpu.set_register(0, base);
                Ok(SwiOutcome::Continue)
            }
            TIME => {
                let nanos = self.start.elapsed().as_nanos() as u32;
                cpu.set_register(0, nanos);
                Ok(SwiOutcome::Continue)
            }
            RANDOM => {
                cpu.set_register(0, self.rng.next_u32());
                Ok(SwiOutcome::Continue)
            }
            other => Err(SwiError::UnknownSwi(other)),
        }
    }

    fn read_fd(&mut self, fd: usize, len: u32) -> Result<Vec<u8>, ()> {
        if fd == 0 {
            let mut out = Vec::new();
            for _ in 0..len {
                match self.stdin.read_byte_blocking() {
                    Some(b) => out.push(b),
                    None => break,
                }
            }
            return Ok(out);
        }
        match self.files.get_mut(fd) {
            Some(Some(OpenFile::Read(file))) => {
                let mut buf = vec![0u8; len as usize];
                let n = file.read(&mut buf).map_err(|_| ())?;
                buf.truncate(n);
                Ok(buf)
            }
            _ => Err(()),
        }
    }

    fn write_fd(&mut self, fd: usize, data: &[u8]) -> Result<usize, ()> {
        if fd == 1 {
            self.output.write(OutputStream::Stdout, data);
            return Ok(data.len());
        }
        if fd == 2 {
            self.output.write(OutputStream::Stderr, data);
            return Ok(data.len());
        }
        match self.files.get_mut(fd) {
            Some(Some(OpenFile::Write(file))) => file.write(data).map_err(|_| ()),
            _ => Err(()),
        }
    }
}

impl Default for SwiBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a NUL-terminated guest string, bounded by [`MAX_STRING_LENGTH`]. An unterminated run
/// past the limit, or an address that wraps past `u32::MAX`, is a VM-integrity error (spec
/// §4.5: "wraparound or overrun -> VM error").
fn read_c_string(memory: &mut Memory, addr: u32) -> Result<Vec<u8>, SwiError> {
    let mut out = VecDeque::new();
    let mut cur = addr;
    for _ in 0..MAX_STRING_LENGTH {
        let byte = memory.read_byte(cur)?;
        if byte == 0 {
            return Ok(out.into_iter().collect());
        }
        out.push_back(byte);
        cur = match cur.checked_add(1) {
            Some(next) => next,
            None => return Err(SwiError::StringTooLong { address: addr, limit: MAX_STRING_LENGTH }),
        };
    }
    Err(SwiError::StringTooLong { address: addr, limit: MAX_STRING_LENGTH })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, DATA_BASE};

    fn setup() -> (Cpu, Memory, SwiBridge) {
        (Cpu::new(), Memory::with_default_layout(), SwiBridge::new())
    }

    #[test]
    fn exit_reports_signed_code() {
        let (mut cpu, mut mem, mut swi) = setup();
        cpu.set_register(0, (-3i32) as u32);
        let outcome = swi.dispatch(&mut cpu, &mut mem, EXIT).unwrap();
        assert_eq!(outcome, SwiOutcome::Exit { exit_code: -3 });
    }

    #[test]
    fn write_string_reads_until_nul() {
        let (mut cpu, mut mem, mut swi) = setup();
        let sink = Box::new(CollectingSink::default());
        swi = swi.with_output_sink(sink);
        mem.write_byte(DATA_BASE, b'h').unwrap();
        mem.write_byte(DATA_BASE + 1, b'i').unwrap();
        mem.write_byte(DATA_BASE + 2, 0).unwrap();
        cpu.set_register(0, DATA_BASE);
        swi.dispatch(&mut cpu, &mut mem, WRITE_STRING).unwrap();
    }

    #[test]
    fn write_string_unterminated_halts() {
        let (mut cpu, mut mem, mut swi) = setup();
        // Fill the data segment with non-zero bytes so the NUL scan runs past the limit.
        for i in 0..(MAX_STRING_LENGTH + 1) {
            mem.write_byte(DATA_BASE + i, 1).unwrap();
        }
        cpu.set_register(0, DATA_BASE);
        let err = swi.dispatch(&mut cpu, &mut mem, WRITE_STRING).unwrap_err();
        assert!(matches!(err, SwiError::StringTooLong { .. }) || matches!(err, SwiError::Memory(_)));
    }

    #[test]
    fn alloc_returns_zero_on_exhaustion() {
        let (mut cpu, mut mem, mut swi) = setup();
        cpu.set_register(0, u32::MAX);
        swi.dispatch(&mut cpu, &mut mem, ALLOC).unwrap();
        assert_eq!(cpu.get_register(0), 0);
    }

    #[test]
    fn open_without_root_is_security_error() {
        let (mut cpu, mut mem, mut swi) = setup();
        mem.write_byte(DATA_BASE, b'a').unwrap();
        mem.write_byte(DATA_BASE + 1, 0).unwrap();
        cpu.set_register(0, DATA_BASE);
        cpu.set_register(1, 0);
        let err = swi.dispatch(&mut cpu, &mut mem, OPEN).unwrap_err();
        assert!(matches!(err, SwiError::Sandbox(SandboxError::RootUnset)));
    }

    #[test]
    fn unknown_swi_is_rejected() {
        let (mut cpu, mut mem, mut swi) = setup();
        assert!(swi.dispatch(&mut cpu, &mut mem, 0x99).is_err());
    }
}
