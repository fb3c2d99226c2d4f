//! Transport to a stopped inferior: launch or attach, registers, memory,
//! stepping and resuming. The wire client lives in [`lldb`]; anything that
//! speaks the same capability set (a native-syscall client, a scripted
//! in-memory target in tests) can stand in for it.

pub mod lldb;

use crate::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared append-only destination for trace lines and for the output the
/// inferior produces. The debug-API client writes inferior output into it
/// verbatim, interleaved with the controller's trace lines.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Sink over the tracer's stdout.
pub fn stdout_sink() -> OutputSink {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

/// Sink over an arbitrary writer (tests collect output in a buffer this way).
pub fn sink_from<W: Write + Send + 'static>(w: W) -> OutputSink {
    Arc::new(Mutex::new(Box::new(w)))
}

/// OS-level identifier of a stopped execution unit (a thread of the inferior).
pub type Tid = u64;

/// What the inferior did since it was last resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One or more tasks stopped at a trap instruction.
    Trapped(Vec<Tid>),
    /// The process exited with a status code.
    Exited(i32),
    /// The process was terminated by a signal.
    Terminated(i32),
}

impl Event {
    pub fn is_exit(&self) -> bool {
        matches!(self, Event::Exited(_) | Event::Terminated(_))
    }
}

/// Register snapshot of one task. Only the registers the tracer needs are
/// materialized; the wire client preserves the rest on writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rcx: u64,
}

impl Registers {
    /// Access a register by its symbolic name.
    pub fn by_name(&self, name: &str) -> Option<u64> {
        match name {
            "rip" => Some(self.rip),
            "rsp" => Some(self.rsp),
            "rbp" => Some(self.rbp),
            "rcx" => Some(self.rcx),
            _ => None,
        }
    }

    /// Update a register by its symbolic name. Unknown names are ignored.
    pub fn set_by_name(&mut self, name: &str, value: u64) {
        match name {
            "rip" => self.rip = value,
            "rsp" => self.rsp = value,
            "rbp" => self.rbp = value,
            "rcx" => self.rcx = value,
            _ => {}
        }
    }
}

/// Blocking debug-API client. Every call returns only when the inferior is
/// stopped again (or the operation failed).
pub trait Client {
    /// Spawn the program under the debug server and return its pid.
    /// The inferior is left stopped at its entry point.
    fn launch(&mut self, path: &Path, args: &[String]) -> Result<u64, Error>;

    /// Take control of a running process. The process is stopped.
    fn attach(&mut self, pid: u64) -> Result<(), Error>;

    /// Release the inferior. A launched inferior is killed, an attached one
    /// resumes execution.
    fn detach(&mut self) -> Result<(), Error>;

    /// All task ids of the stopped inferior.
    fn threads(&mut self) -> Result<Vec<Tid>, Error>;

    fn read_regs(&mut self, tid: Tid) -> Result<Registers, Error>;

    fn write_regs(&mut self, tid: Tid, regs: &Registers) -> Result<(), Error>;

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Execute one instruction of the given task.
    /// [`Error::UnspecifiedTask`] is returned when a different task stops.
    fn step(&mut self, tid: Tid) -> Result<Event, Error>;

    /// Resume all tasks and wait for the next stop.
    fn cont(&mut self) -> Result<Event, Error>;

    /// Read 8 bytes at the given offset from the task-local-storage block of
    /// the task.
    fn read_tls(&mut self, tid: Tid, offset: u32) -> Result<u64, Error>;

    /// Build a callable that asks the inferior to stop soon. Usable from
    /// another thread; the induced stop surfaces from the pending
    /// [`Client::cont`] as an empty `Trapped` event.
    fn stop_trigger(&self) -> StopTrigger;
}

/// Cross-thread handle that induces a stop of the running inferior.
pub type StopTrigger = Box<dyn FnMut() + Send>;

/// Read-only window into the inferior address space. Implemented by every
/// debug-API client; value parsing and runtime introspection are written
/// against this trait so they stay testable without a live process.
pub trait MemoryReader {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn read_u64(&mut self, addr: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_memory(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<C: Client> MemoryReader for C {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.read_mem(addr, buf)
    }
}

/// Write access to the inferior address space, the counterpart of
/// [`MemoryReader`].
pub trait MemoryWriter {
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error>;
}

impl<C: Client> MemoryWriter for C {
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.write_mem(addr, data)
    }
}
