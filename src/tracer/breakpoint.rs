//! Software breakpoints of the tracing session. The table owns the saved
//! instruction bytes and the step-over bookkeeping; at most one entry per
//! address exists at any time.

use crate::debugapi::{MemoryReader, MemoryWriter};
use crate::error::Error;
use std::collections::{HashMap, HashSet};

pub const TRAP_INSTRUCTION: u8 = 0xCC;

/// Task identifier the tracer attributes events to (the runtime task id,
/// not the OS thread id).
pub type TaskId = i64;

struct Breakpoint {
    original: u8,
    armed: bool,
    // tasks between "original byte restored" and "trap byte rewritten"
    step_over: HashSet<TaskId>,
}

/// Address-keyed table of installed breakpoints.
#[derive(Default)]
pub struct BreakpointTable {
    table: HashMap<u64, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a breakpoint: save the instruction byte, write the trap
    /// opcode. Returns false when the address already holds one.
    pub fn install<M>(&mut self, mem: &mut M, addr: u64) -> Result<bool, Error>
    where
        M: MemoryReader + MemoryWriter + ?Sized,
    {
        if self.table.contains_key(&addr) {
            return Ok(false);
        }

        let mut original = [0u8];
        mem.read_memory(addr, &mut original)?;
        mem.write_memory(addr, &[TRAP_INSTRUCTION])?;
        self.table.insert(
            addr,
            Breakpoint {
                original: original[0],
                armed: true,
                step_over: HashSet::new(),
            },
        );
        Ok(true)
    }

    /// Restore the saved byte and forget the breakpoint.
    pub fn clear<M>(&mut self, mem: &mut M, addr: u64) -> Result<(), Error>
    where
        M: MemoryWriter + ?Sized,
    {
        if let Some(bp) = self.table.remove(&addr) {
            if bp.armed {
                mem.write_memory(addr, &[bp.original])?;
            }
        }
        Ok(())
    }

    /// Restore every installed breakpoint. Failures are logged, the
    /// remaining entries are still cleared.
    pub fn clear_all<M>(&mut self, mem: &mut M)
    where
        M: MemoryWriter + ?Sized,
    {
        for (addr, bp) in self.table.drain() {
            if bp.armed {
                if let Err(e) = mem.write_memory(addr, &[bp.original]) {
                    log::warn!("failed to clear breakpoint at {addr:#x}: {e}");
                }
            }
        }
    }

    pub fn exists(&self, addr: u64) -> bool {
        self.table.contains_key(&addr)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Begin the step-over window: the original byte goes back so the task
    /// can execute it.
    pub fn begin_step_over<M>(&mut self, mem: &mut M, addr: u64, task: TaskId) -> Result<(), Error>
    where
        M: MemoryWriter + ?Sized,
    {
        let bp = self
            .table
            .get_mut(&addr)
            .ok_or(Error::UnknownAddress(addr))?;
        if bp.armed {
            mem.write_memory(addr, &[bp.original])?;
            bp.armed = false;
        }
        bp.step_over.insert(task);
        Ok(())
    }

    /// Close the step-over window: the trap byte returns once no task is
    /// inside the window anymore.
    pub fn end_step_over<M>(&mut self, mem: &mut M, addr: u64, task: TaskId) -> Result<(), Error>
    where
        M: MemoryWriter + ?Sized,
    {
        let bp = self
            .table
            .get_mut(&addr)
            .ok_or(Error::UnknownAddress(addr))?;
        bp.step_over.remove(&task);
        if bp.step_over.is_empty() && !bp.armed {
            mem.write_memory(addr, &[TRAP_INSTRUCTION])?;
            bp.armed = true;
        }
        Ok(())
    }

    /// Tasks currently inside the step-over window at `addr`.
    #[cfg(test)]
    fn window(&self, addr: u64) -> Option<&HashSet<TaskId>> {
        self.table.get(&addr).map(|bp| &bp.step_over)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct FakeMemory {
        cells: Map<u64, u8>,
    }

    impl MemoryReader for FakeMemory {
        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
            for (i, out) in buf.iter_mut().enumerate() {
                *out = *self
                    .cells
                    .get(&(addr + i as u64))
                    .ok_or(Error::UnknownAddress(addr))?;
            }
            Ok(())
        }
    }

    impl MemoryWriter for FakeMemory {
        fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
            for (i, b) in data.iter().enumerate() {
                if !self.cells.contains_key(&(addr + i as u64)) {
                    return Err(Error::UnknownAddress(addr));
                }
                self.cells.insert(addr + i as u64, *b);
            }
            Ok(())
        }
    }

    fn text(bytes: &[(u64, u8)]) -> FakeMemory {
        FakeMemory {
            cells: bytes.iter().copied().collect(),
        }
    }

    #[test]
    fn test_install_and_clear() {
        let mut mem = text(&[(0x1000, 0x55), (0x1001, 0x48)]);
        let mut table = BreakpointTable::new();

        assert!(table.install(&mut mem, 0x1000).unwrap());
        assert!(table.exists(0x1000));
        assert_eq!(mem.cells[&0x1000], TRAP_INSTRUCTION);

        // a second install at the same address is a no-op
        assert!(!table.install(&mut mem, 0x1000).unwrap());

        table.clear(&mut mem, 0x1000).unwrap();
        assert!(!table.exists(0x1000));
        assert_eq!(mem.cells[&0x1000], 0x55);
    }

    #[test]
    fn test_install_unmapped_address() {
        let mut mem = text(&[(0x1000, 0x55)]);
        let mut table = BreakpointTable::new();

        assert!(table.install(&mut mem, 0x2000).is_err());
        assert!(!table.exists(0x2000));
    }

    #[test]
    fn test_step_over_window() {
        let mut mem = text(&[(0x1000, 0x55)]);
        let mut table = BreakpointTable::new();
        table.install(&mut mem, 0x1000).unwrap();

        table.begin_step_over(&mut mem, 0x1000, 7).unwrap();
        // inside the window the address holds the original byte
        assert_eq!(mem.cells[&0x1000], 0x55);
        assert_eq!(table.window(0x1000).unwrap().len(), 1);

        table.end_step_over(&mut mem, 0x1000, 7).unwrap();
        assert_eq!(mem.cells[&0x1000], TRAP_INSTRUCTION);
        assert!(table.window(0x1000).unwrap().is_empty());
    }

    #[test]
    fn test_clear_all() {
        let mut mem = text(&[(0x1000, 0x55), (0x2000, 0x66)]);
        let mut table = BreakpointTable::new();
        table.install(&mut mem, 0x1000).unwrap();
        table.install(&mut mem, 0x2000).unwrap();

        table.clear_all(&mut mem);
        assert!(table.is_empty());
        assert_eq!(mem.cells[&0x1000], 0x55);
        assert_eq!(mem.cells[&0x2000], 0x66);
    }

    #[test]
    fn test_clear_inside_window_keeps_original_byte() {
        let mut mem = text(&[(0x1000, 0x55)]);
        let mut table = BreakpointTable::new();
        table.install(&mut mem, 0x1000).unwrap();
        table.begin_step_over(&mut mem, 0x1000, 1).unwrap();

        table.clear(&mut mem, 0x1000).unwrap();
        assert_eq!(mem.cells[&0x1000], 0x55);
        assert!(!table.exists(0x1000));
    }
}
