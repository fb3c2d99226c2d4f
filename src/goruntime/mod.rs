//! Introspection of the Go scheduler state inside the inferior: the module
//! data descriptor leads to the task (goroutine) descriptors, which carry
//! the id, stack bounds and parking state the tracer needs.

use crate::debugapi::{Client, MemoryReader, Tid};
use crate::error::Error;
use crate::version::GoVersion;

/// Field offsets inside the module data descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ModuleDataLayout {
    /// Offset of the task-descriptor slice header (pointer, length).
    pub allgs: u64,
}

/// Field offsets inside a task descriptor.
#[derive(Debug, Clone, Copy)]
pub struct GLayout {
    pub stack_lo: u64,
    pub stack_hi: u64,
    pub status: u64,
    pub id: u64,
    /// Saved pc of a parked task.
    pub parked_pc: u64,
}

/// Offsets vary between toolchain versions; one value of this struct pins
/// one layout generation.
#[derive(Debug, Clone, Copy)]
pub struct Layouts {
    pub module_data: ModuleDataLayout,
    pub g: GLayout,
    /// Offset of the current task descriptor pointer inside the TLS block.
    pub tls_g: u32,
}

impl Layouts {
    pub fn select(version: GoVersion) -> Layouts {
        if version >= GoVersion((1, 11, 0)) {
            Layouts {
                module_data: ModuleDataLayout { allgs: 0x208 },
                g: GLayout {
                    stack_lo: 0x0,
                    stack_hi: 0x8,
                    status: 0x90,
                    id: 0x98,
                    parked_pc: 0x40,
                },
                tls_g: 0x30,
            }
        } else {
            Layouts {
                module_data: ModuleDataLayout { allgs: 0x1f0 },
                g: GLayout {
                    stack_lo: 0x0,
                    stack_hi: 0x8,
                    status: 0x90,
                    id: 0x98,
                    parked_pc: 0x40,
                },
                tls_g: 0x30,
            }
        }
    }
}

/// Scheduler state of one task, read from its in-memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: i64,
    pub g_addr: u64,
    pub stack_lo: u64,
    pub stack_hi: u64,
    pub status: u32,
    pub parked_pc: u64,
}

// a runaway descriptor list means the module data address is wrong
const MAX_TASKS: u64 = 1 << 16;

// frame-pointer chains longer than this are considered corrupted
const MAX_FRAMES: usize = 256;

/// Walks the inferior scheduler structures.
pub struct Introspector {
    layouts: Layouts,
    module_data_addr: u64,
}

impl Introspector {
    pub fn new(module_data_addr: u64, version: GoVersion) -> Self {
        Self {
            layouts: Layouts::select(version),
            module_data_addr,
        }
    }

    pub fn layouts(&self) -> &Layouts {
        &self.layouts
    }

    /// All task descriptors registered with the scheduler.
    pub fn tasks(&self, mem: &mut dyn MemoryReader) -> Result<Vec<TaskDescriptor>, Error> {
        let slice = self.module_data_addr + self.layouts.module_data.allgs;
        let array = mem.read_u64(slice)?;
        let len = mem.read_u64(slice + 8)?.min(MAX_TASKS);

        let mut tasks = Vec::with_capacity(len as usize);
        for i in 0..len {
            let g_addr = mem.read_u64(array + i * 8)?;
            if g_addr == 0 {
                continue;
            }
            tasks.push(self.task_at(mem, g_addr)?);
        }
        Ok(tasks)
    }

    /// Read the descriptor fields of the task at `g_addr`.
    pub fn task_at(&self, mem: &mut dyn MemoryReader, g_addr: u64) -> Result<TaskDescriptor, Error> {
        let g = &self.layouts.g;
        let mut status = [0u8; 4];
        mem.read_memory(g_addr + g.status, &mut status)?;

        Ok(TaskDescriptor {
            id: mem.read_u64(g_addr + g.id)? as i64,
            g_addr,
            stack_lo: mem.read_u64(g_addr + g.stack_lo)?,
            stack_hi: mem.read_u64(g_addr + g.stack_hi)?,
            status: u32::from_le_bytes(status),
            parked_pc: mem.read_u64(g_addr + g.parked_pc)?,
        })
    }

    /// The task currently scheduled onto the stopped thread, located through
    /// its TLS block.
    pub fn current_task<C: Client>(&self, client: &mut C, tid: Tid) -> Result<TaskDescriptor, Error> {
        let g_addr = client.read_tls(tid, self.layouts.tls_g)?;
        if g_addr == 0 {
            return Err(Error::NoTask(tid));
        }
        self.task_at(client, g_addr)
    }

    /// Fallback lookup when the TLS block is unreadable: the task whose stack
    /// holds the given stack pointer.
    pub fn task_by_sp(&self, mem: &mut dyn MemoryReader, sp: u64) -> Result<TaskDescriptor, Error> {
        self.tasks(mem)?
            .into_iter()
            .find(|t| t.stack_lo < sp && sp <= t.stack_hi)
            .ok_or(Error::NoTask(0))
    }

    /// Call depth of a stopped task: the frame-pointer chain is walked from
    /// the current frame up to the stack top, counting the frames whose
    /// return pc satisfies `counted_pc` (runtime frames are excluded by the
    /// caller this way).
    pub fn call_depth(
        &self,
        mem: &mut dyn MemoryReader,
        task: &TaskDescriptor,
        frame_ptr: u64,
        counted_pc: &dyn Fn(u64) -> bool,
    ) -> usize {
        let mut depth = 0;
        let mut fp = frame_ptr;
        for _ in 0..MAX_FRAMES {
            if fp <= task.stack_lo || fp >= task.stack_hi {
                break;
            }
            let Ok(ret_pc) = mem.read_u64(fp + 8) else {
                break;
            };
            if ret_pc == 0 {
                break;
            }
            if counted_pc(ret_pc) {
                depth += 1;
            }

            match mem.read_u64(fp) {
                // the chain must climb towards the stack top
                Ok(next) if next > fp => fp = next,
                _ => break,
            }
        }
        depth
    }
}
