//! The tracing session controller: a single-threaded event loop that owns
//! the debug-API client, the breakpoint table and the per-task call stacks,
//! and renders one line per traced function entry and exit.

pub mod breakpoint;

use crate::binary::{Binary, Function};
use crate::debugapi::{Client, Event, OutputSink, Registers, StopTrigger, Tid, stdout_sink};
use crate::error::Error;
use crate::goruntime::{Introspector, TaskDescriptor};
use crate::tracer::breakpoint::{BreakpointTable, TaskId};
use crate::value::parser::ValueParser;
use crate::version::GoVersion;
use crate::weak_error;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_TRACE_LEVEL: usize = 1;
pub const DEFAULT_PARSE_LEVEL: usize = 1;

// task id used when the stopped thread runs no runtime task
const UNKNOWN_TASK: TaskId = -1;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub program_path: PathBuf,
    /// Emission stops below this call depth relative to the traced region.
    pub trace_level: usize,
    /// Struct recursion budget of the value parser.
    pub parse_level: usize,
    pub verbose: bool,
    /// Address of the runtime module data descriptor; zero means "read it
    /// from the debug information".
    pub first_module_data_addr: u64,
    /// Toolchain version override for binaries without debug information.
    pub go_version: Option<String>,
}

impl TracerConfig {
    pub fn new(program_path: impl Into<PathBuf>) -> Self {
        Self {
            program_path: program_path.into(),
            trace_level: DEFAULT_TRACE_LEVEL,
            parse_level: DEFAULT_PARSE_LEVEL,
            verbose: false,
            first_module_data_addr: 0,
            go_version: None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.trace_level == 0 {
            return Err(Error::InvalidConfig(
                "trace level must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePointKind {
    Start,
    End,
}

/// An address the controller reacts to: START opens the traced region of a
/// task, END closes it.
#[derive(Debug, Clone, Copy)]
pub struct TracePoint {
    pub addr: u64,
    pub kind: TracePointKind,
}

/// One traced call of a task.
struct Frame {
    func: Function,
    ret_addr: u64,
    used_stack: u64,
    depth: usize,
}

#[derive(Default)]
struct TaskState {
    tracing: bool,
    stack: Vec<Frame>,
    // call depth observed when the task entered its traced region; depths
    // are reported relative to it
    baseline_depth: usize,
}

/// Cross-thread handle: interrupt the session, add trace points while it
/// runs.
#[derive(Clone)]
pub struct TracerHandle {
    interrupted: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<TracePoint>>>,
    stop: Arc<Mutex<StopTrigger>>,
}

impl TracerHandle {
    /// Ask the session to stop: the flag is observed before the next resume,
    /// the stop trigger wakes a session blocked inside one.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let mut trigger = self.stop.lock().expect("stop trigger poisoned");
        (*trigger)();
    }

    pub fn add_start_trace_point(&self, addr: u64) {
        self.pending
            .lock()
            .expect("trace points poisoned")
            .push(TracePoint {
                addr,
                kind: TracePointKind::Start,
            });
    }

    pub fn add_end_trace_point(&self, addr: u64) {
        self.pending
            .lock()
            .expect("trace points poisoned")
            .push(TracePoint {
                addr,
                kind: TracePointKind::End,
            });
    }
}

/// The tracing session controller.
pub struct Controller<C: Client> {
    client: C,
    binary: Binary,
    program_path: PathBuf,
    introspector: Introspector,
    breakpoints: BreakpointTable,
    start_points: HashSet<u64>,
    end_points: HashSet<u64>,
    pending_points: Arc<Mutex<Vec<TracePoint>>>,
    tasks: HashMap<TaskId, TaskState>,
    // live frames per return-site address
    ret_refs: HashMap<u64, usize>,
    // return-site breakpoints installed by this controller, cleared once
    // the last referencing frame is gone
    transient: HashSet<u64>,
    armed_entries: HashSet<u64>,
    functions_armed: bool,
    func_cache: HashMap<u64, Function>,
    trace_level: usize,
    parse_level: usize,
    interrupted: Arc<AtomicBool>,
    out: OutputSink,
}

impl<C: Client> Controller<C> {
    /// Open the program named by the configuration and build a controller
    /// around the given debug-API client.
    pub fn new(client: C, config: &TracerConfig) -> Result<Self, Error> {
        let binary = Binary::open(&config.program_path)?;
        Self::from_parts(client, binary, config)
    }

    pub(crate) fn from_parts(
        client: C,
        binary: Binary,
        config: &TracerConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let go_version = config
            .go_version
            .as_deref()
            .and_then(GoVersion::parse)
            .or_else(|| binary.go_version())
            .unwrap_or_default();
        let module_data_addr = if config.first_module_data_addr != 0 {
            config.first_module_data_addr
        } else {
            match binary.first_module_data_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    log::debug!("module data address is unknown: {e}");
                    0
                }
            }
        };

        Ok(Self {
            client,
            binary,
            program_path: config.program_path.clone(),
            introspector: Introspector::new(module_data_addr, go_version),
            breakpoints: BreakpointTable::new(),
            start_points: HashSet::new(),
            end_points: HashSet::new(),
            pending_points: Arc::new(Mutex::new(vec![])),
            tasks: HashMap::new(),
            ret_refs: HashMap::new(),
            transient: HashSet::new(),
            armed_entries: HashSet::new(),
            functions_armed: false,
            func_cache: HashMap::new(),
            trace_level: config.trace_level,
            parse_level: config.parse_level,
            interrupted: Arc::new(AtomicBool::new(false)),
            out: stdout_sink(),
        })
    }

    /// Route trace lines (and the inferior output the client forwards) into
    /// the given sink.
    pub fn set_output(&mut self, out: OutputSink) {
        self.out = out;
    }

    pub fn binary(&self) -> &Binary {
        &self.binary
    }

    /// Launch the program under the debug server; it is left stopped until
    /// [`Controller::main_loop`] resumes it.
    pub fn launch_tracee(&mut self, args: &[String]) -> Result<u64, Error> {
        let path = self.program_path.clone();
        self.client.launch(&path, args)
    }

    /// Take control of a running process.
    pub fn attach_tracee(&mut self, pid: u64) -> Result<(), Error> {
        self.client.attach(pid)
    }

    pub fn add_start_trace_point(&mut self, addr: u64) {
        self.pending_points
            .lock()
            .expect("trace points poisoned")
            .push(TracePoint {
                addr,
                kind: TracePointKind::Start,
            });
    }

    pub fn add_end_trace_point(&mut self, addr: u64) {
        self.pending_points
            .lock()
            .expect("trace points poisoned")
            .push(TracePoint {
                addr,
                kind: TracePointKind::End,
            });
    }

    /// Cross-thread handle bound to this session. Take it after the inferior
    /// is launched or attached, the stop trigger needs the live connection.
    pub fn handle(&self) -> TracerHandle {
        TracerHandle {
            interrupted: Arc::clone(&self.interrupted),
            pending: Arc::clone(&self.pending_points),
            stop: Arc::new(Mutex::new(self.client.stop_trigger())),
        }
    }

    /// Drive the inferior until it exits or the session is interrupted.
    pub fn main_loop(&mut self) -> Result<(), Error> {
        match self.run_loop() {
            Ok(()) => Ok(()),
            Err(Error::Exited(status)) => {
                log::debug!("the inferior exited with status {status}");
                Ok(())
            }
            Err(Error::Terminated(signal)) => {
                log::debug!("the inferior was terminated by signal {signal}");
                Ok(())
            }
            Err(Error::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                // leave the inferior clean before surfacing the failure
                self.breakpoints.clear_all(&mut self.client);
                weak_error!(self.client.detach(), "detach:");
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        self.install_pending_points();

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                self.breakpoints.clear_all(&mut self.client);
                weak_error!(self.client.detach(), "detach:");
                return Err(Error::Interrupted);
            }

            match self.client.cont()? {
                Event::Exited(status) => {
                    log::debug!("the inferior exited with status {status}");
                    return Ok(());
                }
                Event::Terminated(signal) => {
                    log::debug!("the inferior was terminated by signal {signal}");
                    return Ok(());
                }
                Event::Trapped(tids) => {
                    self.install_pending_points();
                    for tid in tids {
                        self.handle_trap(tid)?;
                    }
                }
            }
        }
    }

    /// Install the trace points added so far. An address not mapped yet
    /// stays pending and is retried at the next stop.
    fn install_pending_points(&mut self) {
        let mut pending = self.pending_points.lock().expect("trace points poisoned");
        pending.retain(|point| {
            match self.breakpoints.install(&mut self.client, point.addr) {
                Ok(_) => {
                    match point.kind {
                        TracePointKind::Start => self.start_points.insert(point.addr),
                        TracePointKind::End => self.end_points.insert(point.addr),
                    };
                    false
                }
                Err(e) => {
                    log::debug!("trace point at {:#x} is still pending: {e}", point.addr);
                    true
                }
            }
        });
    }

    fn handle_trap(&mut self, tid: Tid) -> Result<(), Error> {
        let mut regs = match self.client.read_regs(tid) {
            Ok(regs) => regs,
            Err(e) if !e.is_fatal() => {
                log::debug!("task {tid} is gone before its trap was handled: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let bp_addr = regs.rip.wrapping_sub(1);
        if !self.breakpoints.exists(bp_addr) {
            // not ours: a hardcoded trap instruction or a foreign debugger
            log::debug!("unrelated trap of task {tid} at {:#x}", regs.rip);
            return Ok(());
        }

        // rewind onto the trapped instruction
        regs.rip = bp_addr;
        if let Err(e) = self.client.write_regs(tid, &regs) {
            if e.is_fatal() {
                return Err(e);
            }
            log::debug!("cannot rewind task {tid}: {e}");
            return Ok(());
        }

        let Some(task) = self.current_task(tid, regs.rsp) else {
            // not a runtime task, pass the breakpoint silently
            return self.step_over(bp_addr, tid, UNKNOWN_TASK);
        };
        let task_id = task.id;
        let used_stack = task.stack_hi.saturating_sub(regs.rsp);

        let tracing = self
            .tasks
            .get(&task_id)
            .map(|state| state.tracing)
            .unwrap_or(false);

        if self.end_points.contains(&bp_addr) && tracing {
            self.leave_traced_region(task_id);
        } else if self.start_points.contains(&bp_addr) && !tracing {
            self.enter_traced_region(task_id, &task, &regs)?;
        } else if tracing {
            self.handle_traced_stop(task_id, bp_addr, &regs, used_stack);
        }

        self.step_over(bp_addr, tid, task_id)
    }

    /// The runtime task scheduled onto the stopped thread.
    fn current_task(&mut self, tid: Tid, sp: u64) -> Option<TaskDescriptor> {
        match self.introspector.current_task(&mut self.client, tid) {
            Ok(task) => Some(task),
            Err(e) => {
                log::debug!("task lookup through TLS failed for thread {tid}: {e}");
                self.introspector.task_by_sp(&mut self.client, sp).ok()
            }
        }
    }

    fn enter_traced_region(
        &mut self,
        task_id: TaskId,
        task: &TaskDescriptor,
        regs: &Registers,
    ) -> Result<(), Error> {
        let binary = &self.binary;
        let baseline = self.introspector.call_depth(&mut self.client, task, regs.rbp, &|pc| {
            binary
                .function_by_pc(pc)
                .map(|f| !f.name.starts_with("runtime."))
                .unwrap_or(false)
        });

        let state = self.tasks.entry(task_id).or_default();
        state.tracing = true;
        state.stack.clear();
        state.baseline_depth = baseline;
        log::debug!("task {task_id} enters the traced region (baseline depth {baseline})");

        self.arm_function_entries()
    }

    fn leave_traced_region(&mut self, task_id: TaskId) {
        let Some(state) = self.tasks.get_mut(&task_id) else {
            return;
        };
        state.tracing = false;
        let frames: Vec<Frame> = state.stack.drain(..).collect();
        log::debug!(
            "task {task_id} leaves the traced region (baseline depth {})",
            state.baseline_depth
        );

        for frame in frames.iter().rev() {
            self.emit_exit(frame, "");
        }
        for frame in &frames {
            self.release_ret_ref(frame.ret_addr);
        }
    }

    /// Breakpoints at every traceable function entry make nested calls
    /// observable. Armed once, the first time any task enters its region.
    fn arm_function_entries(&mut self) -> Result<(), Error> {
        if self.functions_armed {
            return Ok(());
        }
        self.functions_armed = true;

        let mut armed = 0usize;
        for func in self.binary.functions() {
            if func.entry == 0 || !traceable(&func.name) {
                continue;
            }
            match self.breakpoints.install(&mut self.client, func.entry) {
                Ok(installed) => {
                    self.armed_entries.insert(func.entry);
                    armed += installed as usize;
                }
                Err(e) => log::debug!("cannot arm {} at {:#x}: {e}", func.name, func.entry),
            }
        }
        log::debug!("{armed} function entries armed");
        Ok(())
    }

    fn handle_traced_stop(&mut self, task_id: TaskId, bp_addr: u64, regs: &Registers, used_stack: u64) {
        if self.armed_entries.contains(&bp_addr) {
            self.handle_function_entry(task_id, bp_addr, regs, used_stack);
        } else if self.ret_refs.contains_key(&bp_addr) {
            self.handle_function_return(task_id, bp_addr, regs);
        }
        // anything else is another task's pending return site, pass it
    }

    fn handle_function_entry(
        &mut self,
        task_id: TaskId,
        entry: u64,
        regs: &Registers,
        used_stack: u64,
    ) {
        self.drop_stale_frames(task_id, used_stack);

        let depth = self
            .tasks
            .get(&task_id)
            .map(|state| state.stack.len())
            .unwrap_or(0)
            + 1;
        if depth > self.trace_level {
            // deeper recursion stays silent, emission resumes on return
            return;
        }

        let func = self.function_at(entry);
        let args = self.render_params(&func, regs.rsp + 8, false, true);
        self.write_line(&format!(
            "{}=> {}({})",
            "  ".repeat(depth - 1),
            func.name,
            args
        ));

        // observe the exit through the return site recorded on the stack
        let ret_addr = self.read_u64_at(regs.rsp).unwrap_or(0);
        if ret_addr != 0 {
            if self.breakpoints.exists(ret_addr) {
                *self.ret_refs.entry(ret_addr).or_insert(0) += 1;
            } else {
                match self.breakpoints.install(&mut self.client, ret_addr) {
                    Ok(_) => {
                        self.transient.insert(ret_addr);
                        *self.ret_refs.entry(ret_addr).or_insert(0) += 1;
                    }
                    Err(e) => log::debug!("cannot observe the return of {}: {e}", func.name),
                }
            }
        }

        let state = self.tasks.entry(task_id).or_default();
        state.stack.push(Frame {
            func,
            ret_addr,
            used_stack,
            depth,
        });
    }

    fn handle_function_return(&mut self, task_id: TaskId, ret_addr: u64, regs: &Registers) {
        let Some(state) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let Some(pos) = state.stack.iter().rposition(|f| f.ret_addr == ret_addr) else {
            return;
        };

        let abandoned: Vec<Frame> = state.stack.drain(pos + 1..).collect();
        let frame = state.stack.pop().expect("frame at rposition");

        for inner in abandoned.iter().rev() {
            self.emit_exit(inner, "");
        }
        for inner in &abandoned {
            self.release_ret_ref(inner.ret_addr);
        }

        // at the return site the parameter list starts right at the stack
        // pointer, the return address is already popped
        let vals = self.render_params(&frame.func, regs.rsp, true, false);
        self.emit_exit(&frame, &vals);
        self.release_ret_ref(frame.ret_addr);
    }

    /// Pop frames the task abandoned: a frame whose entry stack usage is not
    /// above the current one has returned already (panic unwinds skip their
    /// return sites).
    fn drop_stale_frames(&mut self, task_id: TaskId, used_stack_now: u64) {
        let Some(state) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let mut popped = vec![];
        while let Some(top) = state.stack.last() {
            if top.used_stack >= used_stack_now {
                popped.push(state.stack.pop().expect("checked by last"));
            } else {
                break;
            }
        }

        for frame in popped {
            self.emit_exit(&frame, "");
            self.release_ret_ref(frame.ret_addr);
        }
    }

    fn release_ret_ref(&mut self, ret_addr: u64) {
        if ret_addr == 0 {
            return;
        }
        let Some(count) = self.ret_refs.get_mut(&ret_addr) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.ret_refs.remove(&ret_addr);
            if self.transient.remove(&ret_addr) {
                weak_error!(self.breakpoints.clear(&mut self.client, ret_addr));
            }
        }
    }

    fn emit_exit(&self, frame: &Frame, vals: &str) {
        self.write_line(&format!(
            "{}<= {}({})",
            "  ".repeat(frame.depth - 1),
            frame.func.name,
            vals
        ));
    }

    /// Resolve the function at an armed entry; lookup misses downgrade to an
    /// address-only rendition.
    fn function_at(&mut self, entry: u64) -> Function {
        if let Some(func) = self.func_cache.get(&entry) {
            return func.clone();
        }

        let func = match self.binary.function_by_pc(entry) {
            Ok(func) if func.entry == entry => func,
            Ok(_) | Err(_) => {
                log::debug!("no function information at {entry:#x}");
                Function {
                    name: format!("{entry:#x}"),
                    entry,
                    parameters: vec![],
                }
            }
        };
        self.func_cache.insert(entry, func.clone());
        func
    }

    /// Render the input (or output) parameters of a call, reading each one
    /// from its stack window. Unreadable values print as `?`.
    fn render_params(&mut self, func: &Function, base: u64, outputs: bool, with_names: bool) -> String {
        let Self {
            client,
            binary,
            parse_level,
            ..
        } = self;
        let parser = ValueParser::new(binary.type_resolver());
        let depth = *parse_level as i64;

        let mut rendered = vec![];
        for param in func.parameters.iter().filter(|p| p.is_output == outputs) {
            let val = if !param.exists {
                "?".to_string()
            } else {
                let mut buf = vec![0u8; param.typ.byte_size() as usize];
                let addr = base.wrapping_add(param.offset as u64);
                match client.read_mem(addr, &mut buf) {
                    Ok(()) => parser
                        .parse(&mut *client, &param.typ, &buf, depth)
                        .to_string(),
                    Err(e) => {
                        log::debug!("cannot read the value of {}: {e}", param.name);
                        "?".to_string()
                    }
                }
            };
            if with_names {
                rendered.push(format!("{}={}", param.name, val));
            } else {
                rendered.push(val);
            }
        }
        rendered.iter().join(", ")
    }

    fn step_over(&mut self, addr: u64, tid: Tid, task: TaskId) -> Result<(), Error> {
        if !self.breakpoints.exists(addr) {
            // the breakpoint was cleared while handling this trap, the
            // original instruction is already in place
            return Ok(());
        }

        self.breakpoints.begin_step_over(&mut self.client, addr, task)?;
        let step_res = self.client.step(tid);
        if matches!(
            &step_res,
            Err(Error::Exited(_)) | Err(Error::Terminated(_))
        ) {
            return step_res.map(|_| ());
        }
        self.breakpoints.end_step_over(&mut self.client, addr, task)?;

        match step_res {
            Ok(_) => Ok(()),
            Err(Error::UnspecifiedTask(tids)) => {
                // the other task consumed this stop, it traps again after
                // the next resume
                log::debug!("tasks {tids:?} stopped during a step-over at {addr:#x}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn read_u64_at(&mut self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.client.read_mem(addr, &mut buf).ok()?;
        Some(u64::from_le_bytes(buf))
    }

    fn write_line(&self, line: &str) {
        let mut sink = self.out.lock().expect("output sink poisoned");
        if let Err(e) = writeln!(sink, "{line}") {
            log::warn!("trace output: {e}");
        }
    }
}

/// Runtime internals cannot take a software breakpoint safely (signal
/// handling, stack growth run there) and are noise in a user trace.
fn traceable(name: &str) -> bool {
    !(name.is_empty()
        || name.starts_with('_')
        || name.starts_with("runtime.")
        || name.starts_with("runtime/")
        || name.starts_with("type.."))
}

#[cfg(test)]
mod tests {
    use super::breakpoint::TRAP_INSTRUCTION;
    use super::*;
    use crate::binary::FuncSym;
    use crate::debugapi::sink_from;
    use std::collections::VecDeque;
    use std::path::Path;

    const MAIN: u64 = 0x1000;
    const FA: u64 = 0x1100;
    const FB: u64 = 0x1200;

    const G1: u64 = 0x700000;
    const G2: u64 = 0x700400;
    const G1_STACK: (u64, u64) = (0x7f8000, 0x800000);
    const G2_STACK: (u64, u64) = (0x7f0000, 0x7f8000);

    enum Stop {
        Trap {
            tid: Tid,
            rip: u64,
            rsp: u64,
            mem_patch: Vec<(u64, u64)>,
        },
        Exit(i32),
    }

    #[derive(Default)]
    struct ScriptState {
        mem: HashMap<u64, u8>,
        regs: HashMap<Tid, Registers>,
        tls: HashMap<Tid, u64>,
        script: VecDeque<Stop>,
        detached: bool,
    }

    impl ScriptState {
        fn put(&mut self, addr: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
        }

        fn put_u64(&mut self, addr: u64, value: u64) {
            self.put(addr, &value.to_le_bytes());
        }

        fn fill(&mut self, addr: u64, len: u64) {
            for i in 0..len {
                self.mem.entry(addr + i).or_insert(0x90);
            }
        }
    }

    #[derive(Clone)]
    struct ScriptClient(Arc<Mutex<ScriptState>>);

    impl ScriptClient {
        fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
            self.0.lock().expect("script state poisoned")
        }
    }

    impl Client for ScriptClient {
        fn launch(&mut self, _path: &Path, _args: &[String]) -> Result<u64, Error> {
            Ok(0x999)
        }

        fn attach(&mut self, _pid: u64) -> Result<(), Error> {
            Ok(())
        }

        fn detach(&mut self) -> Result<(), Error> {
            self.state().detached = true;
            Ok(())
        }

        fn threads(&mut self) -> Result<Vec<Tid>, Error> {
            Ok(self.state().regs.keys().copied().collect())
        }

        fn read_regs(&mut self, tid: Tid) -> Result<Registers, Error> {
            self.state()
                .regs
                .get(&tid)
                .copied()
                .ok_or(Error::TaskNotStopped(tid))
        }

        fn write_regs(&mut self, tid: Tid, regs: &Registers) -> Result<(), Error> {
            self.state().regs.insert(tid, *regs);
            Ok(())
        }

        fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
            let state = self.state();
            for (i, out) in buf.iter_mut().enumerate() {
                *out = *state
                    .mem
                    .get(&(addr + i as u64))
                    .ok_or(Error::UnknownAddress(addr))?;
            }
            Ok(())
        }

        fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
            let mut state = self.state();
            for i in 0..data.len() as u64 {
                if !state.mem.contains_key(&(addr + i)) {
                    return Err(Error::UnknownAddress(addr));
                }
            }
            for (i, b) in data.iter().enumerate() {
                state.mem.insert(addr + i as u64, *b);
            }
            Ok(())
        }

        fn step(&mut self, tid: Tid) -> Result<Event, Error> {
            Ok(Event::Trapped(vec![tid]))
        }

        fn cont(&mut self) -> Result<Event, Error> {
            let mut state = self.state();
            match state.script.pop_front() {
                Some(Stop::Trap {
                    tid,
                    rip,
                    rsp,
                    mem_patch,
                }) => {
                    for (addr, value) in mem_patch {
                        state.put_u64(addr, value);
                    }
                    let regs = state.regs.entry(tid).or_default();
                    regs.rip = rip;
                    regs.rsp = rsp;
                    Ok(Event::Trapped(vec![tid]))
                }
                Some(Stop::Exit(status)) => Ok(Event::Exited(status)),
                None => Ok(Event::Exited(0)),
            }
        }

        fn read_tls(&mut self, tid: Tid, _offset: u32) -> Result<u64, Error> {
            self.state()
                .tls
                .get(&tid)
                .copied()
                .ok_or(Error::NoTask(tid))
        }

        fn stop_trigger(&self) -> StopTrigger {
            Box::new(|| {})
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn test_binary() -> Binary {
        Binary::from_symbols(vec![
            FuncSym {
                name: "main.main".to_string(),
                addr: MAIN,
                size: 0x100,
            },
            FuncSym {
                name: "main.fa".to_string(),
                addr: FA,
                size: 0x100,
            },
            FuncSym {
                name: "main.fb".to_string(),
                addr: FB,
                size: 0x100,
            },
            FuncSym {
                name: "runtime.mstart".to_string(),
                addr: 0x1300,
                size: 0x80,
            },
        ])
    }

    fn put_task(state: &mut ScriptState, g_addr: u64, goid: i64, stack: (u64, u64)) {
        let layouts = crate::goruntime::Layouts::select(GoVersion::default());
        state.fill(g_addr, 0x100);
        state.put_u64(g_addr + layouts.g.stack_lo, stack.0);
        state.put_u64(g_addr + layouts.g.stack_hi, stack.1);
        state.put_u64(g_addr + layouts.g.id, goid as u64);
        state.put_u64(g_addr + layouts.g.parked_pc, 0);
    }

    fn script_client(stops: Vec<Stop>) -> ScriptClient {
        let mut state = ScriptState {
            script: stops.into(),
            ..Default::default()
        };
        // text plus the stack windows the controller reads
        state.fill(0x1000, 0x400);
        state.fill(G1_STACK.0, G1_STACK.1 - G1_STACK.0);
        state.fill(G2_STACK.0, G2_STACK.1 - G2_STACK.0);
        put_task(&mut state, G1, 1, G1_STACK);
        put_task(&mut state, G2, 2, G2_STACK);
        state.tls.insert(10, G1);
        state.tls.insert(11, G2);
        ScriptClient(Arc::new(Mutex::new(state)))
    }

    fn controller_for(
        client: ScriptClient,
        trace_level: usize,
    ) -> (Controller<ScriptClient>, SharedBuf) {
        let mut config = TracerConfig::new("/unused/prog");
        config.trace_level = trace_level;
        let mut controller =
            Controller::from_parts(client, test_binary(), &config).expect("valid config");
        let buf = SharedBuf::default();
        controller.set_output(sink_from(buf.clone()));
        (controller, buf)
    }

    /// Count of `=> name` / `<= name` lines and the depth cap over an output.
    fn assert_balanced(output: &str, trace_level: usize) {
        let mut per_name: HashMap<&str, i64> = HashMap::new();
        for line in output.lines() {
            let trimmed = line.trim_start();
            let indent = (line.len() - trimmed.len()) / 2;
            assert!(
                indent + 1 <= trace_level,
                "line deeper than the trace level: {line:?}"
            );
            let (delta, rest) = if let Some(rest) = trimmed.strip_prefix("=> ") {
                (1, rest)
            } else if let Some(rest) = trimmed.strip_prefix("<= ") {
                (-1, rest)
            } else {
                panic!("unexpected line: {line:?}");
            };
            let name = rest.split('(').next().unwrap();
            *per_name.entry(name).or_default() += delta;
        }
        for (name, balance) in per_name {
            assert_eq!(balance, 0, "unbalanced entries and exits of {name}");
        }
    }

    fn trap(tid: Tid, bp: u64, rsp: u64) -> Stop {
        Stop::Trap {
            tid,
            rip: bp + 1,
            rsp,
            mem_patch: vec![],
        }
    }

    fn trap_with_ret(tid: Tid, bp: u64, rsp: u64, ret_addr: u64) -> Stop {
        Stop::Trap {
            tid,
            rip: bp + 1,
            rsp,
            mem_patch: vec![(rsp, ret_addr)],
        }
    }

    #[test]
    fn test_entry_and_exit_lines() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            trap(10, 0x1050, 0x7ffe08),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client.clone(), 1);
        controller.add_start_trace_point(MAIN);

        controller.main_loop().unwrap();

        let output = buf.text();
        assert_eq!(output, "=> main.fa()\n<= main.fa()\n");
        assert_balanced(&output, 1);
        assert_eq!(output.matches("main.main").count(), 0);

        // the transient return-site breakpoint is gone, the armed entries
        // still hold the trap byte
        assert!(!controller.breakpoints.exists(0x1050));
        assert_eq!(client.state().mem[&0x1050], 0x90);
        assert!(controller.breakpoints.exists(FB));
        assert_eq!(client.state().mem[&FB], TRAP_INSTRUCTION);
    }

    #[test]
    fn test_depth_cap() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            // main.fb called from main.fa sits below the trace level
            trap_with_ret(10, FB, 0x7ffd00, 0x1150),
            trap(10, 0x1050, 0x7ffe08),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 1);
        controller.add_start_trace_point(MAIN);

        controller.main_loop().unwrap();

        let output = buf.text();
        assert_eq!(output, "=> main.fa()\n<= main.fa()\n");
        assert_eq!(output.matches("main.fb").count(), 0);
        assert_balanced(&output, 1);
    }

    #[test]
    fn test_nested_depth_two() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            trap_with_ret(10, FB, 0x7ffd00, 0x1150),
            trap(10, 0x1150, 0x7ffd08),
            trap(10, 0x1050, 0x7ffe08),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 2);
        controller.add_start_trace_point(MAIN);

        controller.main_loop().unwrap();

        let output = buf.text();
        assert_eq!(
            output,
            "=> main.fa()\n  => main.fb()\n  <= main.fb()\n<= main.fa()\n"
        );
        assert_balanced(&output, 2);
    }

    #[test]
    fn test_per_task_attribution() {
        let client = script_client(vec![
            trap(10, FA, 0x7ffe00),
            trap(11, FA, 0x7f7e00),
            trap_with_ret(10, FB, 0x7ffd00, 0x1150),
            trap_with_ret(11, FB, 0x7f7d00, 0x1150),
            trap(10, 0x1150, 0x7ffd08),
            trap(11, 0x1150, 0x7f7d08),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 1);
        controller.add_start_trace_point(FA);

        controller.main_loop().unwrap();

        let output = buf.text();
        assert_eq!(output.matches("=> main.fb()").count(), 2);
        assert_eq!(output.matches("<= main.fb()").count(), 2);
        assert_eq!(output.matches("main.fa").count(), 0);
        assert_balanced(&output, 1);
    }

    #[test]
    fn test_end_trace_point_stops_emission() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            trap(10, 0x1050, 0x7ffe08),
            // main.fb entry doubles as the end point here
            trap(10, FB, 0x7ffe00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 1);
        controller.add_start_trace_point(MAIN);
        controller.add_end_trace_point(FB);

        controller.main_loop().unwrap();

        let output = buf.text();
        // the second main.fa call happens outside the traced region
        assert_eq!(output, "=> main.fa()\n<= main.fa()\n");
        assert_eq!(output.matches("main.fb").count(), 0);
    }

    #[test]
    fn test_missed_return_rebalanced_by_stack_usage() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            trap_with_ret(10, FA, 0x7ffe00, 0x1050),
            // main.fa never returns through its return site (think panic);
            // main.fb reuses the same stack slot
            trap_with_ret(10, FB, 0x7ffe00, 0x1060),
            trap(10, 0x1060, 0x7ffe08),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 1);
        controller.add_start_trace_point(MAIN);

        controller.main_loop().unwrap();

        let output = buf.text();
        assert_eq!(
            output,
            "=> main.fa()\n<= main.fa()\n=> main.fb()\n<= main.fb()\n"
        );
        assert_balanced(&output, 1);
    }

    #[test]
    fn test_unrelated_trap_is_ignored() {
        let client = script_client(vec![
            trap(10, MAIN, 0x7fff00),
            // a trap at an address without any breakpoint of ours
            trap(10, 0x2fff, 0x7fff00),
            Stop::Exit(0),
        ]);
        let (mut controller, buf) = controller_for(client, 1);
        controller.add_start_trace_point(MAIN);

        controller.main_loop().unwrap();
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn test_interrupt_clears_breakpoints_and_detaches() {
        let client = script_client(vec![trap(10, MAIN, 0x7fff00)]);
        let (mut controller, _buf) = controller_for(client.clone(), 1);
        controller.add_start_trace_point(MAIN);

        let handle = controller.handle();
        handle.interrupt();

        let res = controller.main_loop();
        assert!(matches!(res, Err(Error::Interrupted)));

        let state = client.state();
        assert!(state.detached);
        assert!(
            state.mem.values().all(|b| *b != TRAP_INSTRUCTION),
            "a trap byte survived the interrupt"
        );
        assert!(controller.breakpoints.is_empty());
    }

    #[test]
    fn test_pending_point_survives_unmapped_address() {
        let client = script_client(vec![trap(10, MAIN, 0x7fff00), Stop::Exit(0)]);
        let (mut controller, _buf) = controller_for(client, 1);
        controller.add_start_trace_point(MAIN);
        // far outside the mapped image, stays pending the whole session
        controller.add_start_trace_point(0xdead0000);

        controller.main_loop().unwrap();

        assert!(controller.breakpoints.exists(MAIN));
        assert!(!controller.breakpoints.exists(0xdead0000));
        assert_eq!(controller.pending_points.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TracerConfig::new("/unused/prog");
        config.trace_level = 0;
        let client = script_client(vec![]);
        assert!(matches!(
            Controller::from_parts(client, test_binary(), &config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
