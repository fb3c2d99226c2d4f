//! Debug-API client speaking the gdb-remote serial protocol to an lldb
//! `debugserver`. See <https://sourceware.org/gdb/onlinedocs/gdb/Remote-Protocol.html>
//! and the lldb extensions in `lldb-gdb-remote.txt`.

use crate::debugapi::{Client, Event, OutputSink, Registers, StopTrigger, Tid, stdout_sink};
use crate::error::Error;
use crate::{muted_error, weak_error};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

// The reply packet is assumed to be not larger than this.
const MAX_PACKET_SIZE: usize = 4096;

// Read timeout after which a lost stop reply is suspected.
const STOP_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// Signal numbers as the darwin debugserver reports them.
const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;
const SIGSTOP: u8 = 17;

const DEBUG_SERVER_PATHS: &[&str] = &[
    "/Library/Developer/CommandLineTools/Library/PrivateFrameworks/LLDB.framework/Versions/A/Resources/debugserver",
    "/Applications/Xcode.app/Contents/SharedFrameworks/LLDB.framework/Resources/debugserver",
];

#[derive(Debug, Clone, Default)]
struct RegisterMetadata {
    name: String,
    offset: usize,
    size: usize,
}

/// Debug-API client backed by lldb's debugserver.
pub struct LldbClient {
    conn: Option<TcpStream>,
    server: Option<Child>,
    kill_on_detach: bool,
    no_ack_mode: bool,
    registers: Vec<RegisterMetadata>,
    buf: Vec<u8>,
    // destination for the `O` packets carrying the inferior's output
    out: OutputSink,

    read_tls_stub_addr: u64,
    current_tls_offset: Option<u32>,
    pending_signal: u8,
}

impl LldbClient {
    pub fn new() -> Self {
        Self::with_output(stdout_sink())
    }

    pub fn with_output(out: OutputSink) -> Self {
        Self {
            conn: None,
            server: None,
            kill_on_detach: false,
            no_ack_mode: false,
            registers: vec![],
            buf: vec![0; MAX_PACKET_SIZE],
            out,
            read_tls_stub_addr: 0,
            current_tls_offset: None,
            pending_signal: 0,
        }
    }

    fn spawn_server(&mut self, server_args: &[String]) -> Result<(), Error> {
        let listener =
            TcpListener::bind("127.0.0.1:0").map_err(Error::Transport)?;
        let addr = listener.local_addr().map_err(Error::Transport)?;

        let path = debug_server_path()?;
        let mut cmd = Command::new(path);
        cmd.arg("-F").arg("-R").arg(addr.to_string()).args(server_args);
        cmd.stdin(Stdio::null());
        // a separate process group, otherwise a terminal signal reaches
        // every group member
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(Error::Spawn)?;

        match wait_connect_or_exit(listener, &mut child) {
            Ok(conn) => {
                conn.set_nodelay(true).map_err(Error::Transport)?;
                self.conn = Some(conn);
                self.server = Some(child);
                Ok(())
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.set_no_ack_mode()?;
        self.q_supported()?;
        self.registers = self.collect_register_metadata()?;
        self.q_list_threads_in_stop_reply()?;

        // the stub length does not depend on the offset, any value works here
        let stub = build_read_tls_stub(0);
        self.read_tls_stub_addr = self.allocate_memory(stub.len())?;
        Ok(())
    }

    fn set_no_ack_mode(&mut self) -> Result<(), Error> {
        self.send("QStartNoAckMode")?;
        self.receive_ok()?;
        self.no_ack_mode = true;
        Ok(())
    }

    fn q_supported(&mut self) -> Result<(), Error> {
        self.send("qSupported:swbreak+;hwbreak+;no-resumed+")?;
        let _ = self.receive()?;
        Ok(())
    }

    fn q_list_threads_in_stop_reply(&mut self) -> Result<(), Error> {
        self.send("QListThreadsInStopReply")?;
        self.receive_ok()
    }

    fn collect_register_metadata(&mut self) -> Result<Vec<RegisterMetadata>, Error> {
        let mut regs = vec![];
        for id in 0.. {
            match self.q_register_info(id)? {
                Some(reg) => regs.push(reg),
                None => break,
            }
        }
        Ok(regs)
    }

    fn q_register_info(&mut self, id: usize) -> Result<Option<RegisterMetadata>, Error> {
        self.send(&format!("qRegisterInfo{id:x}"))?;
        let data = self.receive()?;

        if data.starts_with('E') {
            if data == "E45" {
                // the end of the register list
                return Ok(None);
            }
            return Err(Error::ErrorReply(data));
        }

        parse_register_metadata(&data).map(Some)
    }

    fn allocate_memory(&mut self, size: usize) -> Result<u64, Error> {
        self.send(&format!("_M{size:x},rwx"))?;
        let data = self.receive()?;
        if data.is_empty() || data.starts_with('E') {
            return Err(Error::ErrorReply(data));
        }
        hex_to_u64(&data, false)
    }

    fn deallocate_memory(&mut self, addr: u64) -> Result<(), Error> {
        self.send(&format!("_m{addr:x}"))?;
        self.receive_ok()
    }

    fn q_thread_stop_info(&mut self, tid: Tid) -> Result<String, Error> {
        self.send(&format!("qThreadStopInfo{tid:02x}"))?;
        let data = self.receive()?;
        if data.starts_with('E') {
            return Err(Error::ErrorReply(data));
        }
        Ok(data)
    }

    fn raw_registers(&mut self, tid: Tid) -> Result<String, Error> {
        self.send(&format!("g;thread:{tid:x};"))?;
        let data = self.receive()?;
        if data.starts_with('E') {
            return Err(Error::ErrorReply(data));
        }
        Ok(data)
    }

    fn kill_process(&mut self) -> Result<(), Error> {
        self.send("k")?;
        let data = self.receive()?;
        if !data.starts_with("X09") {
            return Err(Error::Protocol(format!("unexpected kill reply: {data}")));
        }
        // debugserver exits by itself after the kill
        Ok(())
    }

    fn update_read_tls_stub(&mut self, offset: u32) -> Result<(), Error> {
        if self.current_tls_offset == Some(offset) {
            return Ok(());
        }

        let stub = build_read_tls_stub(offset);
        self.write_mem(self.read_tls_stub_addr, &stub)?;
        self.current_tls_offset = Some(offset);
        Ok(())
    }

    fn continue_with_signal(&mut self, signal: u8) -> Result<(), Error> {
        let command = if signal == 0 {
            "vCont;c".to_string()
        } else {
            // debugserver swallows some signals (SIGTERM, SIGINT) instead of
            // delivering them; QPassSignals is not supported, so reinjection
            // is the best available option
            format!("vCont;C{signal:02x}")
        };
        self.send(&command)
    }

    fn wait_event(&mut self) -> Result<Event, Error> {
        loop {
            let data = match self.receive_with_timeout(STOP_REPLY_TIMEOUT) {
                Ok(data) => data,
                Err(Error::Transport(e))
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    // debugserver sometimes loses a stop reply though a
                    // thread is already stopped, probe the threads directly
                    match self.check_stop_reply()? {
                        Some(data) => {
                            log::debug!(
                                "no stop reply packet arrived though there is a stopped thread"
                            );
                            data
                        }
                        None => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            let mut replies = build_stop_replies(&data);
            self.drain_output_packets(&mut replies)?;
            if replies.is_empty() {
                continue;
            }

            if replies.len() > 1 {
                log::debug!("received multiple stop replies at once, only the first one is acted upon: {replies:?}");
            }
            let first = replies.remove(0);

            match first.as_bytes().first() {
                Some(b'T') => {
                    if let Some(event) = self.handle_t_packet(&first)? {
                        return Ok(event);
                    }
                    // the stop was consumed (signal reinjection), wait further
                }
                Some(b'W') => {
                    let status = hex_to_u64(first.get(1..3).unwrap_or_default(), false)?;
                    self.close();
                    return Ok(Event::Exited(status as i32));
                }
                Some(b'X') => {
                    let signal = hex_to_u64(first.get(1..3).unwrap_or_default(), false)?;
                    self.close();
                    return Ok(Event::Terminated(signal as i32));
                }
                _ => return Err(Error::Protocol(format!("unknown stop reply: {first}"))),
            }
        }
    }

    fn handle_t_packet(&mut self, packet: &str) -> Result<Option<Event>, Error> {
        let signal =
            hex_to_u64(packet.get(1..3).ok_or_else(|| short_packet(packet))?, false)? as u8;

        let mut tids = vec![];
        let body = packet.get(3..).unwrap_or_default().trim_end_matches(';');
        for pair in body.split(';') {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            if key == "threads" {
                for tid in value.split(',') {
                    tids.push(hex_to_u64(tid, false)?);
                }
            }
        }

        let trapped = self.select_trapped_threads(&tids)?;
        if trapped.is_empty() {
            if signal == SIGINT || signal == SIGSTOP {
                // an induced stop, surface it so the caller can observe its
                // interrupt flag
                self.pending_signal = 0;
                return Ok(Some(Event::Trapped(vec![])));
            }
            self.continue_with_signal(signal)?;
            return Ok(None);
        }

        self.pending_signal = if signal == SIGTRAP { 0 } else { signal };
        Ok(Some(Event::Trapped(trapped)))
    }

    fn select_trapped_threads(&mut self, tids: &[Tid]) -> Result<Vec<Tid>, Error> {
        let mut trapped = vec![];
        for &tid in tids {
            let data = self.q_thread_stop_info(tid)?;
            let signal = hex_to_u64(data.get(1..3).ok_or_else(|| short_packet(&data))?, false)?;
            if signal as u8 == SIGTRAP {
                trapped.push(tid);
            }
        }
        Ok(trapped)
    }

    fn check_stop_reply(&mut self) -> Result<Option<String>, Error> {
        let tids = self.threads()?;
        for tid in tids {
            let data = self.q_thread_stop_info(tid)?;
            if !data.starts_with("T00") {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    fn drain_output_packets(&mut self, replies: &mut Vec<String>) -> Result<(), Error> {
        let mut rest = Vec::with_capacity(replies.len());
        for reply in replies.drain(..) {
            if !reply.starts_with('O') || reply == "OK" {
                rest.push(reply);
                continue;
            }

            let out = hex_to_bytes(&reply[1..])?;
            let mut sink = self.out.lock().expect("output sink poisoned");
            sink.write_all(&out).map_err(Error::Transport)?;
        }
        *replies = rest;
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), Error> {
        let packet = if self.no_ack_mode {
            format!("${command}#00")
        } else {
            format!("${command}#{:02x}", checksum(command.as_bytes()))
        };

        let conn = self.conn_mut()?;
        conn.write_all(packet.as_bytes()).map_err(Error::Transport)?;

        if !self.no_ack_mode {
            return self.receive_ack();
        }
        Ok(())
    }

    fn receive_ok(&mut self) -> Result<(), Error> {
        let data = self.receive()?;
        if data != "OK" {
            return Err(Error::ErrorReply(data));
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<String, Error> {
        let mut raw: Vec<u8> = vec![];
        loop {
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| Error::Transport(ErrorKind::NotConnected.into()))?;
            let n = conn.read(&mut self.buf).map_err(Error::Transport)?;
            if n == 0 {
                return Err(Error::Transport(ErrorKind::UnexpectedEof.into()));
            }

            raw.extend_from_slice(&self.buf[..n]);
            if raw.len() < 4 {
                // there should be at least 4 bytes
                continue;
            }
            if raw[raw.len() - 3] == b'#' {
                // received at least one complete packet
                break;
            }
        }

        let packet = String::from_utf8_lossy(&raw).into_owned();
        let data = packet[1..packet.len() - 3].to_string();
        if !self.no_ack_mode {
            verify_packet(&packet)?;
            self.send_ack()?;
        }
        Ok(data)
    }

    fn receive_with_timeout(&mut self, timeout: Duration) -> Result<String, Error> {
        self.conn_mut()?
            .set_read_timeout(Some(timeout))
            .map_err(Error::Transport)?;
        let res = self.receive();
        if let Ok(conn) = self.conn_mut() {
            let _ = conn.set_read_timeout(None);
        }
        res
    }

    fn send_ack(&mut self) -> Result<(), Error> {
        self.conn_mut()?.write_all(b"+").map_err(Error::Transport)
    }

    fn receive_ack(&mut self) -> Result<(), Error> {
        let mut ack = [0u8; 1];
        self.conn_mut()?
            .read_exact(&mut ack)
            .map_err(Error::Transport)?;
        if ack[0] != b'+' {
            return Err(Error::Protocol("ack expected".to_string()));
        }
        Ok(())
    }

    fn conn_mut(&mut self) -> Result<&mut TcpStream, Error> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Transport(ErrorKind::NotConnected.into()))
    }

    fn close(&mut self) {
        self.conn = None;
        if let Some(mut server) = self.server.take() {
            let _ = server.wait();
        }
    }
}

impl Client for LldbClient {
    fn launch(&mut self, path: &Path, args: &[String]) -> Result<u64, Error> {
        let mut server_args = vec!["--".to_string(), path.display().to_string()];
        server_args.extend(args.iter().cloned());
        self.spawn_server(&server_args)?;
        self.kill_on_detach = true;
        self.initialize()?;

        let pid = self
            .server
            .as_ref()
            .map(|child| child.id() as u64)
            .unwrap_or_default();
        Ok(pid)
    }

    fn attach(&mut self, pid: u64) -> Result<(), Error> {
        // fail fast instead of waiting for the debug server to give up
        if let Err(nix::errno::Errno::ESRCH) =
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None)
        {
            return Err(Error::ProcessNotFound(pid));
        }

        self.spawn_server(&[format!("--attach={pid}")])?;
        self.kill_on_detach = false;
        self.initialize()
    }

    fn detach(&mut self) -> Result<(), Error> {
        if self.conn.is_none() {
            return Ok(());
        }

        if self.kill_on_detach {
            let res = self.kill_process();
            self.close();
            return res;
        }

        if self.read_tls_stub_addr != 0 {
            muted_error!(self.deallocate_memory(self.read_tls_stub_addr));
        }
        self.send("D")?;
        let res = self.receive_ok();
        self.close();
        res
    }

    fn threads(&mut self) -> Result<Vec<Tid>, Error> {
        self.send("qfThreadInfo")?;
        let data = self.receive()?;
        let Some(list) = data.strip_prefix('m') else {
            return Err(Error::Protocol(format!("unexpected thread info: {data}")));
        };

        let mut tids = vec![];
        for tid in list.split(',').filter(|t| !t.is_empty()) {
            tids.push(hex_to_u64(tid, false)?);
        }
        Ok(tids)
    }

    fn read_regs(&mut self, tid: Tid) -> Result<Registers, Error> {
        let data = self.raw_registers(tid)?;
        parse_registers(&self.registers, &data)
    }

    fn write_regs(&mut self, tid: Tid, regs: &Registers) -> Result<(), Error> {
        // the single-register `P` command is not used, debugserver handles it
        // inconsistently between versions; splice the full register file
        let data = self.raw_registers(tid)?;
        let data = splice_registers(&self.registers, data, regs)?;

        self.send(&format!("G{data};thread:{tid:x};"))?;
        self.receive_ok()
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.send(&format!("m{addr:x},{:x}", buf.len()))?;
        let data = self.receive()?;
        if data.starts_with('E') {
            return Err(Error::ErrorReply(data));
        }

        let bytes = hex_to_bytes(&data)?;
        if bytes.len() < buf.len() {
            log::debug!(
                "short memory read at {addr:#x}: {} of {} bytes",
                bytes.len(),
                buf.len()
            );
        }
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
        self.send(&format!("M{addr:x},{:x}:{hex}", data.len()))?;
        self.receive_ok()
    }

    fn step(&mut self, tid: Tid) -> Result<Event, Error> {
        let command = if self.pending_signal == 0 {
            format!("vCont;s:{tid:x}")
        } else {
            format!("vCont;S{:02x}:{tid:x}", self.pending_signal)
        };
        self.send(&command)?;

        match self.wait_event()? {
            Event::Trapped(tids) => {
                if tids != [tid] {
                    return Err(Error::UnspecifiedTask(tids));
                }
                Ok(Event::Trapped(tids))
            }
            Event::Exited(status) => Err(Error::Exited(status)),
            Event::Terminated(signal) => Err(Error::Terminated(signal)),
        }
    }

    fn cont(&mut self) -> Result<Event, Error> {
        self.continue_with_signal(self.pending_signal)?;
        self.wait_event()
    }

    fn read_tls(&mut self, tid: Tid, offset: u32) -> Result<u64, Error> {
        self.update_read_tls_stub(offset)?;

        let saved = self.read_regs(tid)?;
        let mut redirected = saved;
        redirected.rip = self.read_tls_stub_addr;
        self.write_regs(tid, &redirected)?;

        let value = self
            .step(tid)
            .and_then(|_| self.read_regs(tid))
            .map(|regs| regs.rcx);

        weak_error!(self.write_regs(tid, &saved), "restore registers:");
        value
    }

    fn stop_trigger(&self) -> StopTrigger {
        let conn = self.conn.as_ref().and_then(|c| c.try_clone().ok());
        Box::new(move || {
            if let Some(conn) = &conn {
                // the protocol interrupt byte, debugserver stops the inferior
                // and emits a stop reply in response
                let _ = (&*conn).write_all(&[0x03]);
            }
        })
    }
}

impl Default for LldbClient {
    fn default() -> Self {
        Self::new()
    }
}

fn debug_server_path() -> Result<&'static str, Error> {
    DEBUG_SERVER_PATHS
        .iter()
        .find(|path| Path::new(path).exists())
        .copied()
        .ok_or_else(|| {
            Error::Spawn(std::io::Error::new(
                ErrorKind::NotFound,
                format!("debugserver is not found in any of: {DEBUG_SERVER_PATHS:?}"),
            ))
        })
}

/// Race the child exit against the inbound connection, whichever resolves
/// first decides the launch outcome. Both watchers are joined before return.
fn wait_connect_or_exit(listener: TcpListener, child: &mut Child) -> Result<TcpStream, Error> {
    let addr = listener.local_addr().map_err(Error::Transport)?;
    let (conn_tx, conn_rx) = mpsc::channel();
    let acceptor = std::thread::spawn(move || {
        let _ = conn_tx.send(listener.accept());
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let outcome = loop {
        match conn_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(Ok((conn, _))) => break Ok(conn),
            Ok(Err(e)) => break Err(Error::Transport(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break Err(Error::ServerGone),
        }

        if child.try_wait().map_err(Error::Transport)?.is_some() {
            // unblock the acceptor with a dummy connection so it can be joined
            let _ = TcpStream::connect(addr);
            break Err(Error::ServerGone);
        }
        if std::time::Instant::now() > deadline {
            let _ = TcpStream::connect(addr);
            break Err(Error::Transport(ErrorKind::TimedOut.into()));
        }
    };

    let _ = acceptor.join();
    outcome
}

fn parse_register_metadata(data: &str) -> Result<RegisterMetadata, Error> {
    let mut reg = RegisterMetadata::default();
    for chunk in data.split(';') {
        let Some((key, value)) = chunk.split_once(':') else {
            continue;
        };
        match key {
            "name" => reg.name = value.to_string(),
            "bitsize" => {
                let bits: usize = value
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad bitsize: {value}")))?;
                reg.size = bits / 8;
            }
            "offset" => {
                reg.offset = value
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad offset: {value}")))?;
            }
            _ => {}
        }
    }
    Ok(reg)
}

/// Write the named register values into a raw register file, leaving every
/// other register untouched.
fn splice_registers(
    metadata: &[RegisterMetadata],
    mut data: String,
    regs: &Registers,
) -> Result<String, Error> {
    for meta in metadata {
        let Some(value) = regs.by_name(&meta.name) else {
            continue;
        };
        let start = meta.offset * 2;
        let end = (meta.offset + meta.size) * 2;
        if end > data.len() {
            return Err(Error::Protocol(format!(
                "register {} is out of the register file",
                meta.name
            )));
        }
        data.replace_range(start..end, &u64_to_hex(value, true));
    }
    Ok(data)
}

fn parse_registers(metadata: &[RegisterMetadata], data: &str) -> Result<Registers, Error> {
    let mut regs = Registers::default();
    for meta in metadata {
        if regs.by_name(&meta.name).is_none() {
            continue;
        }
        let raw = data
            .get(meta.offset * 2..(meta.offset + meta.size) * 2)
            .ok_or_else(|| {
                Error::Protocol(format!("register {} is out of the register file", meta.name))
            })?;
        regs.set_by_name(&meta.name, hex_to_u64(raw, true)?);
    }
    Ok(regs)
}

/// The 9-byte stub `mov rcx, gs:[offset]`: loads the value at the given
/// offset from the TLS block into the scratch register.
fn build_read_tls_stub(offset: u32) -> [u8; 9] {
    let mut stub = [0x65, 0x48, 0x8b, 0x0c, 0x25, 0, 0, 0, 0];
    stub[5..].copy_from_slice(&offset.to_le_bytes());
    stub
}

/// A stop reply may carry several `$...#xx` packets glued together; split
/// them back apart.
fn build_stop_replies(data: &str) -> Vec<String> {
    data.split('$')
        .filter(|reply| !reply.is_empty())
        .map(|reply| {
            let bytes = reply.as_bytes();
            if bytes.len() >= 3 && bytes[bytes.len() - 3] == b'#' {
                reply[..reply.len() - 3].to_string()
            } else {
                reply.to_string()
            }
        })
        .collect()
}

fn verify_packet(packet: &str) -> Result<(), Error> {
    let bytes = packet.as_bytes();
    if bytes.first() != Some(&b'$') {
        return Err(Error::Protocol(format!("invalid packet head: {packet}")));
    }
    if bytes.len() < 4 || bytes[bytes.len() - 3] != b'#' {
        return Err(Error::Protocol(format!("invalid packet tail: {packet}")));
    }

    let body = &packet[1..packet.len() - 3];
    let expected = format!("{:02x}", checksum(body.as_bytes()));
    let tail = &packet[packet.len() - 2..];
    if tail != expected {
        return Err(Error::Protocol(format!("invalid checksum: {tail}")));
    }
    Ok(())
}

fn short_packet(packet: &str) -> Error {
    Error::Protocol(format!("packet is too short: {packet}"))
}

fn checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn hex_to_u64(hex: &str, little_endian: bool) -> Result<u64, Error> {
    let normalized = if little_endian {
        let mut reversed = String::with_capacity(hex.len());
        let mut i = hex.len() as i64 - 2;
        while i >= 0 {
            reversed.push_str(&hex[i as usize..i as usize + 2]);
            i -= 2;
        }
        reversed
    } else {
        hex.to_string()
    };
    u64::from_str_radix(&normalized, 16)
        .map_err(|_| Error::Protocol(format!("invalid hex value: {hex}")))
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, Error> {
    if hex.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd hex string: {hex}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::Protocol(format!("invalid hex byte: {}", &hex[i..i + 2])))
        })
        .collect()
}

fn u64_to_hex(value: u64, little_endian: bool) -> String {
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b"qSupported"), 0x37);
    }

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(hex_to_u64("deadbeef", false).unwrap(), 0xdeadbeef);
        assert_eq!(
            hex_to_u64(&u64_to_hex(0x1122334455667788, true), true).unwrap(),
            0x1122334455667788
        );
        assert_eq!(u64_to_hex(0x01, true), "0100000000000000");
        assert!(hex_to_u64("xyz", false).is_err());
    }

    #[test]
    fn test_hex_to_bytes() {
        assert_eq!(hex_to_bytes("0001ff").unwrap(), vec![0x00, 0x01, 0xff]);
        assert!(hex_to_bytes("0").is_err());
        assert!(hex_to_bytes("zz").is_err());
    }

    #[test]
    fn test_verify_packet() {
        assert!(verify_packet("$OK#9a").is_ok());
        assert!(verify_packet("$OK#00").is_err());
        assert!(verify_packet("OK#9a").is_err());
        assert!(verify_packet("$#").is_err());
    }

    #[test]
    fn test_build_stop_replies() {
        assert_eq!(build_stop_replies("T05threads:1;"), vec!["T05threads:1;"]);
        assert_eq!(
            build_stop_replies("T05threads:1;#a1$T05threads:2;"),
            vec!["T05threads:1;", "T05threads:2;"]
        );
        assert_eq!(build_stop_replies("W00"), vec!["W00"]);
    }

    #[test]
    fn test_parse_register_metadata() {
        let reg =
            parse_register_metadata("name:rip;bitsize:64;offset:128;encoding:uint;").unwrap();
        assert_eq!(reg.name, "rip");
        assert_eq!(reg.size, 8);
        assert_eq!(reg.offset, 128);
    }

    #[test]
    fn test_parse_registers() {
        let metadata = vec![
            RegisterMetadata {
                name: "rip".to_string(),
                offset: 0,
                size: 8,
            },
            RegisterMetadata {
                name: "fctrl".to_string(),
                offset: 8,
                size: 4,
            },
        ];
        let regs = parse_registers(&metadata, "020100000000000037130000").unwrap();
        assert_eq!(regs.rip, 0x102);
        // unknown registers are preserved by splicing, not materialized
        assert_eq!(regs.rcx, 0);

        assert!(parse_registers(&metadata, "0201").is_err());
    }

    #[test]
    fn test_register_write_round_trip() {
        let metadata = vec![
            RegisterMetadata {
                name: "rip".to_string(),
                offset: 0,
                size: 8,
            },
            RegisterMetadata {
                name: "fctrl".to_string(),
                offset: 8,
                size: 4,
            },
        ];
        let data = "020100000000000037130000".to_string();

        // writing back the values just read must not change the file
        let regs = parse_registers(&metadata, &data).unwrap();
        let spliced = splice_registers(&metadata, data.clone(), &regs).unwrap();
        assert_eq!(spliced, data);

        // a modified register lands in its window only
        let mut regs = regs;
        regs.rip = 0x505;
        let spliced = splice_registers(&metadata, data, &regs).unwrap();
        assert_eq!(spliced, "050500000000000037130000");
    }

    #[test]
    fn test_build_read_tls_stub() {
        let stub = build_read_tls_stub(0x30);
        assert_eq!(stub, [0x65, 0x48, 0x8b, 0x0c, 0x25, 0x30, 0, 0, 0]);
        assert_eq!(build_read_tls_stub(0).len(), 9);
    }
}
