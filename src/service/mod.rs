//! RPC surface for the in-process helper library: attach to a process, add
//! trace points while the trace runs, detach. One client per server; the
//! listening socket closes as soon as that client connects.

use crate::debugapi::lldb::LldbClient;
use crate::error::Error;
use crate::tracer::{Controller, TracerConfig, TracerHandle};
use crate::weak_error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

/// Bumped on every incompatible change of the service methods.
pub const SERVICE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Version,
    Attach(AttachArgs),
    Detach,
    AddStartTracePoint { addr: u64 },
    AddEndTracePoint { addr: u64 },
}

/// Input of [`Request::Attach`]. The initial start point is required
/// because the attached process runs on before the client gets another
/// chance to add trace points.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttachArgs {
    pub pid: u64,
    pub trace_level: usize,
    pub parse_level: usize,
    pub initial_start_point: u64,
    pub verbose: bool,
    pub go_version: String,
    pub program_path: String,
    pub first_module_data_addr: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            result: None,
            error: Some(message),
        }
    }
}

struct Session {
    handle: TracerHandle,
    worker: JoinHandle<Result<(), Error>>,
}

/// Dispatcher over one attached tracing session.
#[derive(Default)]
struct TracerService {
    session: Option<Session>,
}

impl TracerService {
    fn dispatch(&mut self, request: Request) -> Response {
        let res = match request {
            Request::Version => return Response::ok(json!(SERVICE_VERSION)),
            Request::Attach(args) => self.attach(args),
            Request::Detach => self.detach(),
            Request::AddStartTracePoint { addr } => {
                if let Some(session) = &self.session {
                    session.handle.add_start_trace_point(addr);
                }
                Ok(())
            }
            Request::AddEndTracePoint { addr } => {
                if let Some(session) = &self.session {
                    session.handle.add_end_trace_point(addr);
                }
                Ok(())
            }
        };

        match res {
            Ok(()) => Response::ok(json!(null)),
            Err(e) => Response::err(e.to_string()),
        }
    }

    fn attach(&mut self, args: AttachArgs) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidConfig("already attached".to_string()));
        }

        let mut config = TracerConfig::new(&args.program_path);
        config.trace_level = args.trace_level.max(1);
        config.parse_level = args.parse_level;
        config.verbose = args.verbose;
        config.first_module_data_addr = args.first_module_data_addr;
        if !args.go_version.is_empty() {
            config.go_version = Some(args.go_version.clone());
        }

        let mut controller = Controller::new(LldbClient::new(), &config)?;
        controller.attach_tracee(args.pid)?;
        controller.add_start_trace_point(args.initial_start_point);

        let handle = controller.handle();
        let worker = std::thread::spawn(move || {
            let res = controller.main_loop();
            if let Err(e) = &res {
                if !matches!(e, Error::Interrupted) {
                    log::warn!("tracing session failed: {e}");
                }
            }
            res
        });

        self.session = Some(Session { handle, worker });
        Ok(())
    }

    fn detach(&mut self) -> Result<(), Error> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.handle.interrupt();
        match session.worker.join() {
            Ok(Ok(())) | Ok(Err(Error::Interrupted)) => log::debug!("detached"),
            Ok(Err(e)) => log::warn!("the session ended with an error: {e}"),
            Err(_) => log::warn!("the session worker panicked"),
        }
        Ok(())
    }
}

/// Serve the tracer service on the given address.
pub fn serve(addr: &str) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)?;
    serve_on(listener)
}

/// Serve one client on an already bound listener. The listener closes right
/// after the accept, the service never takes a second client.
pub fn serve_on(listener: TcpListener) -> Result<(), Error> {
    let (conn, peer) = listener.accept()?;
    drop(listener);
    log::debug!("serving the tracer client at {peer}");
    serve_conn(conn)
}

fn serve_conn(conn: TcpStream) -> Result<(), Error> {
    let mut service = TracerService::default();
    let mut reader = BufReader::new(conn.try_clone()?);
    let mut writer = conn;

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("client connection lost: {e}");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => service.dispatch(request),
            Err(e) => Response::err(format!("malformed request: {e}")),
        };
        let payload =
            serde_json::to_string(&response).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
        writeln!(writer, "{payload}")?;
        writer.flush()?;
    }

    // the client may vanish without a Detach, leave the inferior clean
    weak_error!(service.detach(), "detach on disconnect:");
    Ok(())
}
