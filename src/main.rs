use anyhow::Context;
use clap::{Parser, Subcommand};
use goshawk::debugapi::lldb::LldbClient;
use goshawk::debugapi::stdout_sink;
use goshawk::error::Error;
use goshawk::log::enable_stderr_log;
use goshawk::service;
use goshawk::tracer::{Controller, TracerConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "goshawk", about = "Function-call tracer for Go programs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a program and trace the calls it makes
    Trace {
        program: PathBuf,
        /// Arguments passed through to the program
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Function whose body opens the traced region
        #[arg(long, default_value = "main.main")]
        start_func: String,
        /// Depth of the traced call tree
        #[arg(long, default_value_t = 1)]
        tracelevel: usize,
        /// Depth of the printed value trees
        #[arg(long, default_value_t = 1)]
        parselevel: usize,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Attach to a running process
    Attach {
        pid: u64,
        program: PathBuf,
        #[arg(long, default_value = "main.main")]
        start_func: String,
        /// Module data address for binaries without debug information
        #[arg(long, value_parser = parse_addr)]
        firstmoduledata: Option<u64>,
        /// Toolchain version override, e.g. go1.11.2
        #[arg(long)]
        goversion: Option<String>,
        #[arg(long, default_value_t = 1)]
        tracelevel: usize,
        #[arg(long, default_value_t = 1)]
        parselevel: usize,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Serve the RPC surface the in-process helper library connects to
    Server {
        #[arg(default_value = "127.0.0.1:7654")]
        addr: String,
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Trace {
            program,
            args,
            start_func,
            tracelevel,
            parselevel,
            verbose,
        } => {
            enable_stderr_log(verbose);
            let mut config = TracerConfig::new(program);
            config.trace_level = tracelevel;
            config.parse_level = parselevel;
            config.verbose = verbose;
            run_trace(config, &start_func, Launch::Spawn(args))
        }
        Command::Attach {
            pid,
            program,
            start_func,
            firstmoduledata,
            goversion,
            tracelevel,
            parselevel,
            verbose,
        } => {
            enable_stderr_log(verbose);
            let mut config = TracerConfig::new(program);
            config.trace_level = tracelevel;
            config.parse_level = parselevel;
            config.verbose = verbose;
            config.first_module_data_addr = firstmoduledata.unwrap_or(0);
            config.go_version = goversion;
            run_trace(config, &start_func, Launch::Attach(pid))
        }
        Command::Server { addr, verbose } => {
            enable_stderr_log(verbose);
            service::serve(&addr).context("serve the tracer service")
        }
    }
}

enum Launch {
    Spawn(Vec<String>),
    Attach(u64),
}

fn run_trace(config: TracerConfig, start_func: &str, launch: Launch) -> anyhow::Result<()> {
    let out = stdout_sink();
    let client = LldbClient::with_output(out.clone());
    let mut controller = Controller::new(client, &config)
        .with_context(|| format!("open {}", config.program_path.display()))?;
    controller.set_output(out);

    match launch {
        Launch::Spawn(args) => {
            controller.launch_tracee(&args).context("launch")?;
        }
        Launch::Attach(pid) => {
            controller
                .attach_tracee(pid)
                .with_context(|| format!("attach to pid {pid}"))?;
        }
    }

    let start = controller
        .binary()
        .function_by_name(start_func)
        .with_context(|| format!("function {start_func} not found in the binary"))?;
    controller.add_start_trace_point(start.entry);

    let handle = controller.handle();
    ctrlc::set_handler(move || handle.interrupt()).context("install the interrupt handler")?;

    match controller.main_loop() {
        Ok(()) => Ok(()),
        Err(Error::Interrupted) => {
            eprintln!("interrupted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
}
