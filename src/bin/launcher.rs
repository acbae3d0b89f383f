//! Debuggee launcher entry point.
//!
//! Spawned by the adapter's external backend (or started standalone for
//! `attach`): connects back over the requested IPC transport (stdio when
//! none is given), installs the trace controller and runs the script
//! program once the adapter releases the configuration gate.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dapper::backend::ipc::{connect_addr, IpcChannel, IpcWriter};
use dapper::dap::transport;
use dapper::debugger::tracer::TraceController;
use dapper::launcher::{CommandService, ConfigGate, IpcSink};
use dapper::runtime::script::{parse_program, ScriptRuntime};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the script program to debug.
    #[clap(long)]
    program: String,

    /// Arguments passed to the debugged program (repeatable).
    #[clap(long = "arg")]
    args: Vec<String>,

    /// Stop at the entry point of the program.
    #[clap(long)]
    stop_on_entry: bool,

    /// Run the program without debugging.
    #[clap(long)]
    no_debug: bool,

    /// IPC transport used to connect back to the adapter.
    #[clap(long, value_parser = ["tcp", "unix", "pipe"])]
    ipc: Option<String>,

    /// IPC TCP host.
    #[clap(long)]
    ipc_host: Option<String>,

    /// IPC TCP port.
    #[clap(long)]
    ipc_port: Option<u16>,

    /// IPC UNIX socket path.
    #[clap(long)]
    ipc_path: Option<String>,

    /// IPC pipe name.
    #[clap(long)]
    ipc_pipe: Option<String>,

    /// Use binary IPC frames.
    #[clap(long)]
    ipc_binary: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env().init();

    let args = Args::parse();

    let program_path = std::fs::canonicalize(&args.program)
        .with_context(|| format!("program not found: {}", args.program))?;
    let text = std::fs::read_to_string(&program_path)
        .with_context(|| format!("read {}", program_path.display()))?;
    let program = parse_program(&text, &program_path.to_string_lossy())
        .context("parse script program")?;

    // Command channel back to the adapter: socket when requested, stdio
    // otherwise. Binary framing only applies to socket transports.
    let binary = args.ipc_binary && args.ipc.is_some();
    let (channel, command_reader): (Arc<IpcChannel>, Box<dyn std::io::Read + Send>) =
        match args.ipc.as_deref() {
            Some(kind) => {
                let addr = connect_addr(
                    kind,
                    args.ipc_host.as_deref(),
                    args.ipc_port,
                    args.ipc_path.as_deref(),
                    args.ipc_pipe.as_deref(),
                )
                .context("resolve IPC coordinates")?;
                let stream = transport::connect(&addr).context("connect to adapter")?;
                let reader = stream.try_clone().context("clone IPC stream")?;
                (
                    Arc::new(IpcChannel::new(IpcWriter::Stream(stream), binary)),
                    Box::new(reader),
                )
            }
            None => (
                Arc::new(IpcChannel::new(IpcWriter::Stdout(std::io::stdout()), false)),
                Box::new(std::io::stdin()),
            ),
        };

    let controller = Arc::new(TraceController::new());
    controller.install_sink(Arc::new(IpcSink::new(channel.clone())));
    controller.set_stop_on_entry(args.stop_on_entry && !args.no_debug);

    let gate = Arc::new(ConfigGate::default());
    let service = CommandService {
        controller: controller.clone(),
        channel: channel.clone(),
        gate: gate.clone(),
    };
    std::thread::spawn(move || service.serve(command_reader, binary));

    let runtime = ScriptRuntime::new(program, controller.clone(), args.no_debug);
    runtime.set_argv(&args.args);

    // The adapter releases the gate with configurationDone.
    gate.wait();
    let code = runtime.run();
    controller.on_exit(code);

    std::process::exit(code);
}
