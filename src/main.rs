//! Debug adapter entry point.
//!
//! Listens on one transport (`--port` or `--pipe`, mutually exclusive),
//! serves DAP clients sequentially (one session per connection) and exits
//! 0 on a clean stop, 1 on a fatal error.

use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};

use dapper::dap::transport::{ListenAddr, Listener};
use dapper::server::DebugSession;

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "UPPER")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            // The log facade has no critical level; errors are the closest.
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on.
    #[clap(long, conflicts_with = "pipe", required_unless_present = "pipe")]
    port: Option<u16>,

    /// Named pipe to listen on instead of TCP.
    #[clap(long)]
    pipe: Option<String>,

    /// Host address for TCP listening.
    #[clap(long, default_value = "localhost")]
    host: String,

    /// Log verbosity.
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,
}

fn main() {
    let args = Args::parse();

    let level: LevelFilter = args.log_level.into();
    env_logger::Builder::new().filter_level(level).init();

    if let Err(err) = ctrlc::set_handler(|| {
        info!(target: "dap", "interrupted, shutting down");
        std::process::exit(0);
    }) {
        warn!(target: "dap", "failed to install interrupt handler: {err}");
    }

    std::process::exit(match run(args) {
        Ok(()) => 0,
        Err(err) => {
            log::error!(target: "dap", "fatal: {err:#}");
            1
        }
    });
}

fn run(args: Args) -> anyhow::Result<()> {
    let addr = match &args.pipe {
        Some(name) => ListenAddr::Pipe { name: name.clone() },
        None => ListenAddr::Tcp {
            host: args.host.clone(),
            port: args.port.expect("clap enforces port xor pipe"),
        },
    };
    let listener = Listener::bind(&addr)?;
    info!(target: "dap", "dapper listening on {}", listener.bound_addr());

    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected");

        let mut session = DebugSession::new(stream)?;
        match session.run() {
            Ok(()) => info!(target: "dap", "session finished"),
            Err(err) => warn!(target: "dap", "session ended with error: {err:#}"),
        }
        drop(session);

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
