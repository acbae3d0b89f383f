//! Adapter↔debuggee IPC plumbing shared by the external backend and the
//! launcher child.
//!
//! Two wire formats over any transport: text (newline-delimited JSON with
//! `DBGP:` for debuggee→adapter messages and `DBGCMD:` for
//! adapter→debuggee commands) and the binary framing of [`crate::dap::binary`]
//! (kind 1 = event, kind 2 = command). Unprefixed text lines on the
//! debuggee side are program output.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Mutex;

use serde_json::Value as Json;

use crate::dap::binary::{pack_frame, read_frame, FrameKind};
use crate::dap::transport::{default_socket_path, DapStream, ListenAddr, Listener};
use crate::debugger::error::Error;

pub const EVENT_PREFIX: &str = "DBGP:";
pub const COMMAND_PREFIX: &str = "DBGCMD:";

/// Adapter-side endpoint prepared before the child is spawned: a bound
/// listener plus the CLI arguments telling the launcher where to connect.
pub struct IpcEndpoint {
    pub listener: Listener,
    pub child_args: Vec<String>,
}

pub fn prepare_listener(
    transport: Option<&str>,
    pipe_name: Option<&str>,
    binary: bool,
) -> Result<IpcEndpoint, Error> {
    let default_transport = if cfg!(unix) { "unix" } else { "tcp" };
    let transport = transport.unwrap_or(default_transport).to_ascii_lowercase();

    let (listener, mut child_args) = match transport.as_str() {
        "tcp" => {
            let listener = Listener::bind(&ListenAddr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 0,
            })?;
            let port = match listener.bound_addr() {
                crate::dap::transport::BoundAddr::Tcp(addr) => addr.port(),
                _ => return Err(Error::Ipc("tcp listener without tcp address".into())),
            };
            let args = vec![
                "--ipc".into(),
                "tcp".into(),
                "--ipc-host".into(),
                "127.0.0.1".into(),
                "--ipc-port".into(),
                port.to_string(),
            ];
            (listener, args)
        }
        "unix" => {
            let listener = Listener::bind(&ListenAddr::Unix { path: None })?;
            let path = listener.bound_addr().to_string();
            let args = vec!["--ipc".into(), "unix".into(), "--ipc-path".into(), path];
            (listener, args)
        }
        "pipe" => {
            let name = pipe_name
                .map(str::to_string)
                .unwrap_or_else(|| default_socket_path().to_string_lossy().into_owned());
            let listener = Listener::bind(&ListenAddr::Pipe { name: name.clone() })?;
            let args = vec!["--ipc".into(), "pipe".into(), "--ipc-pipe".into(), name];
            (listener, args)
        }
        other => {
            return Err(Error::Configuration(format!(
                "unsupported IPC transport: {other}"
            )))
        }
    };
    if binary {
        child_args.push("--ipc-binary".into());
    }
    Ok(IpcEndpoint { listener, child_args })
}

/// Resolve launcher `--ipc*` arguments (or `attach` coordinates) into a
/// connectable address.
pub fn connect_addr(
    transport: &str,
    host: Option<&str>,
    port: Option<u16>,
    path: Option<&str>,
    pipe: Option<&str>,
) -> Result<ListenAddr, Error> {
    match transport.to_ascii_lowercase().as_str() {
        "tcp" => Ok(ListenAddr::Tcp {
            host: host.unwrap_or("127.0.0.1").to_string(),
            port: port.ok_or(Error::Configuration("ipcPort required for tcp".into()))?,
        }),
        "unix" => Ok(ListenAddr::Unix {
            path: Some(
                path.ok_or(Error::Configuration("ipcPath required for unix".into()))?
                    .into(),
            ),
        }),
        "pipe" => Ok(ListenAddr::Pipe {
            name: pipe
                .ok_or(Error::Configuration("ipcPipeName required for pipe".into()))?
                .to_string(),
        }),
        other => Err(Error::Configuration(format!(
            "unsupported IPC transport: {other}"
        ))),
    }
}

/// Where outgoing IPC bytes go.
pub enum IpcWriter {
    Stream(DapStream),
    /// Adapter side of stdio IPC: the child's stdin.
    ChildStdin(std::process::ChildStdin),
    /// Launcher side of stdio IPC: its own stdout.
    Stdout(std::io::Stdout),
}

impl Write for IpcWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            IpcWriter::Stream(stream) => stream.write(buf),
            IpcWriter::ChildStdin(stdin) => stdin.write(buf),
            IpcWriter::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            IpcWriter::Stream(stream) => stream.flush(),
            IpcWriter::ChildStdin(stdin) => stdin.flush(),
            IpcWriter::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// Serialised writer for one side of an IPC connection.
pub struct IpcChannel {
    writer: Mutex<IpcWriter>,
    binary: bool,
}

impl IpcChannel {
    pub fn new(writer: IpcWriter, binary: bool) -> Self {
        IpcChannel { writer: Mutex::new(writer), binary }
    }

    /// Adapter→debuggee command.
    pub fn send_command(&self, message: &Json) -> Result<(), Error> {
        self.send(message, FrameKind::Command, COMMAND_PREFIX)
    }

    /// Debuggee→adapter event or response.
    pub fn send_event(&self, message: &Json) -> Result<(), Error> {
        self.send(message, FrameKind::Event, EVENT_PREFIX)
    }

    fn send(&self, message: &Json, kind: FrameKind, prefix: &str) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;
        let mut writer = self.writer.lock().unwrap();
        if self.binary {
            writer
                .write_all(&pack_frame(kind, &payload))
                .map_err(|e| Error::Ipc(format!("write frame: {e}")))?;
        } else {
            writer
                .write_all(prefix.as_bytes())
                .and_then(|_| writer.write_all(&payload))
                .and_then(|_| writer.write_all(b"\n"))
                .map_err(|e| Error::Ipc(format!("write line: {e}")))?;
        }
        writer.flush().map_err(|e| Error::Ipc(format!("flush: {e}")))?;
        Ok(())
    }
}

/// Drain one side of an IPC connection until EOF.
///
/// `expect_kind`/`prefix` select the inbound message class (events on the
/// adapter side, commands on the launcher side); unprefixed text lines are
/// handed to `on_output`.
pub fn read_messages<R: Read>(
    reader: R,
    binary: bool,
    expect_kind: FrameKind,
    prefix: &str,
    mut on_message: impl FnMut(Json),
    mut on_output: impl FnMut(String),
) -> Result<(), Error> {
    let mut reader = BufReader::new(reader);
    if binary {
        loop {
            match read_frame(&mut reader) {
                Ok((kind, payload)) if kind == expect_kind => {
                    match serde_json::from_slice(&payload) {
                        Ok(message) => on_message(message),
                        Err(err) => {
                            log::warn!(target: "ipc", "bad frame payload: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some(payload) = trimmed.strip_prefix(prefix) {
            match serde_json::from_str(payload.trim()) {
                Ok(message) => on_message(message),
                Err(err) => {
                    log::warn!(target: "ipc", "bad IPC line: {err}");
                }
            }
        } else if !trimmed.is_empty() {
            on_output(format!("{trimmed}\n"));
        }
    }
}
