//! External backend: the debuggee runs in a `dapper-launcher` child
//! process; commands and stop events travel over IPC (stdio, TCP, Unix
//! socket or pipe, text or binary framed).
//!
//! Commands that need a reply are tagged with a monotonically increasing
//! id and parked in the pending-command map until the IPC reader resolves
//! them; a hard 5 second timeout bounds every wait, and shutdown fails all
//! remaining entries within 250 ms.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{json, Value as Json};

use crate::backend::ipc::{self, IpcChannel, IpcWriter, EVENT_PREFIX};
use crate::backend::{AttachConfig, Backend, DataEntry, FunctionEntry, LaunchConfig, LineEntry};
use crate::dap::binary::FrameKind;
use crate::debugger::error::Error;
use crate::debugger::tracer::ResumeMode;
use crate::debugger::{DebugEvent, EventSink, StopReason};
use crate::weak_error;

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_WAIT: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

type CommandOutcome = Result<Json, Error>;

/// Pending command futures keyed by id.
#[derive(Default)]
pub struct PendingCommands {
    next_id: AtomicU64,
    map: Mutex<HashMap<u64, mpsc::SyncSender<CommandOutcome>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        PendingCommands { next_id: AtomicU64::new(1), map: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<CommandOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::sync_channel(1);
        self.map.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Resolve one entry; unknown ids are ignored (late replies after a
    /// timeout).
    pub fn resolve(&self, id: u64, outcome: CommandOutcome) {
        let sender = self.map.lock().unwrap().remove(&id);
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    pub fn forget(&self, id: u64) {
        self.map.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Fail every outstanding entry with "Debugger shutdown", waiting up
    /// to 250 ms (polling at 10 ms) for concurrent resolutions to settle.
    pub fn fail_all(&self) {
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        loop {
            let drained: Vec<(u64, mpsc::SyncSender<CommandOutcome>)> = {
                let mut map = self.map.lock().unwrap();
                map.drain().collect()
            };
            for (_, sender) in drained {
                let _ = sender.send(Err(Error::Shutdown));
            }
            if self.map.lock().unwrap().is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }
    }
}

#[derive(Default)]
struct ExternalState {
    threads: HashMap<i64, String>,
    stack_cache: HashMap<i64, Vec<Json>>,
    stopped: bool,
    terminated: bool,
}

pub struct ExternalBackend {
    channel: Arc<IpcChannel>,
    pending: Arc<PendingCommands>,
    state: Arc<(Mutex<ExternalState>, Condvar)>,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ExternalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBackend").finish()
    }
}

impl ExternalBackend {
    pub fn launch(config: &LaunchConfig, sink: Arc<dyn EventSink>) -> Result<Self, Error> {
        let program = std::fs::canonicalize(&config.program)
            .map_err(|_| Error::Configuration(format!("program not found: {}", config.program)))?;

        let mut args: Vec<String> =
            vec!["--program".into(), program.to_string_lossy().into_owned()];
        for arg in &config.args {
            args.push("--arg".into());
            args.push(arg.clone());
        }
        if config.stop_on_entry {
            args.push("--stop-on-entry".into());
        }
        if config.no_debug {
            args.push("--no-debug".into());
        }

        let endpoint = if config.use_ipc {
            let endpoint = ipc::prepare_listener(
                config.ipc_transport.as_deref(),
                config.ipc_pipe_name.as_deref(),
                config.use_binary_ipc,
            )?;
            args.extend(endpoint.child_args.iter().cloned());
            Some(endpoint)
        } else {
            None
        };

        log::info!(target: "backend", "launching debuggee: {}", program.display());
        let mut child = Command::new(launcher_binary()?)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Configuration(format!("spawn launcher: {e}")))?;

        let pending = Arc::new(PendingCommands::new());
        let state = Arc::new((Mutex::new(ExternalState::default()), Condvar::new()));
        let mut readers = Vec::new();

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let channel = match endpoint {
            Some(endpoint) => {
                // The launcher connects during startup; accept the one peer.
                let stream = endpoint.listener.accept()?;
                let reader_stream = stream.try_clone()?;
                let binary = config.use_binary_ipc;
                readers.push(spawn_ipc_reader(
                    reader_stream,
                    binary,
                    pending.clone(),
                    state.clone(),
                    sink.clone(),
                ));
                // Child stdout is plain program output in socket mode.
                readers.push(spawn_output_reader(stdout, "stdout", sink.clone()));
                Arc::new(IpcChannel::new(IpcWriter::Stream(stream), binary))
            }
            None => {
                // Stdio IPC: commands down stdin, events up stdout.
                let stdin = child.stdin.take().expect("stdin piped");
                readers.push(spawn_ipc_reader(
                    stdout,
                    false,
                    pending.clone(),
                    state.clone(),
                    sink.clone(),
                ));
                Arc::new(IpcChannel::new(IpcWriter::ChildStdin(stdin), false))
            }
        };
        readers.push(spawn_output_reader(stderr, "stderr", sink.clone()));

        Ok(ExternalBackend {
            channel,
            pending,
            state,
            child: Some(child),
            readers,
        })
    }

    pub fn attach(config: &AttachConfig, sink: Arc<dyn EventSink>) -> Result<Self, Error> {
        let default_transport = if cfg!(unix) { "unix" } else { "tcp" };
        let transport = config.ipc_transport.as_deref().unwrap_or(default_transport);
        let addr = ipc::connect_addr(
            transport,
            config.ipc_host.as_deref(),
            config.ipc_port,
            config.ipc_path.as_deref(),
            config.ipc_pipe_name.as_deref(),
        )?;
        let stream = crate::dap::transport::connect(&addr)?;

        let pending = Arc::new(PendingCommands::new());
        let state = Arc::new((Mutex::new(ExternalState::default()), Condvar::new()));
        let reader_stream = stream.try_clone()?;
        let readers = vec![spawn_ipc_reader(
            reader_stream,
            false,
            pending.clone(),
            state.clone(),
            sink.clone(),
        )];

        Ok(ExternalBackend {
            channel: Arc::new(IpcChannel::new(IpcWriter::Stream(stream), false)),
            pending,
            state,
            child: None,
            readers,
        })
    }

    fn send_command(
        &self,
        command: &str,
        arguments: Json,
        expect_response: bool,
    ) -> Result<Option<Json>, Error> {
        let mut message = json!({"command": command, "arguments": arguments});
        if !expect_response {
            self.channel.send_command(&message)?;
            return Ok(None);
        }

        let (id, receiver) = self.pending.register();
        message["id"] = json!(id);
        if let Err(err) = self.channel.send_command(&message) {
            self.pending.forget(id);
            return Err(err);
        }
        match receiver.recv_timeout(COMMAND_TIMEOUT) {
            Ok(Ok(payload)) => {
                if payload.get("success").and_then(Json::as_bool) == Some(false) {
                    let message = payload
                        .get("message")
                        .and_then(Json::as_str)
                        .unwrap_or("command failed")
                        .to_string();
                    return Err(Error::Debuggee(message));
                }
                Ok(Some(payload.get("body").cloned().unwrap_or(Json::Null)))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.pending.forget(id);
                Err(Error::Timeout(id))
            }
        }
    }
}

fn launcher_binary() -> Result<std::path::PathBuf, Error> {
    // Next to the adapter binary first, then on PATH.
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("dapper-launcher");
        if sibling.exists() {
            return Ok(sibling);
        }
    }
    which::which("dapper-launcher")
        .map_err(|_| Error::Configuration("dapper-launcher binary not found".into()))
}

fn spawn_ipc_reader<R: Read + Send + 'static>(
    reader: R,
    binary: bool,
    pending: Arc<PendingCommands>,
    state: Arc<(Mutex<ExternalState>, Condvar)>,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let result = ipc::read_messages(
            reader,
            binary,
            FrameKind::Event,
            EVENT_PREFIX,
            |message| handle_debuggee_message(message, &pending, &state, &sink),
            |output| sink.emit_output("stdout", output),
        );
        if let Err(err) = result {
            log::warn!(target: "backend", "IPC reader ended: {err:#}");
        }
        // The channel is gone; whatever is still pending can never resolve.
        pending.fail_all();
    })
}

fn spawn_output_reader<R: Read + Send + 'static>(
    reader: R,
    category: &'static str,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = std::io::BufReader::new(reader);
        loop {
            let mut line = String::new();
            match std::io::BufRead::read_line(&mut reader, &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => sink.emit_output(category, line),
            }
        }
    })
}

/// One message from the child: either a response keyed by `id` or an
/// event.
fn handle_debuggee_message(
    message: Json,
    pending: &PendingCommands,
    state: &(Mutex<ExternalState>, Condvar),
    sink: &Arc<dyn EventSink>,
) {
    if let Some(id) = message.get("id").and_then(Json::as_u64) {
        pending.resolve(id, Ok(message));
        return;
    }

    let Some(event) = message.get("event").and_then(Json::as_str) else {
        log::warn!(target: "backend", "debuggee message without event tag: {message}");
        return;
    };

    match event {
        "stopped" => {
            let thread_id = message.get("threadId").and_then(Json::as_i64).unwrap_or(1);
            let reason = message
                .get("reason")
                .and_then(Json::as_str)
                .and_then(|r| StopReason::from_str(r).ok())
                .unwrap_or(StopReason::Breakpoint);
            {
                let (lock, cond) = state;
                let mut state = lock.lock().unwrap();
                state
                    .threads
                    .entry(thread_id)
                    .or_insert_with(|| format!("Thread {thread_id}"));
                state.stopped = true;
                cond.notify_all();
            }
            sink.emit_stopped(
                thread_id,
                reason,
                message
                    .get("description")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                message.get("text").and_then(Json::as_str).map(str::to_string),
            );
        }
        "thread" => {
            let thread_id = message.get("threadId").and_then(Json::as_i64).unwrap_or(1);
            let reason = message.get("reason").and_then(Json::as_str).unwrap_or("started");
            let name = message
                .get("name")
                .and_then(Json::as_str)
                .map(str::to_string);
            {
                let (lock, _) = state;
                let mut state = lock.lock().unwrap();
                if reason == "started" {
                    state
                        .threads
                        .insert(thread_id, name.clone().unwrap_or_else(|| format!("Thread {thread_id}")));
                } else {
                    state.threads.remove(&thread_id);
                }
            }
            let reason = if reason == "exited" { "exited" } else { "started" };
            sink.emit_thread(thread_id, reason, name);
        }
        "exited" => {
            let code = message.get("exitCode").and_then(Json::as_i64).unwrap_or(0) as i32;
            {
                let (lock, cond) = state;
                let mut state = lock.lock().unwrap();
                state.terminated = true;
                cond.notify_all();
            }
            sink.emit_exited(code);
        }
        "output" => {
            let category = match message.get("category").and_then(Json::as_str) {
                Some("stderr") => "stderr",
                Some("console") => "console",
                _ => "stdout",
            };
            let output = message
                .get("output")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            sink.emit_output(category, output);
        }
        "stackTrace" => {
            let thread_id = message.get("threadId").and_then(Json::as_i64).unwrap_or(1);
            let frames = message
                .get("stackFrames")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default();
            let (lock, _) = state;
            lock.lock().unwrap().stack_cache.insert(thread_id, frames);
        }
        "error" => {
            let text = message
                .get("message")
                .and_then(Json::as_str)
                .unwrap_or("debuggee error");
            log::warn!(target: "backend", "debuggee error: {text}");
            sink.emit_output("console", format!("{text}\n"));
        }
        other => {
            sink.submit(DebugEvent::Custom {
                event: other.to_string(),
                body: message.clone(),
            });
        }
    }
}

impl Backend for ExternalBackend {
    fn configuration_done(&self) -> Result<(), Error> {
        self.send_command("configurationDone", json!({}), false)?;
        Ok(())
    }

    fn set_breakpoints(&self, path: &str, entries: &[LineEntry]) -> Result<Vec<Json>, Error> {
        let breakpoints: Vec<Json> = entries
            .iter()
            .map(|(line, condition, hit, log_message)| {
                json!({
                    "line": line,
                    "condition": condition,
                    "hitCondition": hit,
                    "logMessage": log_message,
                })
            })
            .collect();
        self.send_command(
            "setBreakpoints",
            json!({"source": {"path": path}, "breakpoints": breakpoints}),
            false,
        )?;
        Ok(entries
            .iter()
            .map(|(line, ..)| json!({"verified": true, "line": line}))
            .collect())
    }

    fn set_function_breakpoints(&self, entries: &[FunctionEntry]) -> Result<Vec<Json>, Error> {
        let breakpoints: Vec<Json> = entries
            .iter()
            .map(|(name, condition, hit)| {
                json!({"name": name, "condition": condition, "hitCondition": hit})
            })
            .collect();
        self.send_command(
            "setFunctionBreakpoints",
            json!({"breakpoints": breakpoints}),
            false,
        )?;
        Ok(entries.iter().map(|_| json!({"verified": true})).collect())
    }

    fn set_exception_breakpoints(&self, filters: &[String]) -> Result<(), Error> {
        self.send_command(
            "setExceptionBreakpoints",
            json!({"filters": filters}),
            false,
        )?;
        Ok(())
    }

    fn set_data_breakpoints(&self, entries: &[DataEntry]) -> Result<Vec<Json>, Error> {
        let breakpoints: Vec<Json> = entries
            .iter()
            .map(|(data_id, condition, hit)| {
                json!({"dataId": data_id, "condition": condition, "hitCondition": hit})
            })
            .collect();
        self.send_command("setDataBreakpoints", json!({"breakpoints": breakpoints}), false)?;
        Ok(entries.iter().map(|_| json!({"verified": true})).collect())
    }

    fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Result<Json, Error> {
        Ok(json!({
            "dataId": crate::debugger::breakpoint::make_data_id(frame_id, name),
            "description": format!("Variable '{name}' in frame {frame_id}"),
            "accessTypes": ["write"],
            "canPersist": false,
        }))
    }

    fn resume(&self, thread_id: i64, mode: ResumeMode) -> Result<(), Error> {
        let command = match mode {
            ResumeMode::Continue => "continue",
            ResumeMode::StepOver => "next",
            ResumeMode::StepIn => "stepIn",
            ResumeMode::StepOut => "stepOut",
            ResumeMode::Terminate => "terminate",
        };
        {
            let (lock, _) = &*self.state;
            lock.lock().unwrap().stopped = false;
        }
        self.send_command(command, json!({"threadId": thread_id}), false)?;
        Ok(())
    }

    fn pause(&self, thread_id: i64) -> Result<bool, Error> {
        self.send_command("pause", json!({"threadId": thread_id}), false)?;
        Ok(true)
    }

    fn threads(&self) -> Result<Vec<Json>, Error> {
        match self.send_command("threads", json!({}), true) {
            Ok(Some(body)) => Ok(body
                .get("threads")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default()),
            Ok(None) => Ok(Vec::new()),
            Err(Error::Timeout(_)) => {
                let (lock, _) = &*self.state;
                let state = lock.lock().unwrap();
                Ok(state
                    .threads
                    .iter()
                    .map(|(id, name)| json!({"id": id, "name": name}))
                    .collect())
            }
            Err(err) => Err(err),
        }
    }

    fn stack_trace(
        &self,
        thread_id: i64,
        start_frame: usize,
        levels: usize,
    ) -> Result<(Vec<Json>, usize), Error> {
        let arguments = json!({
            "threadId": thread_id,
            "startFrame": start_frame,
            "levels": levels,
        });
        match self.send_command("stackTrace", arguments, true) {
            Ok(Some(body)) => {
                let frames = body
                    .get("stackFrames")
                    .and_then(Json::as_array)
                    .cloned()
                    .unwrap_or_default();
                let total = body
                    .get("totalFrames")
                    .and_then(Json::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(frames.len());
                Ok((frames, total))
            }
            Ok(None) => Ok((Vec::new(), 0)),
            Err(Error::Timeout(_)) => {
                // Serve the last stack event the child pushed, if any.
                let (lock, _) = &*self.state;
                let state = lock.lock().unwrap();
                let frames = state
                    .stack_cache
                    .get(&thread_id)
                    .cloned()
                    .unwrap_or_default();
                let total = frames.len();
                let page = frames
                    .into_iter()
                    .skip(start_frame)
                    .take(if levels > 0 { levels } else { usize::MAX })
                    .collect();
                Ok((page, total))
            }
            Err(err) => Err(err),
        }
    }

    fn scopes(&self, frame_id: i64) -> Result<Vec<Json>, Error> {
        let body = self
            .send_command("scopes", json!({"frameId": frame_id}), true)?
            .unwrap_or(Json::Null);
        Ok(body
            .get("scopes")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn variables(
        &self,
        var_ref: i64,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<Json>, Error> {
        let mut arguments = json!({"variablesReference": var_ref});
        if let Some(filter) = filter {
            arguments["filter"] = json!(filter);
        }
        if start > 0 {
            arguments["start"] = json!(start);
        }
        if count > 0 {
            arguments["count"] = json!(count);
        }
        let body = self
            .send_command("variables", arguments, true)?
            .unwrap_or(Json::Null);
        Ok(body
            .get("variables")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn set_variable(&self, var_ref: i64, name: &str, value: &str) -> Result<Json, Error> {
        let body = self
            .send_command(
                "setVariable",
                json!({"variablesReference": var_ref, "name": name, "value": value}),
                true,
            )?
            .unwrap_or(Json::Null);
        Ok(body)
    }

    fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<Json, Error> {
        let body = self
            .send_command(
                "evaluate",
                json!({
                    "expression": expression,
                    "frameId": frame_id,
                    "context": context,
                }),
                true,
            )?
            .unwrap_or(Json::Null);
        Ok(body)
    }

    fn exception_info(&self, thread_id: i64) -> Result<Json, Error> {
        let body = self
            .send_command("exceptionInfo", json!({"threadId": thread_id}), true)?
            .unwrap_or(Json::Null);
        Ok(body)
    }

    fn loaded_sources(&self) -> Result<Vec<Json>, Error> {
        let body = self
            .send_command("loadedSources", json!({}), true)?
            .unwrap_or(Json::Null);
        Ok(body
            .get("sources")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn modules(&self) -> Result<Vec<Json>, Error> {
        let body = self
            .send_command("modules", json!({}), true)?
            .unwrap_or(Json::Null);
        Ok(body
            .get("modules")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.state;
        let mut state = lock.lock().unwrap();
        loop {
            if state.stopped || state.terminated {
                return state.stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn shutdown(&mut self) {
        weak_error!(self.send_command("terminate", json!({}), false));
        self.pending.fail_all();
        if let Some(mut child) = self.child.take() {
            // Give the launcher a moment to exit on its own.
            let deadline = Instant::now() + Duration::from_millis(500);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(SHUTDOWN_POLL);
                    }
                    _ => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        // Reader threads end when their streams close.
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for ExternalBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
