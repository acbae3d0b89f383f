//! The session kernel: one accepted client, one backend, one loop.
//!
//! The session runs on a dedicated thread draining a bounded channel of
//! inputs: client requests (enqueued by the socket reader thread) and
//! debuggee events (enqueued by tracer callbacks or the IPC reader through
//! the session's [`EventSink`]). All state mutation and every write to the
//! client socket happen on this loop, which makes sequence numbers
//! strictly increasing and keeps a command's response ahead of the events
//! it caused.

mod handlers;

use std::collections::HashMap;
use std::io::BufReader;
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use serde_json::{json, Value as Json};

use crate::backend::{Backend, DataEntry, FunctionEntry, LineEntry};
use crate::dap::codec;
use crate::dap::transport::DapStream;
use crate::dap::{CommandKind, DapEvent, DapRequest, DapResponse};
use crate::debugger::error::Error;
use crate::debugger::{DebugEvent, EventSink};

/// Bound of the session input channel.
const INPUT_QUEUE_DEPTH: usize = 256;
/// How long an event producer may block on a full queue before the event
/// is dropped.
const PRODUCER_PATIENCE: Duration = Duration::from_millis(100);

/// Everything the session loop reacts to.
pub enum SessionInput {
    Request(DapRequest),
    Event(DebugEvent),
    /// The client reader thread is done (EOF or transport error).
    ClientGone(Error),
}

/// Event sink handed to backends; submits into the session queue with the
/// block-briefly-then-drop overflow policy.
pub struct ChannelSink {
    tx: mpsc::SyncSender<SessionInput>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::SyncSender<SessionInput>) -> Self {
        ChannelSink { tx }
    }
}

impl EventSink for ChannelSink {
    fn submit(&self, event: DebugEvent) {
        let mut input = SessionInput::Event(event);
        let deadline = std::time::Instant::now() + PRODUCER_PATIENCE;
        loop {
            match self.tx.try_send(input) {
                Ok(()) => return,
                Err(mpsc::TrySendError::Full(returned)) => {
                    if std::time::Instant::now() >= deadline {
                        log::warn!(target: "session", "event queue full, dropping event");
                        return;
                    }
                    input = returned;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(mpsc::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connected,
    Initialized,
    Configuring,
    Running,
    Stopped,
    Shutdown,
}

/// Breakpoint configuration received before `launch` created the backend.
#[derive(Default)]
pub(crate) struct DeferredBreakpoints {
    pub by_source: HashMap<String, Vec<LineEntry>>,
    pub functions: Vec<FunctionEntry>,
    pub exception_filters: Vec<String>,
    pub data: Vec<DataEntry>,
}

/// Debug session state for a single client connection.
pub struct DebugSession {
    writer: DapStream,
    seq: i64,
    state: LifecycleState,
    backend: Option<Box<dyn Backend>>,
    inputs: mpsc::Receiver<SessionInput>,
    input_tx: mpsc::SyncSender<SessionInput>,
    deferred: DeferredBreakpoints,
    stop_on_entry: bool,
    terminated: bool,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl DebugSession {
    pub fn new(stream: DapStream) -> Result<DebugSession, Error> {
        let (input_tx, inputs) = mpsc::sync_channel(INPUT_QUEUE_DEPTH);
        let reader_stream = stream.try_clone()?;
        let reader = {
            let tx = input_tx.clone();
            std::thread::spawn(move || {
                let mut reader = BufReader::new(reader_stream);
                loop {
                    match codec::read_message(&mut reader) {
                        Ok(message) => match serde_json::from_value::<DapRequest>(message) {
                            Ok(request) if request.r#type == "request" => {
                                if tx.send(SessionInput::Request(request)).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {
                                log::warn!(target: "session", "ignoring non-request message");
                            }
                            Err(err) => {
                                log::warn!(target: "session", "malformed request: {err}");
                            }
                        },
                        Err(err) => {
                            let _ = tx.send(SessionInput::ClientGone(err));
                            break;
                        }
                    }
                }
            })
        };

        Ok(DebugSession {
            writer: stream,
            seq: 0,
            state: LifecycleState::Connected,
            backend: None,
            inputs,
            input_tx,
            deferred: DeferredBreakpoints::default(),
            stop_on_entry: false,
            terminated: false,
            reader: Some(reader),
        })
    }

    /// Sink for the backend created by `launch`/`attach`.
    pub(crate) fn make_sink(&self) -> ChannelSink {
        ChannelSink::new(self.input_tx.clone())
    }

    pub(crate) fn backend(&self) -> Result<&dyn Backend, Error> {
        self.backend.as_deref().ok_or(Error::NotStarted)
    }

    /// Drive the session until the client disconnects or a fatal error.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            let input = match self.inputs.recv() {
                Ok(input) => input,
                Err(_) => break,
            };
            match input {
                SessionInput::Request(request) => {
                    if let Err(err) = self.handle_request(&request) {
                        log::error!(target: "session", "request {}: {err:#}", request.command);
                        if err.is_fatal() {
                            break;
                        }
                        let _ = self.send_err(&request, err.to_string());
                    }
                }
                SessionInput::Event(event) => {
                    if let Err(err) = self.forward_event(event) {
                        log::error!(target: "session", "event forwarding: {err:#}");
                        if err.is_fatal() {
                            break;
                        }
                    }
                }
                SessionInput::ClientGone(err) => {
                    match err {
                        Error::ConnectionClosed => {
                            log::info!(target: "session", "client disconnected")
                        }
                        other => log::warn!(target: "session", "client read failed: {other:#}"),
                    }
                    break;
                }
            }
            if self.state == LifecycleState::Shutdown {
                break;
            }
        }
        self.teardown();
        Ok(())
    }

    fn handle_request(&mut self, request: &DapRequest) -> Result<(), Error> {
        log::debug!(target: "session", "{}: {}", request.seq, request.command);
        let Ok(kind) = CommandKind::from_str(&request.command) else {
            return self.send_err(
                request,
                format!("Unsupported command: {}", request.command),
            );
        };
        if !self.admissible(kind) {
            return self.send_err(
                request,
                format!(
                    "command {} not allowed in state {:?}",
                    request.command, self.state
                ),
            );
        }
        self.dispatch(kind, request)
    }

    /// The lifecycle state machine: which commands each state admits.
    /// `disconnect`, `terminate` and `restart` are accepted everywhere.
    fn admissible(&self, kind: CommandKind) -> bool {
        use CommandKind::*;
        if matches!(kind, Disconnect | Terminate | Restart) {
            return true;
        }
        match self.state {
            LifecycleState::Connected => matches!(kind, Initialize),
            LifecycleState::Initialized => !matches!(kind, Initialize),
            LifecycleState::Configuring
            | LifecycleState::Running
            | LifecycleState::Stopped => !matches!(kind, Initialize | Launch | Attach),
            LifecycleState::Shutdown => false,
        }
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn send_success(&mut self, request: &DapRequest) -> Result<(), Error> {
        self.send_response_raw(request, true, None, None)
    }

    pub(crate) fn send_success_body(
        &mut self,
        request: &DapRequest,
        body: Json,
    ) -> Result<(), Error> {
        self.send_response_raw(request, true, None, Some(body))
    }

    pub(crate) fn send_err(
        &mut self,
        request: &DapRequest,
        message: impl ToString,
    ) -> Result<(), Error> {
        self.send_response_raw(request, false, Some(message.to_string()), None)
    }

    fn send_response_raw(
        &mut self,
        request: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Json>,
    ) -> Result<(), Error> {
        let response = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        codec::write_message(&mut self.writer, &response)
    }

    pub(crate) fn send_event(
        &mut self,
        name: impl Into<String>,
        body: Option<Json>,
    ) -> Result<(), Error> {
        let event = DapEvent {
            seq: self.next_seq(),
            r#type: "event",
            event: name.into(),
            body,
        };
        codec::write_message(&mut self.writer, &event)
    }

    /// Translate a backend event into client-facing DAP events. Late
    /// events after termination are dropped.
    fn forward_event(&mut self, event: DebugEvent) -> Result<(), Error> {
        if self.terminated {
            return Ok(());
        }
        match event {
            DebugEvent::Stopped { thread_id, reason, description, text } => {
                self.state = LifecycleState::Stopped;
                let mut body = json!({
                    "reason": reason.to_string(),
                    "threadId": thread_id,
                    "allThreadsStopped": true,
                });
                if let Some(description) = description {
                    body["description"] = json!(description);
                }
                if let Some(text) = text {
                    body["text"] = json!(text);
                }
                self.send_event("stopped", Some(body))
            }
            DebugEvent::Continued { thread_id, all_threads } => self.send_event(
                "continued",
                Some(json!({
                    "threadId": thread_id,
                    "allThreadsContinued": all_threads,
                })),
            ),
            DebugEvent::Thread { thread_id, reason, .. } => self.send_event(
                "thread",
                Some(json!({"reason": reason, "threadId": thread_id})),
            ),
            DebugEvent::Output { category, output } => self.send_event(
                "output",
                Some(json!({"category": category, "output": output})),
            ),
            DebugEvent::Exited { code } => {
                // Natural exit: exited then terminated, exactly once.
                self.terminated = true;
                self.send_event("exited", Some(json!({"exitCode": code})))?;
                self.send_event("terminated", None)
            }
            DebugEvent::Terminated => {
                self.terminated = true;
                self.send_event("terminated", None)
            }
            DebugEvent::Custom { event, mut body } => {
                if let Some(map) = body.as_object_mut() {
                    map.remove("event");
                }
                self.send_event(event, Some(body))
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn deferred_mut(&mut self) -> &mut DeferredBreakpoints {
        &mut self.deferred
    }

    pub(crate) fn set_stop_on_entry(&mut self, enabled: bool) {
        self.stop_on_entry = enabled;
    }

    pub(crate) fn stop_on_entry(&self) -> bool {
        self.stop_on_entry
    }

    pub(crate) fn install_backend(&mut self, backend: Box<dyn Backend>) {
        self.backend = Some(backend);
    }

    pub(crate) fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub(crate) fn shutdown_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
    }

    fn teardown(&mut self) {
        self.state = LifecycleState::Shutdown;
        self.shutdown_backend();
        self.writer.shutdown();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
