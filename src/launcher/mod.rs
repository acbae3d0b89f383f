//! Debuggee-side plumbing for the external backend: the `dapper-launcher`
//! binary connects back to the adapter, installs the trace controller over
//! the script runtime and serves adapter commands from a listener thread
//! while the program runs.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};

use serde_json::{json, Value as Json};

use crate::backend::ipc::{IpcChannel, COMMAND_PREFIX};
use crate::dap::binary::FrameKind;
use crate::debugger::error::Error;
use crate::debugger::tracer::{ResumeMode, TraceController};
use crate::debugger::{DebugEvent, EventSink};
use crate::weak_error;

/// Event sink that serialises debug events onto the adapter IPC channel.
pub struct IpcSink {
    channel: Arc<IpcChannel>,
}

impl IpcSink {
    pub fn new(channel: Arc<IpcChannel>) -> Self {
        IpcSink { channel }
    }
}

impl EventSink for IpcSink {
    fn submit(&self, event: DebugEvent) {
        let message = match event {
            DebugEvent::Stopped { thread_id, reason, description, text } => {
                let mut message = json!({
                    "event": "stopped",
                    "threadId": thread_id,
                    "reason": reason.to_string(),
                    "allThreadsStopped": true,
                });
                if let Some(description) = description {
                    message["description"] = json!(description);
                }
                if let Some(text) = text {
                    message["text"] = json!(text);
                }
                message
            }
            DebugEvent::Continued { thread_id, all_threads } => json!({
                "event": "continued",
                "threadId": thread_id,
                "allThreadsContinued": all_threads,
            }),
            DebugEvent::Thread { thread_id, reason, name } => {
                let mut message = json!({
                    "event": "thread",
                    "threadId": thread_id,
                    "reason": reason,
                });
                if let Some(name) = name {
                    message["name"] = json!(name);
                }
                message
            }
            DebugEvent::Output { category, output } => json!({
                "event": "output",
                "category": category,
                "output": output,
            }),
            DebugEvent::Exited { code } => json!({"event": "exited", "exitCode": code}),
            DebugEvent::Terminated => json!({"event": "terminated"}),
            DebugEvent::Custom { event, body } => match body {
                Json::Object(mut map) => {
                    map.insert("event".to_string(), json!(event));
                    Json::Object(map)
                }
                other => json!({"event": event, "body": other}),
            },
        };
        weak_error!(self.channel.send_event(&message));
    }
}

/// Gate between launcher startup and program execution, released by the
/// adapter's `configurationDone`.
pub struct ConfigGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Default for ConfigGate {
    fn default() -> Self {
        ConfigGate { released: Mutex::new(false), cond: Condvar::new() }
    }
}

impl ConfigGate {
    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cond.wait(released).unwrap();
        }
    }
}

/// Serves adapter commands against the trace controller.
pub struct CommandService {
    pub controller: Arc<TraceController>,
    pub channel: Arc<IpcChannel>,
    pub gate: Arc<ConfigGate>,
}

impl CommandService {
    /// Drain the adapter command stream until EOF. Runs on a dedicated
    /// listener thread.
    pub fn serve<R: Read>(&self, reader: R, binary: bool) {
        let result = crate::backend::ipc::read_messages(
            reader,
            binary,
            FrameKind::Command,
            COMMAND_PREFIX,
            |message| self.handle_command(message),
            |_| {},
        );
        if let Err(err) = result {
            log::warn!(target: "launcher", "command stream ended: {err:#}");
        }
        // Adapter is gone; nothing keeps the debuggee alive.
        self.controller.shutdown();
        std::process::exit(0);
    }

    pub fn handle_command(&self, message: Json) {
        let command = message
            .get("command")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = message.get("arguments").cloned().unwrap_or(json!({}));
        let id = message.get("id").and_then(Json::as_u64);

        let outcome = self.dispatch(&command, &arguments);
        match outcome {
            Ok(Some(body)) => {
                if let Some(id) = id {
                    let reply = json!({"id": id, "success": true, "body": body});
                    weak_error!(self.channel.send_event(&reply));
                }
            }
            Ok(None) => {
                if let Some(id) = id {
                    let reply = json!({"id": id, "success": true, "body": {}});
                    weak_error!(self.channel.send_event(&reply));
                }
            }
            Err(err) => {
                let text = format!("Error handling command {command}: {err}");
                if let Some(id) = id {
                    let reply = json!({"id": id, "success": false, "message": text});
                    weak_error!(self.channel.send_event(&reply));
                } else {
                    weak_error!(self
                        .channel
                        .send_event(&json!({"event": "error", "message": text})));
                }
            }
        }
    }

    fn dispatch(&self, command: &str, arguments: &Json) -> Result<Option<Json>, Error> {
        match command {
            "setBreakpoints" => {
                let path = arguments
                    .pointer("/source/path")
                    .and_then(Json::as_str)
                    .ok_or(Error::MissingArgument("source.path"))?;
                let entries = parse_line_breakpoints(arguments);
                let breakpoints = self.controller.set_breakpoints(path, &entries);
                Ok(Some(json!({"breakpoints": breakpoints})))
            }
            "setFunctionBreakpoints" => {
                let entries = parse_function_breakpoints(arguments);
                let breakpoints = self.controller.set_function_breakpoints(&entries);
                Ok(Some(json!({"breakpoints": breakpoints})))
            }
            "setExceptionBreakpoints" => {
                let filters: Vec<String> = arguments
                    .get("filters")
                    .and_then(Json::as_array)
                    .map(|filters| {
                        filters
                            .iter()
                            .filter_map(Json::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                self.controller.set_exception_breakpoints(&filters);
                Ok(None)
            }
            "setDataBreakpoints" => {
                let entries = parse_data_breakpoints(arguments);
                let breakpoints = self.controller.set_data_breakpoints(&entries);
                Ok(Some(json!({"breakpoints": breakpoints})))
            }
            "dataBreakpointInfo" => {
                let name = arguments
                    .get("name")
                    .and_then(Json::as_str)
                    .ok_or(Error::MissingArgument("name"))?;
                let frame_id = arguments
                    .get("frameId")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("frameId"))?;
                Ok(Some(self.controller.data_breakpoint_info(name, frame_id)))
            }
            "continue" | "next" | "stepIn" | "stepOut" => {
                let thread_id = arguments
                    .get("threadId")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("threadId"))?;
                let mode = match command {
                    "continue" => ResumeMode::Continue,
                    "next" => ResumeMode::StepOver,
                    "stepIn" => ResumeMode::StepIn,
                    _ => ResumeMode::StepOut,
                };
                self.controller.resume(thread_id, mode)?;
                Ok(None)
            }
            "pause" => {
                // Interrupting a running script thread is not attempted.
                Ok(None)
            }
            "threads" => Ok(Some(json!({"threads": self.controller.threads()}))),
            "stackTrace" => {
                let thread_id = arguments
                    .get("threadId")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("threadId"))?;
                let start = arguments
                    .get("startFrame")
                    .and_then(Json::as_u64)
                    .unwrap_or(0) as usize;
                let levels =
                    arguments.get("levels").and_then(Json::as_u64).unwrap_or(0) as usize;
                let (frames, total) = self.controller.stack_trace(thread_id, start, levels)?;
                Ok(Some(json!({"stackFrames": frames, "totalFrames": total})))
            }
            "scopes" => {
                let frame_id = arguments
                    .get("frameId")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("frameId"))?;
                let scopes = self.controller.scopes(frame_id)?;
                Ok(Some(json!({"scopes": scopes})))
            }
            "variables" => {
                let var_ref = arguments
                    .get("variablesReference")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("variablesReference"))?;
                let filter = arguments.get("filter").and_then(Json::as_str);
                let start = arguments.get("start").and_then(Json::as_u64).unwrap_or(0) as usize;
                let count = arguments.get("count").and_then(Json::as_u64).unwrap_or(0) as usize;
                let variables = self.controller.variables(var_ref, filter, start, count)?;
                Ok(Some(json!({"variables": variables})))
            }
            "setVariable" => {
                let var_ref = arguments
                    .get("variablesReference")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("variablesReference"))?;
                let name = arguments
                    .get("name")
                    .and_then(Json::as_str)
                    .ok_or(Error::MissingArgument("name"))?;
                let value = arguments
                    .get("value")
                    .and_then(Json::as_str)
                    .ok_or(Error::MissingArgument("value"))?;
                let record = self.controller.set_variable(var_ref, name, value)?;
                Ok(Some(record))
            }
            "evaluate" => {
                let expression = arguments
                    .get("expression")
                    .and_then(Json::as_str)
                    .ok_or(Error::MissingArgument("expression"))?;
                let frame_id = arguments.get("frameId").and_then(Json::as_i64);
                let context = arguments
                    .get("context")
                    .and_then(Json::as_str)
                    .unwrap_or("hover");
                let body = self.controller.evaluate(expression, frame_id, context)?;
                Ok(Some(body))
            }
            "exceptionInfo" => {
                let thread_id = arguments
                    .get("threadId")
                    .and_then(Json::as_i64)
                    .ok_or(Error::MissingArgument("threadId"))?;
                Ok(Some(self.controller.exception_info(thread_id)?))
            }
            "source" => {
                let path = arguments
                    .pointer("/source/path")
                    .and_then(Json::as_str)
                    .or_else(|| arguments.get("path").and_then(Json::as_str))
                    .ok_or(Error::MissingArgument("source.path"))?;
                let content = std::fs::read_to_string(path)
                    .map_err(|_| Error::SourceNotFound(path.to_string()))?;
                Ok(Some(json!({"content": content})))
            }
            "loadedSources" => Ok(Some(json!({"sources": self.controller.loaded_sources()}))),
            "modules" => Ok(Some(json!({"modules": self.controller.modules()}))),
            "configurationDone" => {
                self.gate.release();
                Ok(None)
            }
            "terminate" | "disconnect" => {
                self.controller.shutdown();
                weak_error!(self
                    .channel
                    .send_event(&json!({"event": "exited", "exitCode": 0})));
                std::process::exit(0);
            }
            "restart" => {
                self.controller.shutdown();
                weak_error!(self
                    .channel
                    .send_event(&json!({"event": "exited", "exitCode": 0})));
                std::process::exit(0);
            }
            other => Err(Error::UnsupportedCommand(other.to_string())),
        }
    }
}

pub fn parse_line_breakpoints(
    arguments: &Json,
) -> Vec<(u32, Option<String>, Option<String>, Option<String>)> {
    arguments
        .get("breakpoints")
        .and_then(Json::as_array)
        .map(|breakpoints| {
            breakpoints
                .iter()
                .map(|bp| {
                    (
                        bp.get("line").and_then(Json::as_u64).unwrap_or(0) as u32,
                        opt_str(bp, "condition"),
                        opt_str(bp, "hitCondition"),
                        opt_str(bp, "logMessage"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_function_breakpoints(
    arguments: &Json,
) -> Vec<(String, Option<String>, Option<String>)> {
    arguments
        .get("breakpoints")
        .and_then(Json::as_array)
        .map(|breakpoints| {
            breakpoints
                .iter()
                .map(|bp| {
                    (
                        bp.get("name")
                            .and_then(Json::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        opt_str(bp, "condition"),
                        opt_str(bp, "hitCondition"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_data_breakpoints(
    arguments: &Json,
) -> Vec<(String, Option<String>, Option<String>)> {
    arguments
        .get("breakpoints")
        .and_then(Json::as_array)
        .map(|breakpoints| {
            breakpoints
                .iter()
                .map(|bp| {
                    (
                        bp.get("dataId")
                            .and_then(Json::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        opt_str(bp, "condition"),
                        opt_str(bp, "hitCondition"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn opt_str(value: &Json, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Json::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
