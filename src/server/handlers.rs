//! Request dispatcher: one handler per DAP command, mapped over the closed
//! [`CommandKind`] set. Handlers either write exactly one response or
//! return an error for the session loop to turn into an error response.

use std::time::Duration;

use serde_json::{json, Value as Json};

use crate::backend::{attach_backend, launch_backend, AttachConfig, LaunchConfig};
use crate::dap::{CommandKind, DapRequest};
use crate::debugger::breakpoint::make_data_id;
use crate::debugger::error::Error;
use crate::debugger::tracer::ResumeMode;
use crate::launcher::{parse_data_breakpoints, parse_function_breakpoints, parse_line_breakpoints};
use crate::server::{DebugSession, LifecycleState};

/// How long `configurationDone` waits for the entry stop when the client
/// asked for `stopOnEntry`.
const ENTRY_STOP_WAIT: Duration = Duration::from_secs(5);

impl DebugSession {
    pub(crate) fn dispatch(
        &mut self,
        kind: CommandKind,
        request: &DapRequest,
    ) -> Result<(), Error> {
        use CommandKind::*;
        match kind {
            Initialize => self.handle_initialize(request),
            Launch => self.handle_launch(request),
            Attach => self.handle_attach(request),
            ConfigurationDone => self.handle_configuration_done(request),
            SetBreakpoints => self.handle_set_breakpoints(request),
            SetFunctionBreakpoints => self.handle_set_function_breakpoints(request),
            SetExceptionBreakpoints => self.handle_set_exception_breakpoints(request),
            SetDataBreakpoints => self.handle_set_data_breakpoints(request),
            DataBreakpointInfo => self.handle_data_breakpoint_info(request),
            Continue => self.handle_resume(request, ResumeMode::Continue),
            Next => self.handle_resume(request, ResumeMode::StepOver),
            StepIn => self.handle_resume(request, ResumeMode::StepIn),
            StepOut => self.handle_resume(request, ResumeMode::StepOut),
            Pause => self.handle_pause(request),
            Threads => self.handle_threads(request),
            StackTrace => self.handle_stack_trace(request),
            Scopes => self.handle_scopes(request),
            Variables => self.handle_variables(request),
            SetVariable => self.handle_set_variable(request),
            Evaluate => self.handle_evaluate(request),
            ExceptionInfo => self.handle_exception_info(request),
            Source => self.handle_source(request),
            LoadedSources => self.handle_loaded_sources(request),
            Modules => self.handle_modules(request),
            Terminate => self.handle_terminate(request),
            Disconnect => self.handle_disconnect(request),
            Restart => self.handle_restart(request),
        }
    }

    fn handle_initialize(&mut self, request: &DapRequest) -> Result<(), Error> {
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsFunctionBreakpoints": true,
            "supportsConditionalBreakpoints": true,
            "supportsHitConditionalBreakpoints": true,
            "supportsEvaluateForHovers": true,
            "supportsSetVariable": true,
            "supportsSetExpression": true,
            "supportsRestartRequest": true,
            "supportsExceptionInfoRequest": true,
            "supportsLogPoints": true,
            "supportsLoadedSourcesRequest": true,
            "supportsModulesRequest": true,
            "supportsDataBreakpoints": true,
            "supportsDataBreakpointInfo": true,
            "supportTerminateDebuggee": true,
            "exceptionBreakpointFilters": [
                {
                    "filter": "raised",
                    "label": "Raised Exceptions",
                    "default": false,
                },
                {
                    "filter": "uncaught",
                    "label": "Uncaught Exceptions",
                    "default": true,
                },
            ],
        });
        self.set_state(LifecycleState::Initialized);
        self.send_success_body(request, body)?;
        // Per DAP, initialized follows the initialize response.
        self.send_event("initialized", None)
    }

    fn handle_launch(&mut self, request: &DapRequest) -> Result<(), Error> {
        if self.has_backend() {
            return Err(Error::AlreadyRun);
        }
        let config: LaunchConfig = if request.arguments.is_null() {
            LaunchConfig::default()
        } else {
            serde_json::from_value(request.arguments.clone())
                .map_err(|e| Error::Configuration(format!("bad launch arguments: {e}")))?
        };
        let sink = std::sync::Arc::new(self.make_sink());
        let backend = launch_backend(&config, sink)?;
        let process_id = backend.process_id();
        self.install_backend(backend);
        self.set_stop_on_entry(config.stop_on_entry && !config.no_debug);
        self.apply_deferred_breakpoints();
        self.set_state(LifecycleState::Configuring);

        log::info!(target: "session", "launched {}", config.program);
        self.send_success(request)?;
        self.send_event(
            "process",
            Some(json!({
                "name": file_name(&config.program),
                "systemProcessId": process_id,
                "isLocalProcess": true,
                "startMethod": "launch",
            })),
        )
    }

    fn handle_attach(&mut self, request: &DapRequest) -> Result<(), Error> {
        if self.has_backend() {
            return Err(Error::AlreadyRun);
        }
        let config: AttachConfig = if request.arguments.is_null() {
            AttachConfig::default()
        } else {
            serde_json::from_value(request.arguments.clone())
                .map_err(|e| Error::Configuration(format!("bad attach arguments: {e}")))?
        };
        let sink = std::sync::Arc::new(self.make_sink());
        let backend = attach_backend(&config, sink)?;
        self.install_backend(backend);
        self.apply_deferred_breakpoints();
        self.set_state(LifecycleState::Configuring);

        self.send_success(request)?;
        self.send_event(
            "process",
            Some(json!({
                "name": "attached",
                "isLocalProcess": true,
                "startMethod": "attach",
            })),
        )
    }

    /// Replay breakpoint configuration that arrived before the backend
    /// existed.
    fn apply_deferred_breakpoints(&mut self) {
        let deferred = std::mem::take(self.deferred_mut());
        let Ok(backend) = self.backend() else {
            return;
        };
        for (path, entries) in &deferred.by_source {
            if let Err(err) = backend.set_breakpoints(path, entries) {
                log::warn!(target: "session", "deferred breakpoints for {path}: {err:#}");
            }
        }
        if !deferred.functions.is_empty() {
            let _ = backend.set_function_breakpoints(&deferred.functions);
        }
        if !deferred.exception_filters.is_empty() {
            let _ = backend.set_exception_breakpoints(&deferred.exception_filters);
        }
        if !deferred.data.is_empty() {
            let _ = backend.set_data_breakpoints(&deferred.data);
        }
    }

    fn handle_configuration_done(&mut self, request: &DapRequest) -> Result<(), Error> {
        self.backend()?.configuration_done()?;
        if self.stop_on_entry() {
            // The debuggee only starts running now, so the entry stop can
            // only happen after the barrier drops; hold the response until
            // it is in flight.
            if !self.backend()?.wait_for_stop(ENTRY_STOP_WAIT) {
                log::warn!(target: "session", "no entry stop within {ENTRY_STOP_WAIT:?}");
            }
        }
        self.set_state(LifecycleState::Running);
        self.send_success(request)
    }

    fn handle_set_breakpoints(&mut self, request: &DapRequest) -> Result<(), Error> {
        let path = request
            .arguments
            .pointer("/source/path")
            .and_then(Json::as_str)
            .ok_or(Error::MissingArgument("source.path"))?
            .to_string();
        let entries = parse_line_breakpoints(&request.arguments);

        let breakpoints = if self.has_backend() {
            self.backend()?.set_breakpoints(&path, &entries)?
        } else {
            // Not launched yet: remember the set, verify optimistically.
            let verified = entries
                .iter()
                .map(|(line, ..)| json!({"verified": true, "line": line}))
                .collect();
            self.deferred_mut().by_source.insert(path, entries);
            verified
        };
        self.send_success_body(request, json!({"breakpoints": breakpoints}))
    }

    fn handle_set_function_breakpoints(&mut self, request: &DapRequest) -> Result<(), Error> {
        let entries = parse_function_breakpoints(&request.arguments);
        let breakpoints = if self.has_backend() {
            self.backend()?.set_function_breakpoints(&entries)?
        } else {
            let verified = entries.iter().map(|_| json!({"verified": true})).collect();
            self.deferred_mut().functions = entries;
            verified
        };
        self.send_success_body(request, json!({"breakpoints": breakpoints}))
    }

    fn handle_set_exception_breakpoints(&mut self, request: &DapRequest) -> Result<(), Error> {
        let filters: Vec<String> = request
            .arguments
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
        if self.has_backend() {
            self.backend()?.set_exception_breakpoints(&filters)?;
        } else {
            self.deferred_mut().exception_filters = filters.clone();
        }
        let breakpoints: Vec<Json> = filters.iter().map(|_| json!({"verified": true})).collect();
        self.send_success_body(request, json!({"breakpoints": breakpoints}))
    }

    fn handle_set_data_breakpoints(&mut self, request: &DapRequest) -> Result<(), Error> {
        let entries = parse_data_breakpoints(&request.arguments);
        let breakpoints = if self.has_backend() {
            self.backend()?.set_data_breakpoints(&entries)?
        } else {
            let verified = entries.iter().map(|_| json!({"verified": true})).collect();
            self.deferred_mut().data = entries;
            verified
        };
        self.send_success_body(request, json!({"breakpoints": breakpoints}))
    }

    fn handle_data_breakpoint_info(&mut self, request: &DapRequest) -> Result<(), Error> {
        let name = request.arguments.get("name").and_then(Json::as_str);
        let frame_id = request.arguments.get("frameId").and_then(Json::as_i64);
        let body = match (name, frame_id) {
            (Some(name), Some(frame_id)) => json!({
                "dataId": make_data_id(frame_id, name),
                "description": format!("Variable '{name}' in frame {frame_id}"),
                "accessTypes": ["write"],
                "canPersist": false,
            }),
            _ => json!({
                "dataId": null,
                "description": "Data breakpoint unsupported for missing name/frameId",
                "accessTypes": ["write"],
                "canPersist": false,
            }),
        };
        self.send_success_body(request, body)
    }

    fn handle_resume(&mut self, request: &DapRequest, mode: ResumeMode) -> Result<(), Error> {
        let thread_id = request
            .arguments
            .get("threadId")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("threadId"))?;
        self.backend()?.resume(thread_id, mode)?;
        self.set_state(LifecycleState::Running);
        if matches!(mode, ResumeMode::Continue) {
            self.send_success_body(request, json!({"allThreadsContinued": true}))
        } else {
            self.send_success(request)
        }
    }

    fn handle_pause(&mut self, request: &DapRequest) -> Result<(), Error> {
        let thread_id = request
            .arguments
            .get("threadId")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("threadId"))?;
        let paused = self.backend()?.pause(thread_id)?;
        if paused {
            self.send_success(request)
        } else {
            self.send_err(request, "pause is best-effort and did not take effect")
        }
    }

    fn handle_threads(&mut self, request: &DapRequest) -> Result<(), Error> {
        let threads = if self.has_backend() {
            self.backend()?.threads()?
        } else {
            Vec::new()
        };
        self.send_success_body(request, json!({"threads": threads}))
    }

    fn handle_stack_trace(&mut self, request: &DapRequest) -> Result<(), Error> {
        let thread_id = request
            .arguments
            .get("threadId")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("threadId"))?;
        let start_frame = request
            .arguments
            .get("startFrame")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize;
        let levels = request
            .arguments
            .get("levels")
            .and_then(Json::as_u64)
            .unwrap_or(20) as usize;
        let (frames, total) = self.backend()?.stack_trace(thread_id, start_frame, levels)?;
        self.send_success_body(
            request,
            json!({"stackFrames": frames, "totalFrames": total}),
        )
    }

    fn handle_scopes(&mut self, request: &DapRequest) -> Result<(), Error> {
        let frame_id = request
            .arguments
            .get("frameId")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("frameId"))?;
        let scopes = self.backend()?.scopes(frame_id)?;
        self.send_success_body(request, json!({"scopes": scopes}))
    }

    fn handle_variables(&mut self, request: &DapRequest) -> Result<(), Error> {
        let var_ref = request
            .arguments
            .get("variablesReference")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("variablesReference"))?;
        let filter = request
            .arguments
            .get("filter")
            .and_then(Json::as_str)
            .map(str::to_string);
        let start = request
            .arguments
            .get("start")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize;
        let count = request
            .arguments
            .get("count")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize;
        let variables = self
            .backend()?
            .variables(var_ref, filter.as_deref(), start, count)?;
        self.send_success_body(request, json!({"variables": variables}))
    }

    fn handle_set_variable(&mut self, request: &DapRequest) -> Result<(), Error> {
        let var_ref = request
            .arguments
            .get("variablesReference")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("variablesReference"))?;
        let name = request
            .arguments
            .get("name")
            .and_then(Json::as_str)
            .ok_or(Error::MissingArgument("name"))?;
        let value = request
            .arguments
            .get("value")
            .and_then(Json::as_str)
            .ok_or(Error::MissingArgument("value"))?;
        let body = self.backend()?.set_variable(var_ref, name, value)?;
        self.send_success_body(request, body)
    }

    fn handle_evaluate(&mut self, request: &DapRequest) -> Result<(), Error> {
        let expression = request
            .arguments
            .get("expression")
            .and_then(Json::as_str)
            .ok_or(Error::MissingArgument("expression"))?;
        let frame_id = request.arguments.get("frameId").and_then(Json::as_i64);
        let context = request
            .arguments
            .get("context")
            .and_then(Json::as_str)
            .unwrap_or("hover");
        let body = self.backend()?.evaluate(expression, frame_id, context)?;
        self.send_success_body(request, body)
    }

    fn handle_exception_info(&mut self, request: &DapRequest) -> Result<(), Error> {
        let thread_id = request
            .arguments
            .get("threadId")
            .and_then(Json::as_i64)
            .ok_or(Error::MissingArgument("threadId"))?;
        let body = self.backend()?.exception_info(thread_id)?;
        self.send_success_body(request, body)
    }

    fn handle_source(&mut self, request: &DapRequest) -> Result<(), Error> {
        let source_reference = request
            .arguments
            .get("sourceReference")
            .or_else(|| request.arguments.pointer("/source/sourceReference"))
            .and_then(Json::as_i64)
            .filter(|reference| *reference > 0);
        if let Some(reference) = source_reference {
            return Err(Error::SourceNotFound(format!(
                "sourceReference {reference}"
            )));
        }
        let path = request
            .arguments
            .pointer("/source/path")
            .and_then(Json::as_str)
            .ok_or(Error::MissingArgument("source.path"))?;
        let content = std::fs::read_to_string(path)
            .map_err(|_| Error::SourceNotFound(path.to_string()))?;
        self.send_success_body(request, json!({"content": content}))
    }

    fn handle_loaded_sources(&mut self, request: &DapRequest) -> Result<(), Error> {
        let sources = if self.has_backend() {
            self.backend()?.loaded_sources()?
        } else {
            Vec::new()
        };
        self.send_success_body(request, json!({"sources": sources}))
    }

    fn handle_modules(&mut self, request: &DapRequest) -> Result<(), Error> {
        let start_module = request
            .arguments
            .get("startModule")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize;
        let module_count = request
            .arguments
            .get("moduleCount")
            .and_then(Json::as_u64)
            .map(|count| count as usize);
        let all_modules = if self.has_backend() {
            self.backend()?.modules()?
        } else {
            Vec::new()
        };
        let total = all_modules.len();
        let page: Vec<Json> = match module_count {
            Some(count) => all_modules.into_iter().skip(start_module).take(count).collect(),
            None => all_modules.into_iter().skip(start_module).collect(),
        };
        self.send_success_body(
            request,
            json!({"modules": page, "totalModules": total}),
        )
    }

    fn handle_terminate(&mut self, request: &DapRequest) -> Result<(), Error> {
        self.send_success(request)?;
        // Suppress the exit events the backend emits while being torn
        // down; the client gets exactly one terminated.
        self.terminated = true;
        self.shutdown_backend();
        self.send_event("terminated", None)
    }

    fn handle_disconnect(&mut self, request: &DapRequest) -> Result<(), Error> {
        self.send_success(request)?;
        self.terminated = true;
        self.shutdown_backend();
        self.set_state(LifecycleState::Shutdown);
        Ok(())
    }

    fn handle_restart(&mut self, request: &DapRequest) -> Result<(), Error> {
        self.send_success(request)?;
        self.terminated = true;
        self.send_event("terminated", Some(json!({"restart": true})))?;
        self.shutdown_backend();
        self.set_state(LifecycleState::Shutdown);
        Ok(())
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
