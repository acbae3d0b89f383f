//! The trace controller: receives line/call/return/exception hooks from
//! debuggee threads, routes them through the breakpoint resolver, parks
//! stopping threads on per-thread resume gates and serves the inspection
//! requests (`stackTrace`, `scopes`, `variables`, `setVariable`,
//! `evaluate`, `exceptionInfo`) against live frames.
//!
//! Hooks run on arbitrary debuggee threads; inspection runs on the session
//! (or launcher command) thread. All shared state lives behind one mutex,
//! and a stopping thread never blocks while holding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use itertools::Itertools;
use serde_json::{json, Value as Json};

use crate::debugger::breakpoint::{
    make_data_id, normalize_path, BreakAction, BreakpointEngine, StepContext,
};
use crate::debugger::error::Error;
use crate::debugger::eval;
use crate::debugger::frame::{FrameHandle, FrameRegistry};
use crate::debugger::probe::ProbeInjector;
use crate::debugger::variable::{ScopeKind, VarRef, VariableStore};
use crate::debugger::{DebugEvent, EventSink, ExceptionDetails, SteppingMode, StopReason};
use crate::runtime::code::CodeUnit;
use crate::runtime::{parse_literal, Namespace, Value};

/// Resume request released into a parked thread's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    Continue,
    StepOver,
    StepIn,
    StepOut,
    /// Session is shutting down; the debuggee should unwind.
    Terminate,
}

struct Gate {
    state: Mutex<Option<ResumeMode>>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Gate { state: Mutex::new(None), cond: Condvar::new() })
    }

    fn wait(&self) -> ResumeMode {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(mode) = state.take() {
                return mode;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn release(&self, mode: ResumeMode) {
        *self.state.lock().unwrap() = Some(mode);
        self.cond.notify_all();
    }
}

struct ThreadState {
    name: String,
    stopped: bool,
    stop_reason: Option<StopReason>,
    stepping: SteppingMode,
    depth: usize,
    stack: Vec<FrameHandle>,
    gate: Arc<Gate>,
}

impl ThreadState {
    fn new(name: String) -> Self {
        ThreadState {
            name,
            stopped: false,
            stop_reason: None,
            stepping: SteppingMode::Continue,
            depth: 0,
            stack: Vec::new(),
            gate: Gate::new(),
        }
    }
}

#[derive(Default)]
struct TracerInner {
    engine: BreakpointEngine,
    registry: FrameRegistry,
    store: VariableStore,
    threads: HashMap<i64, ThreadState>,
    exceptions: HashMap<i64, ExceptionDetails>,
    injector: ProbeInjector,
    /// Rewritten units, keyed by `(source, function name)`.
    probe_units: HashMap<(String, String), CodeUnit>,
    /// Original units as registered by the front end.
    code_units: HashMap<(String, String), CodeUnit>,
    observed_sources: IndexSet<String>,
    entry_pending: bool,
}

pub struct TraceController {
    inner: Mutex<TracerInner>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    stop_signal: Condvar,
    terminated: AtomicBool,
    stop_on_entry: AtomicBool,
}

impl Default for TraceController {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceController {
    pub fn new() -> Self {
        TraceController {
            inner: Mutex::new(TracerInner {
                engine: BreakpointEngine::new(),
                registry: FrameRegistry::new(),
                store: VariableStore::new(),
                ..Default::default()
            }),
            sink: Mutex::new(None),
            stop_signal: Condvar::new(),
            terminated: AtomicBool::new(false),
            stop_on_entry: AtomicBool::new(false),
        }
    }

    /// Install the event sink; done once by the owning backend.
    pub fn install_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    pub fn set_stop_on_entry(&self, enabled: bool) {
        self.stop_on_entry.store(enabled, Ordering::SeqCst);
        if enabled {
            self.inner.lock().unwrap().entry_pending = true;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn emit(&self, event: DebugEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.submit(event);
        }
    }

    // ------------------------------------------------------------------
    // Hooks, invoked on debuggee threads
    // ------------------------------------------------------------------

    /// A new thread entered traced execution.
    pub fn on_thread_started(&self, thread_id: i64, name: impl Into<String>) {
        let name = name.into();
        let is_new = {
            let mut inner = self.inner.lock().unwrap();
            match inner.threads.entry(thread_id) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(ThreadState::new(name.clone()));
                    true
                }
                std::collections::hash_map::Entry::Occupied(_) => false,
            }
        };
        if is_new {
            self.emit(DebugEvent::Thread { thread_id, reason: "started", name: Some(name) });
        }
    }

    pub fn on_thread_exited(&self, thread_id: i64) {
        let existed = {
            let mut inner = self.inner.lock().unwrap();
            inner.registry.invalidate_thread(thread_id);
            inner.threads.remove(&thread_id).is_some()
        };
        if existed {
            self.emit(DebugEvent::Thread { thread_id, reason: "exited", name: None });
        }
    }

    /// Frame pushed: function call. May stop for a function breakpoint.
    pub fn on_call(
        &self,
        thread_id: i64,
        frame: &FrameHandle,
        func_name: &str,
        module: &str,
    ) -> ResumeMode {
        self.on_thread_started(thread_id, format!("Thread {thread_id}"));
        let action = {
            let mut inner = self.inner.lock().unwrap();
            let thread = inner.threads.get_mut(&thread_id).expect("registered above");
            thread.depth += 1;
            thread.stack.push(frame.clone());
            if !inner.engine.has_function_breakpoints() {
                BreakAction::Continue
            } else {
                let (locals, globals) = frame_namespaces(frame);
                inner.engine.resolve_call(func_name, module, &locals, &globals)
            }
        };
        match action {
            BreakAction::Continue => ResumeMode::Continue,
            BreakAction::Log(text) => {
                self.emit_log(text);
                ResumeMode::Continue
            }
            BreakAction::Stop { reason, description } => {
                self.do_stop(thread_id, reason, description, None)
            }
        }
    }

    /// Frame popped: function return.
    pub fn on_return(&self, thread_id: i64, frame: &FrameHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&thread_id) {
            thread.depth = thread.depth.saturating_sub(1);
            thread.stack.pop();
        }
        frame.lock().unwrap().live = false;
    }

    /// Line event. Returns the resume mode when the thread stopped, or
    /// `Continue` when execution should just proceed.
    pub fn on_line(&self, thread_id: i64, frame: &FrameHandle, line: u32) -> ResumeMode {
        if self.is_terminated() {
            return ResumeMode::Terminate;
        }
        self.on_thread_started(thread_id, format!("Thread {thread_id}"));

        let (source, func_name) = {
            let data = frame.lock().unwrap();
            (data.source.clone(), data.func_name.clone())
        };

        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.observed_sources.insert(source.clone());

            let thread = inner.threads.get_mut(&thread_id).expect("registered above");
            let step_hit = match thread.stepping {
                SteppingMode::Continue => false,
                SteppingMode::StepIn => true,
                SteppingMode::StepOver { depth } => thread.depth <= depth,
                SteppingMode::StepOut { depth } => thread.depth < depth,
            };
            let depth_now = thread.depth;
            let entry_hit = inner.entry_pending && depth_now <= 1;
            let stepping_active = inner
                .threads
                .values()
                .any(|t| !matches!(t.stepping, SteppingMode::Continue));

            // Probe fast path: with only plain line breakpoints active, an
            // unprobed line needs no resolver round trip.
            if !step_hit
                && !entry_hit
                && !stepping_active
                && !inner.engine.has_data_watches()
                && !inner.entry_pending
            {
                if let Some(unit) = inner
                    .probe_units
                    .get(&(normalize_path(&source), func_name.clone()))
                {
                    if !unit.has_probe(line) {
                        return ResumeMode::Continue;
                    }
                }
            }

            let (locals, globals) = frame_namespaces(frame);
            let frame_key = Arc::as_ptr(frame) as u64;
            let action = inner.engine.resolve_line(
                &source,
                line,
                frame_key,
                &locals,
                &globals,
                StepContext { step_hit, entry_hit },
            );
            if matches!(
                action,
                BreakAction::Stop { reason: StopReason::Entry, .. }
            ) {
                inner.entry_pending = false;
            }
            action
        };

        match action {
            BreakAction::Continue => ResumeMode::Continue,
            BreakAction::Log(text) => {
                self.emit_log(text);
                ResumeMode::Continue
            }
            BreakAction::Stop { reason, description } => {
                self.do_stop(thread_id, reason, description, None)
            }
        }
    }

    /// Exception raised in the debuggee. `caught` is true when an enclosing
    /// handler will receive it.
    pub fn on_exception(
        &self,
        thread_id: i64,
        frame: &FrameHandle,
        message: &str,
        caught: bool,
    ) -> ResumeMode {
        self.on_thread_started(thread_id, format!("Thread {thread_id}"));
        let details = {
            let mut inner = self.inner.lock().unwrap();
            let break_now = inner.engine.break_on_raised
                || (inner.engine.break_on_uncaught && !caught);
            if !break_now {
                return ResumeMode::Continue;
            }
            let source = frame.lock().unwrap().source.clone();
            let stack_trace = inner
                .threads
                .get(&thread_id)
                .map(|thread| render_stack_text(&thread.stack))
                .unwrap_or_default();
            let details = ExceptionDetails {
                exception_id: "ScriptError".to_string(),
                description: message.to_string(),
                break_mode: if inner.engine.break_on_raised { "always" } else { "unhandled" },
                type_name: "ScriptError".to_string(),
                full_type_name: "script.ScriptError".to_string(),
                source,
                stack_trace,
            };
            inner.exceptions.insert(thread_id, details.clone());
            details
        };
        self.do_stop(
            thread_id,
            StopReason::Exception,
            Some(details.description.clone()),
            Some(format!("{}: {}", details.type_name, details.description)),
        )
    }

    /// Debuggee finished.
    pub fn on_exit(&self, code: i32) {
        self.emit(DebugEvent::Exited { code });
    }

    /// Program output (the script `print` statement).
    pub fn on_output(&self, text: String) {
        self.emit(DebugEvent::Output { category: "stdout", output: text });
    }

    fn emit_log(&self, text: String) {
        let mut output = text;
        if !output.ends_with('\n') {
            output.push('\n');
        }
        self.emit(DebugEvent::Output { category: "console", output });
    }

    /// Record the stop, notify the session and park the calling thread on
    /// its gate until a resume request arrives.
    fn do_stop(
        &self,
        thread_id: i64,
        reason: StopReason,
        description: Option<String>,
        text: Option<String>,
    ) -> ResumeMode {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let Some(thread) = inner.threads.get_mut(&thread_id) else {
                return ResumeMode::Continue;
            };
            thread.stopped = true;
            thread.stop_reason = Some(reason);
            thread.stepping = SteppingMode::Continue;
            // Record the full stack, caller-most last.
            for handle in thread.stack.iter().rev() {
                inner.registry.mint(thread_id, handle.clone());
            }
            thread.gate.clone()
        };
        self.stop_signal.notify_all();
        self.emit(DebugEvent::Stopped { thread_id, reason, description, text });

        let mode = gate.wait();
        if matches!(mode, ResumeMode::Terminate) {
            self.terminated.store(true, Ordering::SeqCst);
        }
        mode
    }

    // ------------------------------------------------------------------
    // Kernel-side operations
    // ------------------------------------------------------------------

    /// Wait until any thread reports stopped. Used by `launch` with
    /// `stopOnEntry` and by tests.
    pub fn wait_for_stop(&self, timeout: Duration) -> Option<i64> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some((id, _)) = inner.threads.iter().find(|(_, t)| t.stopped) {
                return Some(*id);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .stop_signal
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    /// Resume one thread with a stepping mode; invalidates every frame id
    /// minted since the last stop.
    pub fn resume(&self, thread_id: i64, mode: ResumeMode) -> Result<(), Error> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.registry.invalidate();
            inner.store.clear();
            let thread = inner
                .threads
                .get_mut(&thread_id)
                .ok_or(Error::ThreadNotFound(thread_id))?;
            if !thread.stopped {
                // Resuming a running thread is a no-op; releasing its gate
                // here would make the next stop fall straight through.
                return Ok(());
            }
            let depth = thread.depth;
            thread.stepping = match mode {
                ResumeMode::Continue | ResumeMode::Terminate => SteppingMode::Continue,
                ResumeMode::StepIn => SteppingMode::StepIn,
                ResumeMode::StepOver => SteppingMode::StepOver { depth },
                ResumeMode::StepOut => SteppingMode::StepOut { depth },
            };
            thread.stopped = false;
            thread.stop_reason = None;
            thread.gate.clone()
        };
        gate.release(mode);
        Ok(())
    }

    /// Release every parked thread for shutdown and mark the controller
    /// terminated. Idempotent.
    pub fn shutdown(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let gates: Vec<Arc<Gate>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.registry.invalidate();
            inner
                .threads
                .values_mut()
                .map(|thread| {
                    thread.stopped = false;
                    thread.gate.clone()
                })
                .collect()
        };
        for gate in gates {
            gate.release(ResumeMode::Terminate);
        }
    }

    pub fn set_breakpoints(
        &self,
        path: &str,
        entries: &[(u32, Option<String>, Option<String>, Option<String>)],
    ) -> Vec<Json> {
        let mut inner = self.inner.lock().unwrap();
        let records = inner.engine.set_breakpoints(path, entries);
        self.refresh_probe_units(&mut inner, path);
        records
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "verified": record.verified,
                    "line": record.line,
                })
            })
            .collect()
    }

    fn refresh_probe_units(&self, inner: &mut TracerInner, path: &str) {
        // Breakpoint sets changed: cached rewrites are stale.
        inner.injector.clear_cache();
        let normalized = normalize_path(path);
        let lines = inner.engine.lines_for(path);
        let keys: Vec<(String, String)> = inner
            .code_units
            .keys()
            .filter(|(source, _)| *source == normalized)
            .cloned()
            .collect();
        for key in keys {
            let unit = inner.code_units[&key].clone();
            let (accepted, rewritten) = inner.injector.inject(&unit, &lines);
            if accepted {
                inner.probe_units.insert(key, rewritten);
            } else {
                inner.probe_units.remove(&key);
            }
        }
    }

    pub fn set_function_breakpoints(
        &self,
        entries: &[(String, Option<String>, Option<String>)],
    ) -> Vec<Json> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .engine
            .set_function_breakpoints(entries)
            .iter()
            .map(|record| json!({"id": record.id, "verified": true}))
            .collect()
    }

    pub fn set_exception_breakpoints(&self, filters: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.break_on_raised = filters.iter().any(|f| f == "raised");
        inner.engine.break_on_uncaught = filters.iter().any(|f| f == "uncaught");
    }

    pub fn set_data_breakpoints(
        &self,
        entries: &[(String, Option<String>, Option<String>)],
    ) -> Vec<Json> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .engine
            .set_data_breakpoints(entries)
            .into_iter()
            .map(|verified| json!({"verified": verified}))
            .collect()
    }

    pub fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Json {
        json!({
            "dataId": make_data_id(frame_id, name),
            "description": format!("Variable '{name}' in frame {frame_id}"),
            "accessTypes": ["write"],
            "canPersist": false,
        })
    }

    /// Register a compiled unit produced by the script front end.
    pub fn register_code_unit(&self, unit: CodeUnit) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .observed_sources
            .insert(unit.source.clone());
        inner
            .code_units
            .insert((normalize_path(&unit.source), unit.name.clone()), unit);
    }

    pub fn threads(&self) -> Vec<Json> {
        let inner = self.inner.lock().unwrap();
        inner
            .threads
            .iter()
            .map(|(id, thread)| (*id, thread.name.clone()))
            .sorted_by_key(|(id, _)| *id)
            .map(|(id, name)| json!({"id": id, "name": name}))
            .collect_vec()
    }

    pub fn stack_trace(
        &self,
        thread_id: i64,
        start_frame: usize,
        levels: usize,
    ) -> Result<(Vec<Json>, usize), Error> {
        let inner = self.inner.lock().unwrap();
        if !inner.threads.contains_key(&thread_id) {
            return Err(Error::ThreadNotFound(thread_id));
        }
        let stack = inner.registry.stack(thread_id);
        let total = stack.len();
        let page: Vec<Json> = stack
            .iter()
            .skip(start_frame)
            .take(if levels > 0 { levels } else { usize::MAX })
            .map(|record| {
                let (line, name) = {
                    let data = record.handle.lock().unwrap();
                    (data.line, data.func_name.clone())
                };
                json!({
                    "id": record.id,
                    "name": name,
                    "line": line,
                    "column": 0,
                    "source": {
                        "name": file_name(&record.source),
                        "path": record.source,
                    },
                })
            })
            .collect();
        Ok((page, total))
    }

    pub fn scopes(&self, frame_id: i64) -> Result<Vec<Json>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.registry.get(frame_id)?;
        let locals_ref = inner
            .store
            .alloc(VarRef::Scope { frame_id, kind: ScopeKind::Locals });
        let globals_ref = inner
            .store
            .alloc(VarRef::Scope { frame_id, kind: ScopeKind::Globals });
        Ok(vec![
            json!({
                "name": "Local",
                "variablesReference": locals_ref,
                "expensive": false,
            }),
            json!({
                "name": "Global",
                "variablesReference": globals_ref,
                "expensive": true,
            }),
        ])
    }

    pub fn variables(
        &self,
        var_ref: i64,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<Json>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner
            .store
            .variables(var_ref, &inner.registry, filter, start, count)
    }

    /// `setVariable` coercion: literal first, then expression in the
    /// frame's context, then plain string.
    pub fn set_variable(&self, var_ref: i64, name: &str, raw: &str) -> Result<Json, Error> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let value = match parse_literal(raw) {
            Some(value) => value,
            None => {
                let frame_id = match inner.store.get(var_ref)? {
                    VarRef::Scope { frame_id, .. } | VarRef::Path { frame_id, .. } => {
                        Some(*frame_id)
                    }
                    _ => None,
                };
                let evaluated = frame_id.and_then(|frame_id| {
                    let record = inner.registry.get(frame_id).ok()?;
                    let (locals, globals) = frame_namespaces(&record.handle);
                    eval::evaluate_str(raw, &locals, &globals).ok()
                });
                evaluated.unwrap_or_else(|| Value::Str(raw.to_string()))
            }
        };
        inner.store.set_variable(var_ref, &inner.registry, name, value)
    }

    pub fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        _context: &str,
    ) -> Result<Json, Error> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let (locals, globals) = match frame_id {
            Some(frame_id) => {
                let record = inner.registry.get(frame_id)?;
                frame_namespaces(&record.handle)
            }
            None => {
                // Hover/watch without a frame: globals of any stopped thread.
                let top = inner
                    .threads
                    .values()
                    .filter(|t| t.stopped)
                    .find_map(|t| t.stack.last().cloned());
                match top {
                    Some(handle) => frame_namespaces(&handle),
                    None => (Namespace::new(), Namespace::new()),
                }
            }
        };
        let value = eval::evaluate_str(expression, &locals, &globals)?;
        let reference = inner.store.snapshot_ref(&value);
        Ok(json!({
            "result": value.repr(),
            "type": value.type_name(),
            "variablesReference": reference,
        }))
    }

    pub fn exception_info(&self, thread_id: i64) -> Result<Json, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .exceptions
            .get(&thread_id)
            .map(ExceptionDetails::to_json)
            .ok_or(Error::NoExceptionInfo(thread_id))
    }

    pub fn loaded_sources(&self) -> Vec<Json> {
        let inner = self.inner.lock().unwrap();
        let mut sources: Vec<&String> = inner.observed_sources.iter().collect();
        sources.sort();
        sources
            .into_iter()
            .map(|path| {
                json!({
                    "name": file_name(path),
                    "path": path,
                })
            })
            .collect()
    }

    pub fn modules(&self) -> Vec<Json> {
        let inner = self.inner.lock().unwrap();
        inner
            .observed_sources
            .iter()
            .enumerate()
            .map(|(idx, path)| {
                json!({
                    "id": idx.to_string(),
                    "name": module_name(path),
                    "path": path,
                    "isUserCode": true,
                })
            })
            .collect()
    }

    /// Whether the given thread is currently parked at a stop.
    pub fn is_stopped(&self, thread_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .threads
            .get(&thread_id)
            .map(|t| t.stopped)
            .unwrap_or(false)
    }
}

fn frame_namespaces(frame: &FrameHandle) -> (Namespace, Namespace) {
    let data = frame.lock().unwrap();
    let globals = data.globals.lock().unwrap().clone();
    (data.locals.clone(), globals)
}

fn render_stack_text(stack: &[FrameHandle]) -> String {
    stack
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, handle)| {
            let data = handle.lock().unwrap();
            format!("#{idx} {} ({}:{})", data.func_name, data.source, data.line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn module_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::frame::new_frame;
    use std::sync::mpsc;
    use std::thread;

    struct ChannelSink(Mutex<mpsc::Sender<DebugEvent>>);

    impl EventSink for ChannelSink {
        fn submit(&self, event: DebugEvent) {
            let _ = self.0.lock().unwrap().send(event);
        }
    }

    fn controller_with_sink() -> (Arc<TraceController>, mpsc::Receiver<DebugEvent>) {
        let controller = Arc::new(TraceController::new());
        let (tx, rx) = mpsc::channel();
        controller.install_sink(Arc::new(ChannelSink(Mutex::new(tx))));
        (controller, rx)
    }

    #[test]
    fn test_stop_and_resume_cycle() {
        let (controller, events) = controller_with_sink();
        controller.set_breakpoints("/tmp/t.scr", &[(5, None, None, None)]);

        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                let globals = Arc::new(Mutex::new(Namespace::new()));
                let frame = new_frame("main", "/tmp/t.scr", globals);
                controller.on_call(7, &frame, "main", "t");
                frame.lock().unwrap().line = 5;
                controller.on_line(7, &frame, 5)
            })
        };

        let stopped = controller.wait_for_stop(Duration::from_secs(2));
        assert_eq!(stopped, Some(7));
        // Thread-started then stopped events arrived.
        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            if let DebugEvent::Stopped { thread_id, reason, .. } = event {
                assert_eq!(thread_id, 7);
                assert_eq!(reason, StopReason::Breakpoint);
                saw_stop = true;
            }
        }
        assert!(saw_stop);

        let (frames, total) = controller.stack_trace(7, 0, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(frames[0]["line"], 5);

        controller.resume(7, ResumeMode::Continue).unwrap();
        let mode = worker.join().unwrap();
        assert_eq!(mode, ResumeMode::Continue);
        // Frame ids minted at the stop are dead now.
        let frame_id = frames[0]["id"].as_i64().unwrap();
        assert!(controller.scopes(frame_id).is_err());
    }

    #[test]
    fn test_step_over_stops_on_next_line() {
        let (controller, _events) = controller_with_sink();
        controller.set_breakpoints("/tmp/s.scr", &[(1, None, None, None)]);

        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                let globals = Arc::new(Mutex::new(Namespace::new()));
                let frame = new_frame("main", "/tmp/s.scr", globals);
                controller.on_call(1, &frame, "main", "s");
                frame.lock().unwrap().line = 1;
                controller.on_line(1, &frame, 1);
                frame.lock().unwrap().line = 2;
                controller.on_line(1, &frame, 2)
            })
        };

        controller.wait_for_stop(Duration::from_secs(2)).unwrap();
        controller.resume(1, ResumeMode::StepOver).unwrap();
        controller.wait_for_stop(Duration::from_secs(2)).unwrap();
        let (frames, _) = controller.stack_trace(1, 0, 0).unwrap();
        assert_eq!(frames[0]["line"], 2);
        controller.resume(1, ResumeMode::Continue).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_exception_break_records_info() {
        let (controller, _events) = controller_with_sink();
        controller.set_exception_breakpoints(&["raised".to_string()]);

        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                let globals = Arc::new(Mutex::new(Namespace::new()));
                let frame = new_frame("main", "/tmp/e.scr", globals);
                controller.on_call(3, &frame, "main", "e");
                controller.on_exception(3, &frame, "boom", true)
            })
        };

        controller.wait_for_stop(Duration::from_secs(2)).unwrap();
        let info = controller.exception_info(3).unwrap();
        assert_eq!(info["description"], "boom");
        assert_eq!(info["breakMode"], "always");
        controller.resume(3, ResumeMode::Continue).unwrap();
        worker.join().unwrap();
        assert!(controller.exception_info(99).is_err());
    }

    #[test]
    fn test_shutdown_releases_parked_threads() {
        let (controller, _events) = controller_with_sink();
        controller.set_breakpoints("/tmp/x.scr", &[(1, None, None, None)]);
        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                let globals = Arc::new(Mutex::new(Namespace::new()));
                let frame = new_frame("main", "/tmp/x.scr", globals);
                controller.on_call(2, &frame, "main", "x");
                frame.lock().unwrap().line = 1;
                controller.on_line(2, &frame, 1)
            })
        };
        controller.wait_for_stop(Duration::from_secs(2)).unwrap();
        controller.shutdown();
        let mode = worker.join().unwrap();
        assert_eq!(mode, ResumeMode::Terminate);
        assert!(controller.is_terminated());
    }
}
