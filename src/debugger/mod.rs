//! Debugger core: breakpoint resolution, expression evaluation, frame and
//! variable bookkeeping, the in-process trace controller and the probe
//! injector. Everything here is backend-agnostic; backends wire these pieces
//! to a concrete debuggee.

pub mod breakpoint;
pub mod error;
pub mod eval;
pub mod frame;
pub mod probe;
pub mod tracer;
pub mod variable;

use serde_json::Value as Json;
use strum_macros::{Display, EnumString};

pub use error::Error;

/// Stepping mode armed on a thread by a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SteppingMode {
    /// Run until the next breakpoint.
    #[default]
    Continue,
    /// Stop at the next line in the same frame or a caller frame.
    StepOver { depth: usize },
    /// Stop at the very next executed line, wherever it is.
    StepIn,
    /// Stop at the next line after the current frame returns.
    StepOut { depth: usize },
}

/// Why a thread stopped; rendered into the `reason` of a `stopped` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum StopReason {
    #[strum(serialize = "breakpoint")]
    Breakpoint,
    #[strum(serialize = "function breakpoint")]
    FunctionBreakpoint,
    #[strum(serialize = "data breakpoint")]
    DataBreakpoint,
    #[strum(serialize = "step")]
    Step,
    #[strum(serialize = "entry")]
    Entry,
    #[strum(serialize = "exception")]
    Exception,
    #[strum(serialize = "pause")]
    Pause,
}

/// Exception details captured at an exception break, served by `exceptionInfo`.
#[derive(Debug, Clone)]
pub struct ExceptionDetails {
    pub exception_id: String,
    pub description: String,
    pub break_mode: &'static str,
    pub type_name: String,
    pub full_type_name: String,
    pub source: String,
    pub stack_trace: String,
}

impl ExceptionDetails {
    pub fn to_json(&self) -> Json {
        serde_json::json!({
            "exceptionId": self.exception_id,
            "description": self.description,
            "breakMode": self.break_mode,
            "details": {
                "message": self.description,
                "typeName": self.type_name,
                "fullTypeName": self.full_type_name,
                "source": self.source,
                "stackTrace": self.stack_trace,
            },
        })
    }
}

/// Events a backend reports to the session kernel.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    Stopped {
        thread_id: i64,
        reason: StopReason,
        description: Option<String>,
        text: Option<String>,
    },
    Continued {
        thread_id: i64,
        all_threads: bool,
    },
    Thread {
        thread_id: i64,
        reason: &'static str,
        name: Option<String>,
    },
    Output {
        category: &'static str,
        output: String,
    },
    Exited {
        code: i32,
    },
    Terminated,
    /// Forwarded as-is to the client (used by the external backend for
    /// events the adapter does not interpret).
    Custom {
        event: String,
        body: Json,
    },
}

/// Thin callback capability handed to backends. The session owns the
/// backend; the backend only ever sees this sink, never the session.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: DebugEvent);

    fn emit_stopped(
        &self,
        thread_id: i64,
        reason: StopReason,
        description: Option<String>,
        text: Option<String>,
    ) {
        self.submit(DebugEvent::Stopped { thread_id, reason, description, text });
    }

    fn emit_thread(&self, thread_id: i64, reason: &'static str, name: Option<String>) {
        self.submit(DebugEvent::Thread { thread_id, reason, name });
    }

    fn emit_exited(&self, code: i32) {
        self.submit(DebugEvent::Exited { code });
    }

    fn emit_output(&self, category: &'static str, output: String) {
        self.submit(DebugEvent::Output { category, output });
    }
}
