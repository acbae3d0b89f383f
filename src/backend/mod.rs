//! Debuggee backends.
//!
//! Exactly one backend is active per session: `inprocess` runs the script
//! runtime on threads inside the adapter process, `external` spawns a
//! `dapper-launcher` child and relays commands over IPC. The session only
//! sees this trait; backends only see the session's [`EventSink`].

pub mod external;
pub mod inprocess;
pub mod ipc;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::debugger::error::Error;
use crate::debugger::tracer::ResumeMode;
use crate::debugger::EventSink;

/// `launch` request arguments.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub stop_on_entry: bool,
    pub no_debug: bool,
    pub in_process: bool,
    pub use_ipc: bool,
    pub ipc_transport: Option<String>,
    pub ipc_pipe_name: Option<String>,
    pub use_binary_ipc: bool,
}

/// `attach` request arguments.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachConfig {
    pub use_ipc: bool,
    pub ipc_transport: Option<String>,
    pub ipc_host: Option<String>,
    pub ipc_port: Option<u16>,
    pub ipc_path: Option<String>,
    pub ipc_pipe_name: Option<String>,
}

/// Breakpoint entries in wire order: `(line, condition, hitCondition,
/// logMessage)`.
pub type LineEntry = (u32, Option<String>, Option<String>, Option<String>);
/// `(name, condition, hitCondition)`.
pub type FunctionEntry = (String, Option<String>, Option<String>);
/// `(dataId, condition, hitCondition)`.
pub type DataEntry = (String, Option<String>, Option<String>);

pub trait Backend: Send + std::fmt::Debug {
    /// Release the debuggee from its initialisation barrier.
    fn configuration_done(&self) -> Result<(), Error>;

    fn set_breakpoints(&self, path: &str, entries: &[LineEntry]) -> Result<Vec<Json>, Error>;
    fn set_function_breakpoints(&self, entries: &[FunctionEntry]) -> Result<Vec<Json>, Error>;
    fn set_exception_breakpoints(&self, filters: &[String]) -> Result<(), Error>;
    fn set_data_breakpoints(&self, entries: &[DataEntry]) -> Result<Vec<Json>, Error>;
    fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Result<Json, Error>;

    fn resume(&self, thread_id: i64, mode: ResumeMode) -> Result<(), Error>;
    /// Best-effort pause; returns whether a stop was actually requested.
    fn pause(&self, thread_id: i64) -> Result<bool, Error>;

    fn threads(&self) -> Result<Vec<Json>, Error>;
    fn stack_trace(
        &self,
        thread_id: i64,
        start_frame: usize,
        levels: usize,
    ) -> Result<(Vec<Json>, usize), Error>;
    fn scopes(&self, frame_id: i64) -> Result<Vec<Json>, Error>;
    fn variables(
        &self,
        var_ref: i64,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<Json>, Error>;
    fn set_variable(&self, var_ref: i64, name: &str, value: &str) -> Result<Json, Error>;
    fn evaluate(&self, expression: &str, frame_id: Option<i64>, context: &str)
        -> Result<Json, Error>;
    fn exception_info(&self, thread_id: i64) -> Result<Json, Error>;

    fn loaded_sources(&self) -> Result<Vec<Json>, Error>;
    fn modules(&self) -> Result<Vec<Json>, Error>;

    /// Block until any thread stops, used by `stopOnEntry`.
    fn wait_for_stop(&self, timeout: Duration) -> bool;

    fn process_id(&self) -> Option<u32>;

    /// Tear the debuggee down. Must be idempotent and release every held
    /// resource.
    fn shutdown(&mut self);
}

/// Select and start a backend for a `launch` request.
pub fn launch_backend(
    config: &LaunchConfig,
    sink: Arc<dyn EventSink>,
) -> Result<Box<dyn Backend>, Error> {
    if config.program.is_empty() {
        return Err(Error::MissingArgument("program"));
    }
    if config.in_process {
        if config.use_ipc {
            return Err(Error::Configuration(
                "inProcess and useIpc are mutually exclusive".into(),
            ));
        }
        Ok(Box::new(inprocess::InProcessBackend::launch(config, sink)?))
    } else {
        Ok(Box::new(external::ExternalBackend::launch(config, sink)?))
    }
}

/// Connect a backend for an `attach` request; never in-process.
pub fn attach_backend(
    config: &AttachConfig,
    sink: Arc<dyn EventSink>,
) -> Result<Box<dyn Backend>, Error> {
    if !config.use_ipc {
        return Err(Error::Configuration(
            "attach without useIpc is not supported".into(),
        ));
    }
    Ok(Box::new(external::ExternalBackend::attach(config, sink)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::DebugEvent;

    struct NullSink;
    impl EventSink for NullSink {
        fn submit(&self, _event: DebugEvent) {}
    }

    #[test]
    fn test_launch_requires_program() {
        let config = LaunchConfig::default();
        let err = launch_backend(&config, Arc::new(NullSink)).unwrap_err();
        assert!(matches!(err, Error::MissingArgument("program")));
    }

    #[test]
    fn test_attach_requires_ipc() {
        let config = AttachConfig::default();
        let err = attach_backend(&config, Arc::new(NullSink)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_launch_config_wire_names() {
        let config: LaunchConfig = serde_json::from_value(serde_json::json!({
            "program": "/tmp/p.scr",
            "stopOnEntry": true,
            "inProcess": true,
            "useBinaryIpc": true,
        }))
        .unwrap();
        assert!(config.stop_on_entry);
        assert!(config.in_process);
        assert!(config.use_binary_ipc);
        assert!(!config.no_debug);
    }
}
