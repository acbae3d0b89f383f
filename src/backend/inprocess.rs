//! In-process backend: the script runtime executes on threads inside the
//! adapter process, hooked straight into a [`TraceController`].

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value as Json;

use crate::backend::{Backend, DataEntry, FunctionEntry, LaunchConfig, LineEntry};
use crate::debugger::error::Error;
use crate::debugger::tracer::{ResumeMode, TraceController};
use crate::debugger::EventSink;
use crate::runtime::script::{parse_program, ScriptRuntime};

/// Barrier separating `launch` from actual execution; dropped by
/// `configurationDone`.
struct StartBarrier {
    released: Mutex<bool>,
    cond: Condvar,
}

impl StartBarrier {
    fn new() -> Arc<Self> {
        Arc::new(StartBarrier { released: Mutex::new(false), cond: Condvar::new() })
    }

    fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cond.wait(released).unwrap();
        }
    }
}

pub struct InProcessBackend {
    controller: Arc<TraceController>,
    barrier: Arc<StartBarrier>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend").finish()
    }
}

impl InProcessBackend {
    pub fn launch(config: &LaunchConfig, sink: Arc<dyn EventSink>) -> Result<Self, Error> {
        let path = std::fs::canonicalize(&config.program)
            .map_err(|_| Error::Configuration(format!("program not found: {}", config.program)))?;
        let text = std::fs::read_to_string(&path)?;
        let program = parse_program(&text, &path.to_string_lossy())?;

        let controller = Arc::new(TraceController::new());
        controller.install_sink(sink);
        controller.set_stop_on_entry(config.stop_on_entry && !config.no_debug);

        let runtime = ScriptRuntime::new(program, controller.clone(), config.no_debug);
        runtime.set_argv(&config.args);
        let barrier = StartBarrier::new();
        let worker = {
            let runtime = runtime.clone();
            let controller = controller.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                if controller.is_terminated() {
                    return;
                }
                let code = runtime.run();
                controller.on_exit(code);
            })
        };

        Ok(InProcessBackend { controller, barrier, worker: Some(worker) })
    }
}

impl Backend for InProcessBackend {
    fn configuration_done(&self) -> Result<(), Error> {
        self.barrier.release();
        Ok(())
    }

    fn set_breakpoints(&self, path: &str, entries: &[LineEntry]) -> Result<Vec<Json>, Error> {
        Ok(self.controller.set_breakpoints(path, entries))
    }

    fn set_function_breakpoints(&self, entries: &[FunctionEntry]) -> Result<Vec<Json>, Error> {
        Ok(self.controller.set_function_breakpoints(entries))
    }

    fn set_exception_breakpoints(&self, filters: &[String]) -> Result<(), Error> {
        self.controller.set_exception_breakpoints(filters);
        Ok(())
    }

    fn set_data_breakpoints(&self, entries: &[DataEntry]) -> Result<Vec<Json>, Error> {
        Ok(self.controller.set_data_breakpoints(entries))
    }

    fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Result<Json, Error> {
        Ok(self.controller.data_breakpoint_info(name, frame_id))
    }

    fn resume(&self, thread_id: i64, mode: ResumeMode) -> Result<(), Error> {
        self.controller.resume(thread_id, mode)
    }

    fn pause(&self, _thread_id: i64) -> Result<bool, Error> {
        // Interrupting a running script thread is not attempted; the client
        // is told the pause did not take effect.
        Ok(false)
    }

    fn threads(&self) -> Result<Vec<Json>, Error> {
        Ok(self.controller.threads())
    }

    fn stack_trace(
        &self,
        thread_id: i64,
        start_frame: usize,
        levels: usize,
    ) -> Result<(Vec<Json>, usize), Error> {
        self.controller.stack_trace(thread_id, start_frame, levels)
    }

    fn scopes(&self, frame_id: i64) -> Result<Vec<Json>, Error> {
        self.controller.scopes(frame_id)
    }

    fn variables(
        &self,
        var_ref: i64,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<Json>, Error> {
        self.controller.variables(var_ref, filter, start, count)
    }

    fn set_variable(&self, var_ref: i64, name: &str, value: &str) -> Result<Json, Error> {
        self.controller.set_variable(var_ref, name, value)
    }

    fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<Json, Error> {
        self.controller.evaluate(expression, frame_id, context)
    }

    fn exception_info(&self, thread_id: i64) -> Result<Json, Error> {
        self.controller.exception_info(thread_id)
    }

    fn loaded_sources(&self) -> Result<Vec<Json>, Error> {
        Ok(self.controller.loaded_sources())
    }

    fn modules(&self) -> Result<Vec<Json>, Error> {
        Ok(self.controller.modules())
    }

    fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.controller.wait_for_stop(timeout).is_some()
    }

    fn process_id(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn shutdown(&mut self) {
        self.controller.shutdown();
        // Unblock a worker still parked on the start barrier.
        self.barrier.release();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for InProcessBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
