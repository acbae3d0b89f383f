//! Live frame handles and the frame-id registry.
//!
//! Frame ids handed to the client are minted at each stop and die at the
//! next resume: the registry keeps a generation counter, and resuming bumps
//! it, so a stale id can only ever produce a well-formed error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::debugger::error::Error;
use crate::runtime::{Namespace, SharedNamespace};

/// Mutable state of one activation record, shared with the interpreter.
#[derive(Debug)]
pub struct FrameData {
    pub func_name: String,
    pub source: String,
    pub line: u32,
    pub locals: Namespace,
    pub globals: SharedNamespace,
    /// True while the frame is on its thread's stack. Cleared on return,
    /// after which lookups through a stale handle fail explicitly.
    pub live: bool,
}

/// Shared handle to a live frame.
pub type FrameHandle = Arc<Mutex<FrameData>>;

pub fn new_frame(
    func_name: impl Into<String>,
    source: impl Into<String>,
    globals: SharedNamespace,
) -> FrameHandle {
    Arc::new(Mutex::new(FrameData {
        func_name: func_name.into(),
        source: source.into(),
        line: 0,
        locals: Namespace::new(),
        globals,
        live: true,
    }))
}

/// A minted frame id with the metadata served by `stackTrace`.
#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub id: i64,
    pub thread_id: i64,
    pub name: String,
    pub source: String,
    pub line: u32,
    pub handle: FrameHandle,
    generation: u64,
}

/// Registry of frame ids minted since the last stop.
pub struct FrameRegistry {
    next_id: i64,
    generation: u64,
    frames: HashMap<i64, FrameRecord>,
    /// Stack order per thread, top frame first.
    by_thread: HashMap<i64, Vec<i64>>,
}

impl Default for FrameRegistry {
    fn default() -> Self {
        FrameRegistry {
            next_id: 1,
            generation: 0,
            frames: HashMap::new(),
            by_thread: HashMap::new(),
        }
    }
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint an id for a live frame captured at a stop. Ids are unique and
    /// strictly increasing for the whole session.
    pub fn mint(&mut self, thread_id: i64, handle: FrameHandle) -> FrameRecord {
        let (name, source, line) = {
            let data = handle.lock().unwrap();
            (data.func_name.clone(), data.source.clone(), data.line)
        };
        let record = FrameRecord {
            id: self.next_id,
            thread_id,
            name,
            source,
            line,
            handle,
            generation: self.generation,
        };
        self.next_id += 1;
        self.frames.insert(record.id, record.clone());
        self.by_thread.entry(thread_id).or_default().push(record.id);
        record
    }

    /// Look up a frame id minted at the current stop.
    pub fn get(&self, frame_id: i64) -> Result<&FrameRecord, Error> {
        match self.frames.get(&frame_id) {
            Some(record) if record.generation == self.generation => Ok(record),
            _ => Err(Error::FrameNotFound(frame_id)),
        }
    }

    /// Stack for one thread, top frame first.
    pub fn stack(&self, thread_id: i64) -> Vec<FrameRecord> {
        self.by_thread
            .get(&thread_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.frames.get(id))
                    .filter(|record| record.generation == self.generation)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Invalidate every frame id minted since the last stop. Called on
    /// `continue`/`next`/`stepIn`/`stepOut`.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.frames.clear();
        self.by_thread.clear();
    }

    /// Drop one thread's frames only (thread resumed independently).
    pub fn invalidate_thread(&mut self, thread_id: i64) {
        if let Some(ids) = self.by_thread.remove(&thread_id) {
            for id in ids {
                self.frames.remove(&id);
            }
        }
    }
}
