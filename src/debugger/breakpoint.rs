//! Breakpoint tables and the line-event resolver.
//!
//! The resolver is the single decision point for every traced line: it
//! checks data watches, line breakpoints (hit conditions, log points,
//! conditions), stepping state and stop-on-entry, and answers with one of
//! STOP / CONTINUE / LOG.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::debugger::eval;
use crate::debugger::StopReason;
use crate::runtime::{Namespace, Value};

/// Parsed form of a DAP `hitCondition`.
///
/// Grammar (whitespace tolerant): `N` and `== N` mean exactly-N, `>= N`
/// means at-least-N, `% N` means every N-th hit. Anything else is
/// permissive and never blocks a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(u64),
    AtLeast(u64),
    EveryN(u64),
    Always,
}

static HIT_PLAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)$").expect("infallible"));
static HIT_EQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"^==\s*(\d+)$").expect("infallible"));
static HIT_GE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^>=\s*(\d+)$").expect("infallible"));
static HIT_MOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^%\s*(\d+)$").expect("infallible"));

impl HitCondition {
    pub fn parse(input: &str) -> Self {
        let s = input.trim();
        let capture = |re: &Regex| {
            re.captures(s)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
        };
        if let Some(n) = capture(&HIT_MOD) {
            return HitCondition::EveryN(n);
        }
        if let Some(n) = capture(&HIT_EQ) {
            return HitCondition::Equal(n);
        }
        if let Some(n) = capture(&HIT_GE) {
            return HitCondition::AtLeast(n);
        }
        if let Some(n) = capture(&HIT_PLAIN) {
            return HitCondition::Equal(n);
        }
        HitCondition::Always
    }

    pub fn matches(&self, hits: u64) -> bool {
        match self {
            HitCondition::Equal(n) => hits == *n,
            HitCondition::AtLeast(n) => hits >= *n,
            HitCondition::EveryN(n) => *n > 0 && hits % n == 0,
            HitCondition::Always => true,
        }
    }
}

/// One entry of the per-source breakpoint table.
#[derive(Debug, Clone)]
pub struct LineBreakpoint {
    pub id: i64,
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub log_message: Option<String>,
    pub hit_count: u64,
    pub verified: bool,
}

/// One entry of the function-breakpoint table.
#[derive(Debug, Clone)]
pub struct FunctionBreakpoint {
    pub id: i64,
    pub name: String,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub hit_count: u64,
}

/// One entry of the data-watch table, keyed by its `dataId`.
#[derive(Debug, Clone)]
pub struct DataWatch {
    pub data_id: String,
    pub var_name: String,
    pub frame_id: Option<i64>,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub hit_count: u64,
}

/// The resolver's verdict for one traced event.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakAction {
    Stop { reason: StopReason, description: Option<String> },
    Continue,
    /// Emit the rendered text as a `console` output event, do not stop.
    Log(String),
}

/// All breakpoint state of a session plus the per-frame snapshots used for
/// data-watch change detection.
#[derive(Default)]
pub struct BreakpointEngine {
    by_source: HashMap<String, Vec<LineBreakpoint>>,
    function_breakpoints: Vec<FunctionBreakpoint>,
    data_watches: IndexMap<String, DataWatch>,
    pub break_on_raised: bool,
    pub break_on_uncaught: bool,
    next_id: i64,
    /// frame key -> snapshot of watched variable values.
    watch_snapshots: HashMap<u64, HashMap<String, Value>>,
    /// Fallback snapshot across frames, used when a new frame object
    /// appears for each line.
    global_watch_values: HashMap<String, Value>,
}

/// Stepping/entry context supplied by the trace controller for step 4 of
/// the resolution algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepContext {
    pub step_hit: bool,
    pub entry_hit: bool,
}

pub fn normalize_path(path: &str) -> String {
    Path::new(path)
        .canonicalize()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

impl BreakpointEngine {
    pub fn new() -> Self {
        BreakpointEngine { next_id: 1, ..Default::default() }
    }

    fn alloc_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Full replace of the table for one source path. Returns the new
    /// records so callers can build the `verified` response.
    pub fn set_breakpoints(
        &mut self,
        path: &str,
        entries: &[(u32, Option<String>, Option<String>, Option<String>)],
    ) -> Vec<LineBreakpoint> {
        let path = normalize_path(path);
        let records: Vec<LineBreakpoint> = entries
            .iter()
            .map(|(line, condition, hit_condition, log_message)| LineBreakpoint {
                id: self.alloc_id(),
                line: *line,
                condition: condition.clone(),
                hit_condition: hit_condition.as_deref().map(HitCondition::parse),
                log_message: log_message.clone(),
                hit_count: 0,
                verified: true,
            })
            .collect();
        if records.is_empty() {
            self.by_source.remove(&path);
        } else {
            self.by_source.insert(path, records.clone());
        }
        records
    }

    /// Full replace of the function-breakpoint table.
    pub fn set_function_breakpoints(
        &mut self,
        entries: &[(String, Option<String>, Option<String>)],
    ) -> Vec<FunctionBreakpoint> {
        self.function_breakpoints = entries
            .iter()
            .map(|(name, condition, hit_condition)| FunctionBreakpoint {
                id: self.alloc_id(),
                name: name.clone(),
                condition: condition.clone(),
                hit_condition: hit_condition.as_deref().map(HitCondition::parse),
                hit_count: 0,
            })
            .collect();
        self.function_breakpoints.clone()
    }

    /// Full replace of the data-watch table. Entries with an unparsable
    /// `dataId` are reported unverified.
    pub fn set_data_breakpoints(
        &mut self,
        entries: &[(String, Option<String>, Option<String>)],
    ) -> Vec<bool> {
        self.data_watches.clear();
        self.watch_snapshots.clear();
        self.global_watch_values.clear();

        let mut verified = Vec::with_capacity(entries.len());
        for (data_id, condition, hit_condition) in entries {
            match parse_data_id(data_id) {
                Some((frame_id, var_name)) => {
                    self.data_watches.insert(
                        data_id.clone(),
                        DataWatch {
                            data_id: data_id.clone(),
                            var_name,
                            frame_id,
                            condition: condition.clone(),
                            hit_condition: hit_condition.as_deref().map(HitCondition::parse),
                            hit_count: 0,
                        },
                    );
                    verified.push(true);
                }
                None => verified.push(false),
            }
        }
        verified
    }

    pub fn breakpoints_for(&self, path: &str) -> Option<&Vec<LineBreakpoint>> {
        self.by_source.get(&normalize_path(path))
    }

    pub fn has_data_watches(&self) -> bool {
        !self.data_watches.is_empty()
    }

    pub fn has_function_breakpoints(&self) -> bool {
        !self.function_breakpoints.is_empty()
    }

    /// Lines with plain breakpoints for one source; feeds the probe injector.
    pub fn lines_for(&self, path: &str) -> Vec<u32> {
        self.breakpoints_for(path)
            .map(|records| records.iter().map(|r| r.line).collect())
            .unwrap_or_default()
    }

    /// Resolve a line event. `frame_key` identifies the live frame for
    /// data-watch snapshots (not the DAP frame id, which is minted later).
    pub fn resolve_line(
        &mut self,
        filename: &str,
        line: u32,
        frame_key: u64,
        locals: &Namespace,
        globals: &Namespace,
        step: StepContext,
    ) -> BreakAction {
        // 1. Data watches observe every traced line.
        let changed = self.check_data_watches(frame_key, locals);
        // 2. Snapshots always advance, stop or not.
        self.update_watch_snapshots(frame_key, locals);
        if let Some(name) = changed {
            if self.data_watch_should_stop(&name, locals, globals) {
                return BreakAction::Stop {
                    reason: StopReason::DataBreakpoint,
                    description: Some(format!("{name} changed")),
                };
            }
        }

        // 3. Line breakpoints.
        let path = normalize_path(filename);
        if let Some(record) = self
            .by_source
            .get_mut(&path)
            .and_then(|records| records.iter_mut().find(|record| record.line == line))
        {
            record.hit_count += 1;
            let hits = record.hit_count;
            let hit_ok = record
                .hit_condition
                .map(|hc| hc.matches(hits))
                .unwrap_or(true);
            if !hit_ok {
                return BreakAction::Continue;
            }
            if let Some(template) = record.log_message.clone() {
                return BreakAction::Log(format_log_message(&template, locals, globals));
            }
            if let Some(condition) = record.condition.clone() {
                match eval::evaluate_str(&condition, locals, globals) {
                    Ok(value) if !value.is_truthy() => return BreakAction::Continue,
                    // An unparsable or failing condition must not swallow
                    // the stop.
                    Ok(_) | Err(_) => {}
                }
            }
            return BreakAction::Stop { reason: StopReason::Breakpoint, description: None };
        }

        // 4. Stepping target / stop-on-entry.
        if step.step_hit {
            return BreakAction::Stop { reason: StopReason::Step, description: None };
        }
        if step.entry_hit {
            return BreakAction::Stop { reason: StopReason::Entry, description: None };
        }

        BreakAction::Continue
    }

    /// Resolve a call event against the function-breakpoint table.
    ///
    /// Candidate names follow the receiver rules: `f`, `module.f`,
    /// `Class.f` and `module.Class.f`, where `Class` comes from a `self`
    /// receiver in the callee's locals.
    pub fn resolve_call(
        &mut self,
        func_name: &str,
        module: &str,
        locals: &Namespace,
        globals: &Namespace,
    ) -> BreakAction {
        if self.function_breakpoints.is_empty() {
            return BreakAction::Continue;
        }
        let candidates = function_candidate_names(func_name, module, locals);
        let Some(record) = self
            .function_breakpoints
            .iter_mut()
            .find(|record| candidates.iter().any(|c| c == &record.name))
        else {
            return BreakAction::Continue;
        };

        record.hit_count += 1;
        let hits = record.hit_count;
        if let Some(hc) = record.hit_condition {
            if !hc.matches(hits) {
                return BreakAction::Continue;
            }
        }
        if let Some(condition) = record.condition.clone() {
            match eval::evaluate_str(&condition, locals, globals) {
                Ok(value) if !value.is_truthy() => return BreakAction::Continue,
                Ok(_) => {}
                Err(_) => return BreakAction::Continue,
            }
        }
        BreakAction::Stop {
            reason: StopReason::FunctionBreakpoint,
            description: Some(format!("function {func_name}")),
        }
    }

    fn check_data_watches(&self, frame_key: u64, locals: &Namespace) -> Option<String> {
        if self.data_watches.is_empty() {
            return None;
        }
        let prior = self.watch_snapshots.get(&frame_key);
        for watch in self.data_watches.values() {
            let Some(new_val) = locals.get(&watch.var_name) else {
                continue;
            };
            let old_val = prior
                .and_then(|snapshot| snapshot.get(&watch.var_name))
                .or_else(|| self.global_watch_values.get(&watch.var_name));
            if let Some(old_val) = old_val {
                if old_val != new_val {
                    return Some(watch.var_name.clone());
                }
            }
        }
        None
    }

    fn update_watch_snapshots(&mut self, frame_key: u64, locals: &Namespace) {
        if self.data_watches.is_empty() {
            return;
        }
        let mut snapshot = HashMap::new();
        for watch in self.data_watches.values() {
            if let Some(value) = locals.get(&watch.var_name) {
                snapshot.insert(watch.var_name.clone(), value.clone());
                self.global_watch_values
                    .insert(watch.var_name.clone(), value.clone());
            }
        }
        self.watch_snapshots.insert(frame_key, snapshot);
    }

    fn data_watch_should_stop(
        &mut self,
        changed_name: &str,
        locals: &Namespace,
        globals: &Namespace,
    ) -> bool {
        let mut any_meta = false;
        let mut conditions: Vec<(Option<HitCondition>, Option<String>, u64)> = Vec::new();
        for watch in self.data_watches.values_mut() {
            if watch.var_name != changed_name {
                continue;
            }
            any_meta = true;
            watch.hit_count += 1;
            conditions.push((watch.hit_condition, watch.condition.clone(), watch.hit_count));
        }
        if !any_meta {
            return false;
        }
        for (hit_condition, condition, hits) in conditions {
            if let Some(hc) = hit_condition {
                if !hc.matches(hits) {
                    continue;
                }
            }
            if let Some(expr) = condition {
                match eval::evaluate_str(&expr, locals, globals) {
                    Ok(value) if value.is_truthy() => {}
                    _ => continue,
                }
            }
            return true;
        }
        false
    }
}

/// Synthesise a `dataId` for `dataBreakpointInfo`.
pub fn make_data_id(frame_id: i64, name: &str) -> String {
    format!("frame:{frame_id}:var:{name}")
}

/// Parse `frame:{fid}:var:{name}`; a bare name is accepted as a watch on
/// that variable in any frame.
fn parse_data_id(data_id: &str) -> Option<(Option<i64>, String)> {
    let parts: Vec<&str> = data_id.splitn(4, ':').collect();
    if parts.len() == 4 && parts[0] == "frame" && parts[2] == "var" {
        let frame_id = parts[1].parse::<i64>().ok();
        if parts[3].is_empty() {
            return None;
        }
        return Some((frame_id, parts[3].to_string()));
    }
    if data_id.is_empty() || data_id.contains(':') {
        return None;
    }
    Some((None, data_id.to_string()))
}

static LOG_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}|\{([^{}]+)\}").expect("infallible"));

/// Render a `logMessage` template: `{expr}` evaluates against
/// locals ∪ globals, `{{literal}}` yields literal braces, evaluation
/// errors substitute `<error>`.
pub fn format_log_message(template: &str, locals: &Namespace, globals: &Namespace) -> String {
    LOG_TEMPLATE
        .replace_all(template, |caps: &regex::Captures| {
            if let Some(literal) = caps.get(1) {
                return format!("{{{}}}", literal.as_str());
            }
            let expr = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            match eval::evaluate_str(expr, locals, globals) {
                Ok(value) => value.to_string(),
                Err(_) => "<error>".to_string(),
            }
        })
        .into_owned()
}

fn function_candidate_names(func_name: &str, module: &str, locals: &Namespace) -> Vec<String> {
    let mut names = vec![func_name.to_string()];
    if !module.is_empty() {
        names.push(format!("{module}.{func_name}"));
    }
    if let Some(Value::Object { class, .. }) = locals.get("self") {
        names.push(format!("{class}.{func_name}"));
        if !module.is_empty() {
            names.push(format!("{module}.{class}.{func_name}"));
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(pairs: &[(&str, Value)]) -> Namespace {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hit_condition_grammar() {
        assert_eq!(HitCondition::parse("10"), HitCondition::Equal(10));
        assert_eq!(HitCondition::parse(" == 3"), HitCondition::Equal(3));
        assert_eq!(HitCondition::parse(">= 5"), HitCondition::AtLeast(5));
        assert_eq!(HitCondition::parse("% 3"), HitCondition::EveryN(3));
        assert_eq!(HitCondition::parse("%3"), HitCondition::EveryN(3));
        assert_eq!(HitCondition::parse("whenever"), HitCondition::Always);
    }

    #[test]
    fn test_hit_condition_evaluation() {
        let every3 = HitCondition::EveryN(3);
        let fired: Vec<u64> = (1..=7).filter(|k| every3.matches(*k)).collect();
        assert_eq!(fired, vec![3, 6]);
        assert!(HitCondition::AtLeast(2).matches(2));
        assert!(!HitCondition::AtLeast(2).matches(1));
        assert!(HitCondition::Equal(4).matches(4));
        assert!(!HitCondition::EveryN(0).matches(0));
        assert!(HitCondition::Always.matches(1));
    }

    #[test]
    fn test_log_message_template() {
        let locals = ns(&[("x", Value::Int(10)), ("y", Value::Int(20))]);
        let globals = Namespace::new();
        assert_eq!(
            format_log_message("x={x}, y={y}", &locals, &globals),
            "x=10, y=20"
        );
        assert_eq!(
            format_log_message("{{literal}} and {x}", &locals, &globals),
            "{literal} and 10"
        );
        assert_eq!(format_log_message("{oops}", &locals, &globals), "<error>");
        assert_eq!(
            format_log_message("sum={x + y}", &locals, &globals),
            "sum=30"
        );
    }

    #[test]
    fn test_conditional_breakpoint_never_fires() {
        let mut engine = BreakpointEngine::new();
        engine.set_breakpoints(
            "/tmp/prog.scr",
            &[(10, Some("x > 100".to_string()), None, None)],
        );
        let locals = ns(&[("x", Value::Int(5))]);
        let globals = Namespace::new();
        let action = engine.resolve_line(
            "/tmp/prog.scr",
            10,
            1,
            &locals,
            &globals,
            StepContext::default(),
        );
        assert_eq!(action, BreakAction::Continue);
    }

    #[test]
    fn test_hit_condition_every_third() {
        let mut engine = BreakpointEngine::new();
        engine.set_breakpoints("/tmp/p.scr", &[(7, None, Some("% 3".to_string()), None)]);
        let locals = Namespace::new();
        let globals = Namespace::new();
        let mut stops = vec![];
        for k in 1..=7 {
            let action =
                engine.resolve_line("/tmp/p.scr", 7, 1, &locals, &globals, StepContext::default());
            if matches!(action, BreakAction::Stop { .. }) {
                stops.push(k);
            }
        }
        assert_eq!(stops, vec![3, 6]);
    }

    #[test]
    fn test_log_point_continues() {
        let mut engine = BreakpointEngine::new();
        engine.set_breakpoints(
            "/tmp/p.scr",
            &[(4, None, None, Some("x={x}, y={y}".to_string()))],
        );
        let locals = ns(&[("x", Value::Int(10)), ("y", Value::Int(20))]);
        let globals = Namespace::new();
        let action =
            engine.resolve_line("/tmp/p.scr", 4, 1, &locals, &globals, StepContext::default());
        assert_eq!(action, BreakAction::Log("x=10, y=20".to_string()));
    }

    #[test]
    fn test_full_replace_per_source() {
        let mut engine = BreakpointEngine::new();
        engine.set_breakpoints("/tmp/p.scr", &[(1, None, None, None), (2, None, None, None)]);
        engine.set_breakpoints("/tmp/p.scr", &[(9, None, None, None)]);
        let lines = engine.lines_for("/tmp/p.scr");
        assert_eq!(lines, vec![9]);
        engine.set_breakpoints("/tmp/p.scr", &[]);
        assert!(engine.lines_for("/tmp/p.scr").is_empty());
    }

    #[test]
    fn test_data_watch_change_detection() {
        let mut engine = BreakpointEngine::new();
        let verified =
            engine.set_data_breakpoints(&[("frame:1:var:count".to_string(), None, None)]);
        assert_eq!(verified, vec![true]);

        let globals = Namespace::new();
        // First observation: snapshot only, no stop.
        let locals = ns(&[("count", Value::Int(1))]);
        let action =
            engine.resolve_line("/tmp/p.scr", 3, 7, &locals, &globals, StepContext::default());
        assert_eq!(action, BreakAction::Continue);
        // Changed value stops with reason "data breakpoint".
        let locals = ns(&[("count", Value::Int(2))]);
        let action =
            engine.resolve_line("/tmp/p.scr", 4, 7, &locals, &globals, StepContext::default());
        assert_eq!(
            action,
            BreakAction::Stop {
                reason: StopReason::DataBreakpoint,
                description: Some("count changed".to_string()),
            }
        );
    }

    #[test]
    fn test_bad_data_id_not_verified() {
        let mut engine = BreakpointEngine::new();
        let verified = engine.set_data_breakpoints(&[
            ("frame:1:var:x".to_string(), None, None),
            ("bogus:token".to_string(), None, None),
        ]);
        assert_eq!(verified, vec![true, false]);
    }

    #[test]
    fn test_function_breakpoint_candidates() {
        let mut engine = BreakpointEngine::new();
        engine.set_function_breakpoints(&[("prog.add".to_string(), None, None)]);
        let globals = Namespace::new();
        let action = engine.resolve_call("add", "prog", &Namespace::new(), &globals);
        assert!(matches!(action, BreakAction::Stop { .. }));
        let action = engine.resolve_call("sub", "prog", &Namespace::new(), &globals);
        assert_eq!(action, BreakAction::Continue);
    }

    #[test]
    fn test_step_and_entry_reasons() {
        let mut engine = BreakpointEngine::new();
        let locals = Namespace::new();
        let globals = Namespace::new();
        let action = engine.resolve_line(
            "/tmp/p.scr",
            1,
            1,
            &locals,
            &globals,
            StepContext { step_hit: true, entry_hit: false },
        );
        assert_eq!(
            action,
            BreakAction::Stop { reason: StopReason::Step, description: None }
        );
        let action = engine.resolve_line(
            "/tmp/p.scr",
            1,
            1,
            &locals,
            &globals,
            StepContext { step_hit: false, entry_hit: true },
        );
        assert_eq!(
            action,
            BreakAction::Stop { reason: StopReason::Entry, description: None }
        );
    }
}
