//! The scripted language front end and interpreter.
//!
//! Programs are line-oriented and indentation-blocked; every executed
//! statement reports a line event to the trace controller, function calls
//! report call/return events, and `raise` reports exception events. The
//! front end also lowers each function to a [`CodeUnit`] so the probe
//! injector has an instruction stream to rewrite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::debugger::error::Error;
use crate::debugger::eval::{self, Expr};
use crate::debugger::frame::{new_frame, FrameHandle};
use crate::debugger::tracer::{ResumeMode, TraceController};
use crate::runtime::code::{decode, CodeUnit, Instr, Opcode};
use crate::runtime::{Namespace, SharedNamespace, Value};

#[derive(Debug, Clone)]
pub enum Stmt {
    Assign { name: String, expr: Expr, line: u32 },
    GlobalAssign { name: String, expr: Expr, line: u32 },
    Print { expr: Expr, line: u32 },
    Call { name: String, args: Vec<Expr>, line: u32 },
    Repeat { count: Expr, body: Vec<Stmt>, line: u32 },
    While { cond: Expr, body: Vec<Stmt>, line: u32 },
    If { cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>, line: u32 },
    Try { body: Vec<Stmt>, handler: Vec<Stmt>, line: u32 },
    Raise { expr: Option<Expr>, line: u32 },
    Spawn { name: String, line: u32 },
    Pass { line: u32 },
}

impl Stmt {
    fn line(&self) -> u32 {
        match self {
            Stmt::Assign { line, .. }
            | Stmt::GlobalAssign { line, .. }
            | Stmt::Print { line, .. }
            | Stmt::Call { line, .. }
            | Stmt::Repeat { line, .. }
            | Stmt::While { line, .. }
            | Stmt::If { line, .. }
            | Stmt::Try { line, .. }
            | Stmt::Raise { line, .. }
            | Stmt::Spawn { line, .. }
            | Stmt::Pass { line } => *line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub first_line: u32,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub source: String,
    pub module: String,
    pub body: Vec<Stmt>,
    pub functions: HashMap<String, Function>,
}

// ----------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------

struct Line {
    number: u32,
    indent: usize,
    content: String,
}

/// Strip a trailing comment, honouring string literals.
fn strip_comment(raw: &str) -> &str {
    let mut in_string = false;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &raw[..idx],
            _ => {}
        }
    }
    raw
}

fn scan_lines(text: &str) -> Vec<Line> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let content = strip_comment(raw);
            let trimmed = content.trim_end();
            let stripped = trimmed.trim_start();
            if stripped.is_empty() {
                return None;
            }
            Some(Line {
                number: (idx + 1) as u32,
                indent: trimmed.len() - stripped.len(),
                content: stripped.to_string(),
            })
        })
        .collect()
}

/// Parse a program from source text. `path` is recorded as the source of
/// every frame and code unit.
pub fn parse_program(text: &str, path: &str) -> Result<Program, Error> {
    let lines = scan_lines(text);
    let mut pos = 0usize;
    let mut functions = HashMap::new();
    let body = parse_block(&lines, &mut pos, 0, &mut functions)?;
    let module = std::path::Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    Ok(Program { source: path.to_string(), module, body, functions })
}

fn parse_block(
    lines: &[Line],
    pos: &mut usize,
    indent: usize,
    functions: &mut HashMap<String, Function>,
) -> Result<Vec<Stmt>, Error> {
    let mut stmts = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            return Err(parse_err(line.number, "unexpected indent"));
        }
        let number = line.number;
        let content = line.content.clone();
        *pos += 1;

        if let Some(header) = content.strip_prefix("def ") {
            let header = header
                .strip_suffix(':')
                .ok_or_else(|| parse_err(number, "missing ':' after def header"))?;
            let mut parts = header.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| parse_err(number, "missing function name"))?
                .to_string();
            let params: Vec<String> = parts.map(str::to_string).collect();
            let body = parse_nested(lines, pos, indent, functions, number)?;
            functions.insert(
                name.clone(),
                Function { name, params, body, first_line: number },
            );
            continue;
        }

        if let Some(rest) = content.strip_prefix("repeat ") {
            let count_src = rest
                .strip_suffix(':')
                .ok_or_else(|| parse_err(number, "missing ':' after repeat"))?;
            let count = parse_expr(count_src, number)?;
            let body = parse_nested(lines, pos, indent, functions, number)?;
            stmts.push(Stmt::Repeat { count, body, line: number });
            continue;
        }

        if let Some(rest) = content.strip_prefix("while ") {
            let cond_src = rest
                .strip_suffix(':')
                .ok_or_else(|| parse_err(number, "missing ':' after while"))?;
            let cond = parse_expr(cond_src, number)?;
            let body = parse_nested(lines, pos, indent, functions, number)?;
            stmts.push(Stmt::While { cond, body, line: number });
            continue;
        }

        if let Some(rest) = content.strip_prefix("if ") {
            let cond_src = rest
                .strip_suffix(':')
                .ok_or_else(|| parse_err(number, "missing ':' after if"))?;
            let cond = parse_expr(cond_src, number)?;
            let then_body = parse_nested(lines, pos, indent, functions, number)?;
            let else_body = if *pos < lines.len()
                && lines[*pos].indent == indent
                && lines[*pos].content == "else:"
            {
                let else_line = lines[*pos].number;
                *pos += 1;
                parse_nested(lines, pos, indent, functions, else_line)?
            } else {
                Vec::new()
            };
            stmts.push(Stmt::If { cond, then_body, else_body, line: number });
            continue;
        }

        if content == "try:" {
            let body = parse_nested(lines, pos, indent, functions, number)?;
            if !(*pos < lines.len()
                && lines[*pos].indent == indent
                && lines[*pos].content == "except:")
            {
                return Err(parse_err(number, "try without except"));
            }
            let except_line = lines[*pos].number;
            *pos += 1;
            let handler = parse_nested(lines, pos, indent, functions, except_line)?;
            stmts.push(Stmt::Try { body, handler, line: number });
            continue;
        }

        stmts.push(parse_simple(&content, number)?);
    }
    Ok(stmts)
}

fn parse_nested(
    lines: &[Line],
    pos: &mut usize,
    indent: usize,
    functions: &mut HashMap<String, Function>,
    header_line: u32,
) -> Result<Vec<Stmt>, Error> {
    let Some(next) = lines.get(*pos) else {
        return Err(parse_err(header_line, "expected an indented block"));
    };
    if next.indent <= indent {
        return Err(parse_err(header_line, "expected an indented block"));
    }
    parse_block(lines, pos, next.indent, functions)
}

fn parse_simple(content: &str, number: u32) -> Result<Stmt, Error> {
    if content == "pass" {
        return Ok(Stmt::Pass { line: number });
    }
    if let Some(rest) = content.strip_prefix("print ") {
        return Ok(Stmt::Print { expr: parse_expr(rest, number)?, line: number });
    }
    if content == "raise" {
        return Ok(Stmt::Raise { expr: None, line: number });
    }
    if let Some(rest) = content.strip_prefix("raise ") {
        return Ok(Stmt::Raise { expr: Some(parse_expr(rest, number)?), line: number });
    }
    if let Some(rest) = content.strip_prefix("spawn ") {
        let name = rest.trim();
        if !is_identifier(name) {
            return Err(parse_err(number, "spawn expects a function name"));
        }
        return Ok(Stmt::Spawn { name: name.to_string(), line: number });
    }
    if let Some(rest) = content.strip_prefix("global ") {
        let (name, expr_src) = split_assignment(rest)
            .ok_or_else(|| parse_err(number, "global expects `name = expression`"))?;
        return Ok(Stmt::GlobalAssign {
            name,
            expr: parse_expr(expr_src, number)?,
            line: number,
        });
    }
    if let Some((name, expr_src)) = split_assignment(content) {
        return Ok(Stmt::Assign {
            name,
            expr: parse_expr(expr_src, number)?,
            line: number,
        });
    }

    // Bare call: `name` or `name arg, arg`.
    let (name, rest) = match content.split_once(' ') {
        Some((name, rest)) => (name, rest.trim()),
        None => (content, ""),
    };
    if !is_identifier(name) {
        return Err(parse_err(number, &format!("cannot parse statement `{content}`")));
    }
    let args = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',')
            .map(|arg| parse_expr(arg, number))
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(Stmt::Call { name: name.to_string(), args, line: number })
}

/// `name = expr` with a single `=` (not `==`).
fn split_assignment(content: &str) -> Option<(String, &str)> {
    let idx = content.find('=')?;
    if content.as_bytes().get(idx + 1) == Some(&b'=') {
        return None;
    }
    let name = content[..idx].trim();
    if !is_identifier(name) {
        return None;
    }
    Some((name.to_string(), content[idx + 1..].trim()))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_expr(src: &str, number: u32) -> Result<Expr, Error> {
    eval::parse(src).map_err(|err| parse_err(number, &err.to_string()))
}

fn parse_err(line: u32, message: &str) -> Error {
    Error::ScriptParse { line, message: message.to_string() }
}

// ----------------------------------------------------------------------
// Lowering to code units
// ----------------------------------------------------------------------

/// Lower the module body and every function to code units.
pub fn compile(program: &Program) -> Vec<CodeUnit> {
    let mut units = Vec::new();
    let module_first_line = program.body.first().map(Stmt::line).unwrap_or(1);
    units.push(lower_unit(&program.source, "<module>", module_first_line, &program.body));
    for function in program.functions.values() {
        units.push(lower_unit(
            &program.source,
            &function.name,
            function.first_line,
            &function.body,
        ));
    }
    units
}

fn lower_unit(source: &str, name: &str, first_line: u32, body: &[Stmt]) -> CodeUnit {
    let mut unit = CodeUnit::new(source, name, first_line);
    for stmt in body {
        lower_stmt(&mut unit, stmt);
    }
    unit.instrs.push(Instr::new(Opcode::Return, 0, unit.instrs.last().map(|i| i.line).unwrap_or(first_line)));
    unit.stack_size = decode(&unit).unwrap_or(0);
    unit
}

fn lower_stmt(unit: &mut CodeUnit, stmt: &Stmt) {
    let line = stmt.line();
    match stmt {
        Stmt::Assign { name, expr, .. } | Stmt::GlobalAssign { name, expr, .. } => {
            lower_expr(unit, expr, line);
            let idx = unit.add_name(name);
            unit.instrs.push(Instr::new(Opcode::StoreName, idx, line));
        }
        Stmt::Print { expr, .. } => {
            lower_expr(unit, expr, line);
            unit.instrs.push(Instr::new(Opcode::Pop, 0, line));
            let idx = unit.add_name("print");
            unit.instrs.push(Instr::new(Opcode::Call, idx, line));
            unit.instrs.push(Instr::new(Opcode::Pop, 0, line));
        }
        Stmt::Call { name, args, .. } => {
            for arg in args {
                lower_expr(unit, arg, line);
                unit.instrs.push(Instr::new(Opcode::Pop, 0, line));
            }
            let idx = unit.add_name(name);
            unit.instrs.push(Instr::new(Opcode::Call, idx, line));
            unit.instrs.push(Instr::new(Opcode::Pop, 0, line));
        }
        Stmt::Spawn { name, .. } => {
            let idx = unit.add_name(name);
            unit.instrs.push(Instr::new(Opcode::Call, idx, line));
            unit.instrs.push(Instr::new(Opcode::Pop, 0, line));
        }
        Stmt::Repeat { count, body, .. } => {
            lower_expr(unit, count, line);
            let check_at = unit.instrs.len();
            unit.instrs.push(Instr::new(Opcode::JumpIfFalse, 0, line));
            for inner in body {
                lower_stmt(unit, inner);
            }
            unit.instrs
                .push(Instr::new(Opcode::Jump, check_at as u32, line));
            let end = unit.instrs.len() as u32;
            unit.instrs[check_at].arg = end;
        }
        Stmt::While { cond, body, .. } => {
            let start = unit.instrs.len();
            lower_expr(unit, cond, line);
            let check_at = unit.instrs.len();
            unit.instrs.push(Instr::new(Opcode::JumpIfFalse, 0, line));
            for inner in body {
                lower_stmt(unit, inner);
            }
            unit.instrs.push(Instr::new(Opcode::Jump, start as u32, line));
            let end = unit.instrs.len() as u32;
            unit.instrs[check_at].arg = end;
        }
        Stmt::If { cond, then_body, else_body, .. } => {
            lower_expr(unit, cond, line);
            let check_at = unit.instrs.len();
            unit.instrs.push(Instr::new(Opcode::JumpIfFalse, 0, line));
            for inner in then_body {
                lower_stmt(unit, inner);
            }
            let jump_end_at = unit.instrs.len();
            unit.instrs.push(Instr::new(Opcode::Jump, 0, line));
            unit.instrs[check_at].arg = unit.instrs.len() as u32;
            for inner in else_body {
                lower_stmt(unit, inner);
            }
            let end = unit.instrs.len() as u32;
            unit.instrs[jump_end_at].arg = end;
        }
        Stmt::Try { body, handler, .. } => {
            for inner in body {
                lower_stmt(unit, inner);
            }
            for inner in handler {
                lower_stmt(unit, inner);
            }
        }
        Stmt::Raise { expr, .. } => {
            match expr {
                Some(expr) => lower_expr(unit, expr, line),
                None => {
                    let idx = unit.add_const(Value::None);
                    unit.instrs.push(Instr::new(Opcode::LoadConst, idx, line));
                }
            }
            unit.instrs.push(Instr::new(Opcode::Raise, 0, line));
        }
        Stmt::Pass { .. } => {
            unit.instrs.push(Instr::new(Opcode::Nop, 0, line));
        }
    }
}

fn lower_expr(unit: &mut CodeUnit, expr: &Expr, line: u32) {
    match expr {
        Expr::Literal(value) => {
            let idx = unit.add_const(value.clone());
            unit.instrs.push(Instr::new(Opcode::LoadConst, idx, line));
        }
        Expr::Name(name) => {
            let idx = unit.add_name(name);
            unit.instrs.push(Instr::new(Opcode::LoadName, idx, line));
        }
        Expr::Unary(_, inner) => {
            lower_expr(unit, inner, line);
        }
        Expr::Binary(_, lhs, rhs) => {
            lower_expr(unit, lhs, line);
            lower_expr(unit, rhs, line);
            unit.instrs.push(Instr::new(Opcode::BinaryOp, 0, line));
        }
        Expr::Index(target, index) => {
            lower_expr(unit, target, line);
            lower_expr(unit, index, line);
            unit.instrs.push(Instr::new(Opcode::BinaryOp, 1, line));
        }
        Expr::Field(target, field) => {
            lower_expr(unit, target, line);
            let idx = unit.add_const(Value::Str(field.clone()));
            unit.instrs.push(Instr::new(Opcode::LoadConst, idx, line));
            unit.instrs.push(Instr::new(Opcode::BinaryOp, 2, line));
        }
        Expr::ListDisplay(items) => {
            let empty = unit.add_const(Value::List(Vec::new()));
            unit.instrs.push(Instr::new(Opcode::LoadConst, empty, line));
            for item in items {
                lower_expr(unit, item, line);
                unit.instrs.push(Instr::new(Opcode::BinaryOp, 0, line));
            }
        }
        Expr::MapDisplay(entries) => {
            let empty = unit.add_const(Value::Map(Default::default()));
            unit.instrs.push(Instr::new(Opcode::LoadConst, empty, line));
            for (key, value) in entries {
                let key_idx = unit.add_const(Value::Str(key.clone()));
                unit.instrs.push(Instr::new(Opcode::LoadConst, key_idx, line));
                lower_expr(unit, value, line);
                unit.instrs.push(Instr::new(Opcode::BinaryOp, 0, line));
                unit.instrs.push(Instr::new(Opcode::BinaryOp, 0, line));
            }
        }
    }
}

// ----------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------

/// Control-flow signals raised during execution.
enum Signal {
    /// Session shutdown requested; unwind quietly.
    Terminate,
    /// Script exception carrying its message.
    Raise(String),
}

pub const MAIN_THREAD_ID: i64 = 1;

/// Runs a parsed program under a trace controller.
pub struct ScriptRuntime {
    program: Arc<Program>,
    controller: Arc<TraceController>,
    globals: SharedNamespace,
    next_thread_id: AtomicI64,
    no_debug: bool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptRuntime {
    pub fn new(program: Program, controller: Arc<TraceController>, no_debug: bool) -> Arc<Self> {
        let program = Arc::new(program);
        if !no_debug {
            for unit in compile(&program) {
                controller.register_code_unit(unit);
            }
        }
        Arc::new(ScriptRuntime {
            program,
            controller,
            globals: Arc::new(Mutex::new(Namespace::new())),
            next_thread_id: AtomicI64::new(MAIN_THREAD_ID + 1),
            no_debug,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Make the program's command-line arguments visible as the `argv`
    /// global.
    pub fn set_argv(&self, args: &[String]) {
        let argv = Value::List(args.iter().map(|a| Value::Str(a.clone())).collect());
        self.globals.lock().unwrap().insert("argv".to_string(), argv);
    }

    /// Execute the module body on the calling thread. Returns the exit code.
    pub fn run(self: &Arc<Self>) -> i32 {
        let frame = new_frame("<module>", &self.program.source, self.globals.clone());
        let tid = MAIN_THREAD_ID;
        if !self.no_debug {
            let mode = self
                .controller
                .on_call(tid, &frame, "<module>", &self.program.module);
            if matches!(mode, ResumeMode::Terminate) {
                return 0;
            }
        }
        let result = self.exec_block(tid, &frame, &self.program.body, 0);
        if !self.no_debug {
            self.controller.on_return(tid, &frame);
        }

        // Let spawned debuggee threads finish before reporting exit.
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        match result {
            Ok(()) => 0,
            Err(Signal::Terminate) => 0,
            Err(Signal::Raise(message)) => {
                self.controller
                    .on_output(format!("ScriptError: {message}\n"));
                1
            }
        }
    }

    fn exec_block(
        self: &Arc<Self>,
        tid: i64,
        frame: &FrameHandle,
        stmts: &[Stmt],
        try_depth: usize,
    ) -> Result<(), Signal> {
        for stmt in stmts {
            self.exec_stmt(tid, frame, stmt, try_depth)?;
        }
        Ok(())
    }

    fn exec_stmt(
        self: &Arc<Self>,
        tid: i64,
        frame: &FrameHandle,
        stmt: &Stmt,
        try_depth: usize,
    ) -> Result<(), Signal> {
        let line = stmt.line();
        frame.lock().unwrap().line = line;
        if !self.no_debug {
            if matches!(self.controller.on_line(tid, frame, line), ResumeMode::Terminate) {
                return Err(Signal::Terminate);
            }
        }
        if self.controller.is_terminated() && !self.no_debug {
            return Err(Signal::Terminate);
        }

        match stmt {
            Stmt::Assign { name, expr, .. } => {
                let value = self.eval_in(frame, expr, line)?;
                frame.lock().unwrap().locals.insert(name.clone(), value);
            }
            Stmt::GlobalAssign { name, expr, .. } => {
                let value = self.eval_in(frame, expr, line)?;
                self.globals.lock().unwrap().insert(name.clone(), value);
            }
            Stmt::Print { expr, .. } => {
                let value = self.eval_in(frame, expr, line)?;
                self.controller.on_output(format!("{value}\n"));
            }
            Stmt::Call { name, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_in(frame, arg, line)?);
                }
                self.call_function(tid, name, values, line, try_depth)?;
            }
            Stmt::Spawn { name, .. } => {
                self.spawn_function(name, line)?;
            }
            Stmt::Repeat { count, body, .. } => {
                let count = match self.eval_in(frame, count, line)? {
                    Value::Int(n) if n >= 0 => n,
                    other => {
                        return Err(self.raise(
                            tid,
                            frame,
                            format!("repeat expects a non-negative int, got {}", other.type_name()),
                            try_depth,
                        ))
                    }
                };
                for _ in 0..count {
                    self.exec_block(tid, frame, body, try_depth)?;
                }
            }
            Stmt::While { cond, body, .. } => {
                while self.eval_in(frame, cond, line)?.is_truthy() {
                    self.exec_block(tid, frame, body, try_depth)?;
                    if self.controller.is_terminated() && !self.no_debug {
                        return Err(Signal::Terminate);
                    }
                }
            }
            Stmt::If { cond, then_body, else_body, .. } => {
                if self.eval_in(frame, cond, line)?.is_truthy() {
                    self.exec_block(tid, frame, then_body, try_depth)?;
                } else {
                    self.exec_block(tid, frame, else_body, try_depth)?;
                }
            }
            Stmt::Try { body, handler, .. } => {
                match self.exec_block(tid, frame, body, try_depth + 1) {
                    Ok(()) => {}
                    Err(Signal::Terminate) => return Err(Signal::Terminate),
                    Err(Signal::Raise(_)) => {
                        self.exec_block(tid, frame, handler, try_depth)?;
                    }
                }
            }
            Stmt::Raise { expr, .. } => {
                let message = match expr {
                    Some(expr) => self.eval_in(frame, expr, line)?.to_string(),
                    None => "error".to_string(),
                };
                return Err(self.raise(tid, frame, message, try_depth));
            }
            Stmt::Pass { .. } => {}
        }
        Ok(())
    }

    fn raise(
        self: &Arc<Self>,
        tid: i64,
        frame: &FrameHandle,
        message: String,
        try_depth: usize,
    ) -> Signal {
        if !self.no_debug {
            let mode = self
                .controller
                .on_exception(tid, frame, &message, try_depth > 0);
            if matches!(mode, ResumeMode::Terminate) {
                return Signal::Terminate;
            }
        }
        Signal::Raise(message)
    }

    fn eval_in(&self, frame: &FrameHandle, expr: &Expr, line: u32) -> Result<Value, Signal> {
        let (locals, globals) = {
            let data = frame.lock().unwrap();
            let globals = data.globals.lock().unwrap().clone();
            (data.locals.clone(), globals)
        };
        eval::evaluate(expr, &locals, &globals).map_err(|err| {
            Signal::Raise(format!("line {line}: {err}"))
        })
    }

    fn call_function(
        self: &Arc<Self>,
        tid: i64,
        name: &str,
        args: Vec<Value>,
        line: u32,
        try_depth: usize,
    ) -> Result<(), Signal> {
        let Some(function) = self.program.functions.get(name) else {
            return Err(Signal::Raise(format!("line {line}: unknown function `{name}`")));
        };
        let frame = new_frame(&function.name, &self.program.source, self.globals.clone());
        {
            let mut data = frame.lock().unwrap();
            data.line = function.first_line;
            for (param, value) in function.params.iter().zip(args) {
                data.locals.insert(param.clone(), value);
            }
        }
        if !self.no_debug {
            let mode = self
                .controller
                .on_call(tid, &frame, &function.name, &self.program.module);
            if matches!(mode, ResumeMode::Terminate) {
                return Err(Signal::Terminate);
            }
        }
        let result = self.exec_block(tid, &frame, &function.body, try_depth);
        if !self.no_debug {
            self.controller.on_return(tid, &frame);
        }
        result
    }

    fn spawn_function(self: &Arc<Self>, name: &str, line: u32) -> Result<(), Signal> {
        if !self.program.functions.contains_key(name) {
            return Err(Signal::Raise(format!("line {line}: unknown function `{name}`")));
        }
        let tid = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        let runtime = self.clone();
        let name = name.to_string();
        let handle = std::thread::spawn(move || {
            let result = runtime.call_function(tid, &name, Vec::new(), line, 0);
            if let Err(Signal::Raise(message)) = result {
                runtime
                    .controller
                    .on_output(format!("ScriptError in thread {tid}: {message}\n"));
            }
            if !runtime.no_debug {
                runtime.controller.on_thread_exited(tid);
            }
        });
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::{DebugEvent, EventSink};
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelSink(Mutex<mpsc::Sender<DebugEvent>>);

    impl EventSink for ChannelSink {
        fn submit(&self, event: DebugEvent) {
            let _ = self.0.lock().unwrap().send(event);
        }
    }

    fn run_program(text: &str) -> (i32, Vec<DebugEvent>) {
        let controller = Arc::new(TraceController::new());
        let (tx, rx) = mpsc::channel();
        controller.install_sink(Arc::new(ChannelSink(Mutex::new(tx))));
        let program = parse_program(text, "/tmp/test_prog.scr").unwrap();
        let runtime = ScriptRuntime::new(program, controller, false);
        let code = runtime.run();
        let events: Vec<DebugEvent> = rx.try_iter().collect();
        (code, events)
    }

    fn outputs(events: &[DebugEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                DebugEvent::Output { output, .. } => Some(output.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_simple_program() {
        let (code, events) = run_program("x = 1\ny = x + 2\nprint y\n");
        assert_eq!(code, 0);
        assert_eq!(outputs(&events), vec!["3\n"]);
    }

    #[test]
    fn test_functions_and_globals() {
        let text = "global total = 0\n\
                    def add a b:\n    global total = total + a + b\n\
                    add 1, 2\nadd 10, 20\nprint total\n";
        let (code, events) = run_program(text);
        assert_eq!(code, 0);
        assert_eq!(outputs(&events), vec!["33\n"]);
    }

    #[test]
    fn test_repeat_and_if() {
        let text = "x = 0\n\
                    repeat 5:\n    x = x + 1\n\
                    if x == 5:\n    print \"five\"\nelse:\n    print \"other\"\n";
        let (_, events) = run_program(text);
        assert_eq!(outputs(&events), vec!["five\n"]);
    }

    #[test]
    fn test_caught_exception() {
        let text = "try:\n    raise \"boom\"\nexcept:\n    print \"handled\"\n";
        let (code, events) = run_program(text);
        assert_eq!(code, 0);
        assert_eq!(outputs(&events), vec!["handled\n"]);
    }

    #[test]
    fn test_uncaught_exception_exit_code() {
        let (code, events) = run_program("raise \"fatal\"\n");
        assert_eq!(code, 1);
        assert!(outputs(&events)
            .iter()
            .any(|line| line.contains("ScriptError: fatal")));
    }

    #[test]
    fn test_spawned_thread_events() {
        let text = "def work:\n    pass\nspawn work\npass\n";
        let (code, events) = run_program(text);
        assert_eq!(code, 0);
        let started: Vec<i64> = events
            .iter()
            .filter_map(|event| match event {
                DebugEvent::Thread { thread_id, reason: "started", .. } => Some(*thread_id),
                _ => None,
            })
            .collect();
        assert!(started.contains(&MAIN_THREAD_ID));
        assert!(started.iter().any(|id| *id > MAIN_THREAD_ID));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_program("x = 1\n???\n", "/tmp/p.scr").unwrap_err();
        match err {
            Error::ScriptParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_breakpoint_stop_in_program() {
        let controller = Arc::new(TraceController::new());
        let (tx, rx) = mpsc::channel();
        controller.install_sink(Arc::new(ChannelSink(Mutex::new(tx))));
        controller.set_breakpoints("/tmp/bp_prog.scr", &[(2, None, None, None)]);

        let program = parse_program("x = 1\nx = 2\nx = 3\n", "/tmp/bp_prog.scr").unwrap();
        let runtime = ScriptRuntime::new(program, controller.clone(), false);
        let worker = std::thread::spawn(move || runtime.run());

        let stopped = controller.wait_for_stop(Duration::from_secs(2));
        assert_eq!(stopped, Some(MAIN_THREAD_ID));
        let (frames, _) = controller.stack_trace(MAIN_THREAD_ID, 0, 0).unwrap();
        assert_eq!(frames[0]["line"], 2);

        controller
            .resume(MAIN_THREAD_ID, ResumeMode::Continue)
            .unwrap();
        assert_eq!(worker.join().unwrap(), 0);
        drop(rx);
    }

    #[test]
    fn test_compiled_units_cover_functions() {
        let program =
            parse_program("def f:\n    pass\nx = 1\n", "/tmp/c_prog.scr").unwrap();
        let units = compile(&program);
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert!(names.contains(&"<module>"));
        assert!(names.contains(&"f"));
        for unit in &units {
            assert!(decode(unit).is_ok());
        }
    }
}
