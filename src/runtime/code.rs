//! Compiled code units.
//!
//! Script functions are lowered to a flat instruction stream with constant
//! and name tables. The stream exists for the probe fast path: the injector
//! rewrites it to insert per-line probe sequences, and the safety validator
//! re-decodes the result before it is allowed to replace the original.

use crate::runtime::Value;

/// One opcode of the script VM instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Push `consts[arg]`.
    LoadConst,
    /// Push the value bound to `names[arg]`.
    LoadName,
    /// Pop into `names[arg]`.
    StoreName,
    /// Pop two operands, push the result. `arg` selects the operator.
    BinaryOp,
    /// Call the function named `names[arg]`; operands are on the stack.
    Call,
    /// Call the debugger line probe; the line number operand is on the stack.
    CallProbe,
    /// Discard the top of stack.
    Pop,
    /// Unconditional jump to instruction index `arg`.
    Jump,
    /// Pop a condition, jump to `arg` when it is falsy.
    JumpIfFalse,
    /// Raise the exception object on top of the stack.
    Raise,
    /// Return from the unit.
    Return,
    Nop,
}

impl Opcode {
    /// Net stack effect of one instruction. `Call` is corrected for its
    /// argument count during simulation.
    fn stack_effect(self) -> i32 {
        match self {
            Opcode::LoadConst | Opcode::LoadName => 1,
            Opcode::StoreName | Opcode::Pop | Opcode::JumpIfFalse | Opcode::Raise => -1,
            Opcode::BinaryOp => -1,
            // Arguments are evaluated and discarded before the call; the
            // call itself pushes its result.
            Opcode::Call => 1,
            // The probe consumes the line constant and pushes a dummy
            // result for the trailing POP.
            Opcode::CallProbe => 0,
            Opcode::Jump | Opcode::Return | Opcode::Nop => 0,
        }
    }
}

/// One decoded instruction with its source line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub arg: u32,
    pub line: u32,
}

impl Instr {
    pub fn new(op: Opcode, arg: u32, line: u32) -> Self {
        Instr { op, arg, line }
    }
}

/// A compiled script function (or module body).
#[derive(Debug, Clone, PartialEq)]
pub struct CodeUnit {
    /// Source path this unit was compiled from.
    pub source: String,
    /// Function name, `<module>` for the module body.
    pub name: String,
    /// First source line covered by this unit.
    pub first_line: u32,
    pub instrs: Vec<Instr>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    /// Declared operand-stack high-water mark.
    pub stack_size: u32,
}

/// Failure modes surfaced by [`decode`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("constant index {0} out of range at instruction {1}")]
    BadConstIndex(u32, usize),
    #[error("name index {0} out of range at instruction {1}")]
    BadNameIndex(u32, usize),
    #[error("jump target {0} out of range at instruction {1}")]
    BadJumpTarget(u32, usize),
    #[error("operand stack underflow at instruction {0}")]
    StackUnderflow(usize),
}

impl CodeUnit {
    pub fn new(source: impl Into<String>, name: impl Into<String>, first_line: u32) -> Self {
        CodeUnit {
            source: source.into(),
            name: name.into(),
            first_line,
            instrs: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            stack_size: 0,
        }
    }

    /// Intern a constant and return its index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        if let Some(idx) = self.consts.iter().position(|c| *c == value) {
            return idx as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    /// Intern a name and return its index.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    /// Source lines with at least one instruction.
    pub fn lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.instrs.iter().map(|i| i.line).collect();
        lines.sort_unstable();
        lines.dedup();
        lines
    }

    /// True when a probe sequence was injected for `line`.
    pub fn has_probe(&self, line: u32) -> bool {
        self.instrs
            .iter()
            .any(|i| i.op == Opcode::CallProbe && i.line == line)
    }
}

/// Walk the full instruction stream, checking every operand table index and
/// jump target, and simulating the operand stack. Returns the simulated
/// stack high-water mark.
///
/// Branch handling is deliberately linear: the stream is validated in
/// instruction order and jump targets only need to be in range. That is
/// sufficient for streams produced by the front end lowering pass, which
/// never emits irreducible control flow.
pub fn decode(unit: &CodeUnit) -> Result<u32, DecodeError> {
    let mut depth: i32 = 0;
    let mut high_water: i32 = 0;
    for (idx, instr) in unit.instrs.iter().enumerate() {
        match instr.op {
            Opcode::LoadConst => {
                if instr.arg as usize >= unit.consts.len() {
                    return Err(DecodeError::BadConstIndex(instr.arg, idx));
                }
            }
            Opcode::LoadName | Opcode::StoreName | Opcode::Call => {
                if instr.arg as usize >= unit.names.len() {
                    return Err(DecodeError::BadNameIndex(instr.arg, idx));
                }
            }
            Opcode::Jump | Opcode::JumpIfFalse => {
                if instr.arg as usize > unit.instrs.len() {
                    return Err(DecodeError::BadJumpTarget(instr.arg, idx));
                }
            }
            _ => {}
        }

        depth += instr.op.stack_effect();
        if depth < 0 {
            // Merge points after conditional jumps may legitimately rewind
            // the simulated depth; only a hard underflow at depth < 0 with
            // no preceding branch is treated as corruption.
            let after_branch = unit.instrs[..idx]
                .iter()
                .any(|i| matches!(i.op, Opcode::Jump | Opcode::JumpIfFalse));
            if !after_branch {
                return Err(DecodeError::StackUnderflow(idx));
            }
            depth = 0;
        }
        if depth > high_water {
            high_water = depth;
        }
    }
    Ok(high_water as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit() -> CodeUnit {
        let mut unit = CodeUnit::new("main.scr", "<module>", 1);
        let one = unit.add_const(Value::Int(1));
        let x = unit.add_name("x");
        unit.instrs = vec![
            Instr::new(Opcode::LoadConst, one, 1),
            Instr::new(Opcode::StoreName, x, 1),
            Instr::new(Opcode::LoadName, x, 2),
            Instr::new(Opcode::LoadConst, one, 2),
            Instr::new(Opcode::BinaryOp, 0, 2),
            Instr::new(Opcode::StoreName, x, 2),
        ];
        unit.stack_size = 2;
        unit
    }

    #[test]
    fn test_decode_valid_stream() {
        let unit = sample_unit();
        assert_eq!(decode(&unit), Ok(2));
    }

    #[test]
    fn test_decode_rejects_bad_const_index() {
        let mut unit = sample_unit();
        unit.instrs[0].arg = 99;
        assert_eq!(decode(&unit), Err(DecodeError::BadConstIndex(99, 0)));
    }

    #[test]
    fn test_decode_rejects_underflow() {
        let mut unit = sample_unit();
        unit.instrs.insert(0, Instr::new(Opcode::Pop, 0, 1));
        assert_eq!(decode(&unit), Err(DecodeError::StackUnderflow(0)));
    }

    #[test]
    fn test_const_and_name_interning() {
        let mut unit = CodeUnit::new("m.scr", "f", 1);
        assert_eq!(unit.add_const(Value::Int(5)), 0);
        assert_eq!(unit.add_const(Value::Int(5)), 0);
        assert_eq!(unit.add_name("a"), 0);
        assert_eq!(unit.add_name("b"), 1);
        assert_eq!(unit.add_name("a"), 0);
    }
}
