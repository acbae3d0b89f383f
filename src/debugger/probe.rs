//! Bytecode probe injection, the optional fast path for high-frequency
//! breakpoints.
//!
//! A rewrite inserts `LOAD_CONST line; CALL_PROBE; POP` at the first
//! instruction of each requested line. Before a rewritten unit may replace
//! the original it must pass the safety validator; rejected rewrites fall
//! back to the original unit and record a structured telemetry reason.

use std::collections::HashMap;

use crate::runtime::code::{decode, CodeUnit, Instr, Opcode};
use crate::runtime::Value;

/// Upper bound on how much the operand stack may grow through a rewrite.
const MAX_STACKSIZE_DELTA: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate `modified` against `original`: the instruction stream must be
/// fully decodable and the stack-size delta non-negative and bounded.
pub fn validate_code_unit(original: &CodeUnit, modified: &CodeUnit) -> ValidationResult {
    let mut errors = Vec::new();

    match decode(modified) {
        Ok(high_water) => {
            if modified.stack_size < high_water {
                errors.push(format!(
                    "declared stack size {} below simulated high water {high_water}",
                    modified.stack_size
                ));
            }
        }
        Err(err) => errors.push(format!("instruction stream not decodable: {err}")),
    }

    if modified.stack_size < original.stack_size {
        errors.push(format!(
            "stacksize decreased (original={}, modified={})",
            original.stack_size, modified.stack_size
        ));
    } else {
        let delta = modified.stack_size - original.stack_size;
        if delta > MAX_STACKSIZE_DELTA {
            errors.push(format!(
                "stacksize grew by {delta} which exceeds the maximum allowed delta of \
                 {MAX_STACKSIZE_DELTA} (original={}, modified={})",
                original.stack_size, modified.stack_size
            ));
        }
    }

    ValidationResult { valid: errors.is_empty(), errors }
}

type CacheKey = (String, String, u32, Vec<u32>);

/// Rewrites code units to carry per-line probes, with an eviction-free
/// cache keyed by `(source, name, first_line, sorted line set)`.
#[derive(Default)]
pub struct ProbeInjector {
    cache: HashMap<CacheKey, CodeUnit>,
}

impl ProbeInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject probes for `lines`. Returns `(accepted, unit)`; on any
    /// failure `accepted` is false and the unit is the original, unchanged.
    pub fn inject(&mut self, unit: &CodeUnit, lines: &[u32]) -> (bool, CodeUnit) {
        if lines.is_empty() {
            return (true, unit.clone());
        }

        let mut sorted: Vec<u32> = lines.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let key = (
            unit.source.clone(),
            unit.name.clone(),
            unit.first_line,
            sorted.clone(),
        );
        if let Some(cached) = self.cache.get(&key) {
            return (true, cached.clone());
        }

        let modified = rewrite(unit, &sorted);
        let result = validate_code_unit(unit, &modified);
        if !result.valid {
            log::warn!(
                target: "probe",
                "rewrite rejected for {}:{} ({}): {}",
                unit.source,
                unit.name,
                unit.first_line,
                result.errors.join("; ")
            );
            return (false, unit.clone());
        }

        self.cache.insert(key, modified.clone());
        (true, modified)
    }

    /// Drop every cached rewrite; invoked when breakpoint sets change.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn rewrite(unit: &CodeUnit, lines: &[u32]) -> CodeUnit {
    let mut modified = unit.clone();
    let mut instrs = Vec::with_capacity(unit.instrs.len() + lines.len() * 3);
    let mut injected: Vec<u32> = Vec::new();
    // Original instruction index -> index in the rewritten stream, with one
    // extra slot for jumps targeting the end of the stream.
    let mut mapping = vec![0u32; unit.instrs.len() + 1];
    // Which rewritten instructions came from the original stream.
    let mut from_original = Vec::with_capacity(unit.instrs.len() + lines.len() * 3);

    for (orig_idx, instr) in unit.instrs.iter().enumerate() {
        if lines.contains(&instr.line) && !injected.contains(&instr.line) {
            injected.push(instr.line);
            let const_idx = modified.add_const(Value::Int(instr.line as i64));
            instrs.push(Instr::new(Opcode::LoadConst, const_idx, instr.line));
            instrs.push(Instr::new(Opcode::CallProbe, 0, instr.line));
            instrs.push(Instr::new(Opcode::Pop, 0, instr.line));
            from_original.extend([false, false, false]);
        }
        mapping[orig_idx] = instrs.len() as u32;
        instrs.push(*instr);
        from_original.push(true);
    }
    mapping[unit.instrs.len()] = instrs.len() as u32;

    // Instruction indices shifted; retarget the original jumps.
    for (instr, original) in instrs.iter_mut().zip(&from_original) {
        if *original && matches!(instr.op, Opcode::Jump | Opcode::JumpIfFalse) {
            let target = instr.arg as usize;
            if target < mapping.len() {
                instr.arg = mapping[target];
            }
        }
    }

    // Probe sequences push the line constant before the call consumes it.
    modified.stack_size = unit.stack_size.max(1) + 1;
    modified.instrs = instrs;
    modified
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_lines() -> CodeUnit {
        let mut unit = CodeUnit::new("/tmp/p.scr", "<module>", 1);
        let one = unit.add_const(Value::Int(1));
        let x = unit.add_name("x");
        unit.instrs = vec![
            Instr::new(Opcode::LoadConst, one, 1),
            Instr::new(Opcode::StoreName, x, 1),
            Instr::new(Opcode::LoadName, x, 2),
            Instr::new(Opcode::Pop, 0, 2),
            Instr::new(Opcode::LoadName, x, 3),
            Instr::new(Opcode::Pop, 0, 3),
        ];
        unit.stack_size = 1;
        unit
    }

    #[test]
    fn test_probe_injection() {
        let unit = unit_with_lines();
        let mut injector = ProbeInjector::new();
        let (accepted, modified) = injector.inject(&unit, &[2]);
        assert!(accepted);
        assert!(modified.has_probe(2));
        assert!(!modified.has_probe(1));
        assert!(!modified.has_probe(3));
        // LOAD_CONST line; CALL probe; POP inserted before line 2's code.
        let probe_at = modified
            .instrs
            .iter()
            .position(|i| i.op == Opcode::CallProbe)
            .unwrap();
        assert_eq!(modified.instrs[probe_at - 1].op, Opcode::LoadConst);
        assert_eq!(modified.instrs[probe_at + 1].op, Opcode::Pop);
        assert_eq!(modified.instrs.len(), unit.instrs.len() + 3);
    }

    #[test]
    fn test_rewrite_is_decodable() {
        let unit = unit_with_lines();
        let mut injector = ProbeInjector::new();
        let (_, modified) = injector.inject(&unit, &[1, 2, 3]);
        assert!(decode(&modified).is_ok());
    }

    #[test]
    fn test_cache_hit_and_clear() {
        let unit = unit_with_lines();
        let mut injector = ProbeInjector::new();
        injector.inject(&unit, &[2]);
        assert_eq!(injector.cache_len(), 1);
        // Same line set (different order/duplicates) hits the same entry.
        injector.inject(&unit, &[2, 2]);
        assert_eq!(injector.cache_len(), 1);
        injector.inject(&unit, &[1, 2]);
        assert_eq!(injector.cache_len(), 2);
        injector.clear_cache();
        assert_eq!(injector.cache_len(), 0);
    }

    #[test]
    fn test_validator_rejects_corrupt_stream() {
        let unit = unit_with_lines();
        let mut corrupt = unit.clone();
        corrupt.instrs.push(Instr::new(Opcode::LoadConst, 99, 4));
        let result = validate_code_unit(&unit, &corrupt);
        assert!(!result.valid);
        assert!(result.errors[0].contains("not decodable"));
    }

    #[test]
    fn test_validator_rejects_shrunk_stack() {
        let unit = unit_with_lines();
        let mut shrunk = unit.clone();
        shrunk.stack_size = 0;
        let result = validate_code_unit(&unit, &shrunk);
        assert!(!result.valid);
    }

    #[test]
    fn test_validator_rejects_oversized_delta() {
        let unit = unit_with_lines();
        let mut grown = unit.clone();
        grown.stack_size = unit.stack_size + MAX_STACKSIZE_DELTA + 1;
        let result = validate_code_unit(&unit, &grown);
        assert!(!result.valid);
        assert!(result.errors[0].contains("exceeds the maximum"));
    }

    #[test]
    fn test_empty_line_set_is_identity() {
        let unit = unit_with_lines();
        let mut injector = ProbeInjector::new();
        let (accepted, same) = injector.inject(&unit, &[]);
        assert!(accepted);
        assert_eq!(same, unit);
        assert_eq!(injector.cache_len(), 0);
    }
}
