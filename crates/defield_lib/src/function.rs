use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::Formatter;
use crate::error::DecompileError;
use crate::instr::Instr;

/// One row of an externally supplied function table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub entity: String,
    pub name: String,
    pub start: u32,
    pub end: Option<u32>,
    pub args: u32,
    pub returns: bool,
}

impl FunctionSpec {
    pub fn new(entity: impl Into<String>, name: impl Into<String>, start: u32) -> Self {
        Self {
            entity: entity.into(),
            name: name.into(),
            start,
            end: None,
            args: 0,
            returns: false,
        }
    }
}

/// A function resolved against the disassembled instruction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub entity: String,
    pub name: String,
    pub start: u32,
    pub end: u32,
    /// Index of the first instruction.
    pub entry: usize,
    pub instruction_count: usize,
    pub args: u32,
    pub returns: bool,
    pub metadata: String,
}

impl Function {
    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address < self.end
    }
}

fn parse_number(tok: &str) -> Option<u32> {
    match tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => tok.parse().ok(),
    }
}

/// Parses `entity function start [end] [args=N] [returns]` lines.
pub fn parse_function_table(text: &str) -> Result<Vec<FunctionSpec>, DecompileError> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let err = |message: String| DecompileError::FunctionTable { line: line_no, message };
        let toks: Vec<&str> = line.split_whitespace().collect();
        let [entity, name, start, rest @ ..] = toks.as_slice() else {
            return Err(err(format!("expected `entity function start`, got `{line}`")));
        };
        let start = parse_number(start).ok_or_else(|| err(format!("bad start address `{start}`")))?;
        let mut spec = FunctionSpec::new(*entity, *name, start);
        for tok in rest {
            if let Some(n) = tok.strip_prefix("args=") {
                spec.args = n.parse().map_err(|_| err(format!("bad argument count `{n}`")))?;
            } else if *tok == "returns" {
                spec.returns = true;
            } else if spec.end.is_none() {
                let end = parse_number(tok).ok_or_else(|| err(format!("bad end address `{tok}`")))?;
                spec.end = Some(end);
            } else {
                return Err(err(format!("unexpected `{tok}`")));
            }
        }
        out.push(spec);
    }
    Ok(out)
}

/// Maps table rows onto instruction indices, filling in missing ends.
pub fn resolve_functions(
    script_name: &str,
    specs: &[FunctionSpec],
    instrs: &[Instr],
    formatter: &dyn Formatter,
) -> Result<Vec<Function>, DecompileError> {
    if instrs.is_empty() && specs.is_empty() {
        return Ok(Vec::new());
    }
    let script_end = instrs.last().map(Instr::next_address).unwrap_or(0);
    let script_start = instrs.first().map(|i| i.address).unwrap_or(0);
    let default_spec;
    let specs = if specs.is_empty() {
        default_spec = [FunctionSpec::new(script_name, "main", script_start)];
        &default_spec[..]
    } else {
        specs
    };

    let mut sorted: Vec<&FunctionSpec> = specs.iter().collect();
    sorted.sort_by_key(|s| s.start);

    let index_of: HashMap<u32, usize> =
        instrs.iter().enumerate().map(|(i, ins)| (ins.address, i)).collect();

    let mut out = Vec::with_capacity(sorted.len());
    for (i, spec) in sorted.iter().enumerate() {
        let next_start = sorted.get(i + 1).map(|s| s.start).unwrap_or(script_end);
        let end = spec.end.unwrap_or(next_start);
        // an empty span also catches two functions sharing a start
        if end > next_start || end <= spec.start {
            return Err(DecompileError::Internal(format!(
                "function {}::{} spans 0x{:04x}..0x{end:04x}, empty or overlapping its neighbours",
                spec.entity, spec.name, spec.start
            )));
        }
        let entry = *index_of.get(&spec.start).ok_or_else(|| {
            DecompileError::Internal(format!(
                "function {}::{} starts at 0x{:04x}, which is not an instruction",
                spec.entity, spec.name, spec.start
            ))
        })?;
        let instruction_count = instrs[entry..].iter().take_while(|ins| ins.address < end).count();
        let entity = formatter.entity_name(&spec.entity);
        let name = formatter.function_name(&entity, &spec.name);
        let metadata = formatter.function_comment(&entity, &name);
        out.push(Function {
            entity,
            name,
            start: spec.start,
            end,
            entry,
            instruction_count,
            args: spec.args,
            returns: spec.returns,
            metadata,
        });
    }
    Ok(out)
}
