use std::fmt;

use crate::error::DecompileError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Nop,
    Load,
    Store,
    /// Discards the top of the stack.
    Stack,
    Dup,
    BinaryOp,
    UnaryOp,
    BoolNegate,
    Call,
    KernelCall,
    Return,
    Jump,
    /// Branches when the popped condition equals `when`.
    CondJump { when: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub address: u32,
    pub opcode: u32,
    pub name: &'static str,
    pub size: u32,
    pub kind: InstKind,
    pub operands: Vec<Value>,
    pub stack_change: i32,
    pub codegen: &'static str,
}

impl Instr {
    /// The disassembler rejects instructions ending past `u32::MAX`; hand-built ones saturate.
    pub fn next_address(&self) -> u32 {
        self.address.saturating_add(self.size)
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.kind, InstKind::Jump | InstKind::CondJump { .. })
    }

    pub fn is_cond_jump(&self) -> bool {
        matches!(self.kind, InstKind::CondJump { .. })
    }

    pub fn is_uncond_jump(&self) -> bool {
        self.kind == InstKind::Jump
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, InstKind::Call | InstKind::KernelCall)
    }

    pub fn is_return(&self) -> bool {
        self.kind == InstKind::Return
    }

    pub fn is_stack_op(&self) -> bool {
        matches!(self.kind, InstKind::Stack | InstKind::Dup)
    }

    /// Ends the fallthrough path: nothing after it runs unless jumped to.
    pub fn ends_flow(&self) -> bool {
        self.is_uncond_jump() || self.is_return()
    }

    pub fn dest_address(&self) -> Result<u32, DecompileError> {
        self.operands
            .iter()
            .find_map(|op| match op {
                Value::Address(_) | Value::RelAddress { .. } => op.as_u32(),
                _ => None,
            })
            .ok_or(DecompileError::UnknownJumpTargetType {
                address: self.address,
                name: self.name,
            })
    }

    pub fn operand(&self, idx: usize) -> Result<&Value, DecompileError> {
        self.operands.get(idx).ok_or_else(|| {
            DecompileError::Internal(format!(
                "{} at 0x{:04x} has no operand {idx}",
                self.name, self.address
            ))
        })
    }

    pub fn operand_u32(&self, idx: usize) -> Result<u32, DecompileError> {
        let op = self.operand(idx)?;
        op.as_u32().ok_or_else(|| {
            DecompileError::Internal(format!(
                "operand {idx} of {} at 0x{:04x} is not numeric: {op}",
                self.name, self.address
            ))
        })
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}  {:<14}", self.address, self.name)?;
        let ops: Vec<String> = self
            .operands
            .iter()
            .map(|op| match op {
                Value::RelAddress { .. } => format!("{op} ; 0x{:04x}", op.as_u32().unwrap_or(0)),
                _ => op.to_string(),
            })
            .collect();
        write!(f, "{}", ops.join(", "))
    }
}
