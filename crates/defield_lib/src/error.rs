use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("truncated data at offset {pos} (wanted {wanted} bytes, {remaining} remaining)")]
    TruncatedData { pos: usize, wanted: usize, remaining: usize },

    #[error("unknown opcode 0x{opcode:02x} at 0x{address:04x}")]
    UnknownOpcode { address: u32, opcode: u32 },

    #[error("unknown sub-opcode 0x{opcode:02x} in {table} at 0x{address:04x}")]
    UnknownSubOpcode { address: u32, table: &'static str, opcode: u32 },

    #[error("unknown operand type '{code}' for {name} at 0x{address:04x}")]
    UnknownOperandType { address: u32, name: &'static str, code: char },

    #[error("unknown conditional operator {operator} at 0x{address:04x}")]
    UnknownConditionalOperator { address: u32, operator: u32 },

    #[error("unknown jump target type for {name} at 0x{address:04x}")]
    UnknownJumpTargetType { address: u32, name: &'static str },

    #[error("jump at 0x{address:04x} lands on 0x{target:04x}, which is not an instruction")]
    InvalidJumpTarget { address: u32, target: u32 },

    #[error("address 0x{base:08x} + {offset} does not fit in 32 bits")]
    AddressOverflow { base: u32, offset: usize },

    #[error("cannot negate {0}")]
    InvalidNegation(String),

    #[error("stack underflow at 0x{address:04x}")]
    StackUnderflow { address: u32 },

    #[error("function table line {line}: {message}")]
    FunctionTable { line: usize, message: String },

    #[error("internal decompiler error: {0}")]
    Internal(String),
}
