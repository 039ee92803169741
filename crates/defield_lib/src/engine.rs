use crate::codegen::{CodeLine, GenContext};
use crate::error::DecompileError;
use crate::function::Function;
use crate::instr::Instr;
use crate::opcode::OpcodeEntry;
use crate::syntax::Syntax;

/// Per-opcode semantic handler replayed against the simulated stack.
pub type Handler = fn(&mut GenContext<'_>, &Instr) -> Result<(), DecompileError>;

/// Order in which pushed arguments map onto operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgOrder {
    /// First pushed is the first argument.
    Fifo,
    /// Last pushed is the first argument.
    Lifo,
}

/// The per-game mapping plugged into the decompiler core.
pub trait Engine {
    fn name(&self) -> &'static str;

    fn opcode_table(&self) -> &'static [OpcodeEntry];

    /// Overrides the generic handler of the instruction's kind.
    fn handler(&self, _opcode: u32) -> Option<Handler> {
        None
    }

    fn binary_arg_order(&self) -> ArgOrder {
        ArgOrder::Fifo
    }

    fn call_arg_order(&self) -> ArgOrder {
        ArgOrder::Fifo
    }

    fn on_before_start_function(&self, func: &Function, syntax: &Syntax, out: &mut Vec<CodeLine>) {
        for line in func.metadata.lines() {
            out.push(CodeLine::plain(format!("{}{line}", syntax.comment)));
        }
    }

    fn on_start_function(&self, func: &Function, syntax: &Syntax, out: &mut Vec<CodeLine>) {
        out.push(CodeLine::open(syntax.function_header(&func.name, func.args)));
    }

    fn on_end_function(&self, _func: &Function, syntax: &Syntax, out: &mut Vec<CodeLine>) {
        out.push(CodeLine::close(syntax.function_end));
    }
}

/// Naming hooks consulted while generating code. Every method has a usable default.
pub trait Formatter {
    fn variable_name(&self, _bank: u32, _address: u32) -> Option<String> {
        None
    }

    fn entity_name(&self, raw: &str) -> String {
        raw.to_string()
    }

    fn animation_name(&self, id: u32, sub_id: u32) -> String {
        format!("anim_{id}_{sub_id}")
    }

    fn character_name(&self, id: u32) -> String {
        format!("character_{id}")
    }

    fn function_name(&self, _entity: &str, raw: &str) -> String {
        raw.to_string()
    }

    fn function_comment(&self, _entity: &str, _function: &str) -> String {
        String::new()
    }

    fn spawn_point_name(&self, map_id: u32, entity: &str, function: &str, address: u32) -> String {
        format!("{entity}_{function}_{map_id}_{address:04x}")
    }

    fn map_name(&self, map_id: u32) -> String {
        format!("map_{map_id}")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFormatter;

impl Formatter for DefaultFormatter {}
