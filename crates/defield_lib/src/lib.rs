use std::fmt::Write as _;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub mod cfg;
pub mod codegen;
pub mod disasm;
pub mod engine;
pub mod engines;
pub mod error;
pub mod function;
pub mod instr;
pub mod opcode;
pub mod reader;
pub mod syntax;
pub mod value;

pub use cfg::{ControlFlow, GroupKind};
pub use codegen::{CodeGenerator, CodeLine, GenContext, render_lines};
pub use disasm::Disassembler;
pub use engine::{ArgOrder, DefaultFormatter, Engine, Formatter, Handler};
pub use error::DecompileError;
pub use function::{Function, FunctionSpec, parse_function_table};
pub use instr::{InstKind, Instr};
pub use syntax::{Syntax, SyntaxKind};
pub use value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Script,
    Disasm,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelMode {
    /// Only where a `goto` lands.
    Required,
    EveryGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub syntax: SyntaxKind,
    pub labels: LabelMode,
    /// Address of the first byte of the script.
    pub base_address: u32,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Script,
            syntax: SyntaxKind::Lua,
            labels: LabelMode::Required,
            base_address: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub functions: Vec<String>,
}

/// A line segment placed by a script, in world coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDescriptor {
    pub entity: String,
    pub function: String,
    pub point_a: [i16; 3],
    pub point_b: [i16; 3],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompiledScript {
    pub text: String,
    pub entities: Vec<EntityDescriptor>,
    pub lines: Vec<LineDescriptor>,
}

pub fn decompile(
    script_name: &str,
    bytes: &[u8],
    engine: &dyn Engine,
    formatter: &dyn Formatter,
    text_before: &str,
    text_after: &str,
) -> Result<DecompiledScript, DecompileError> {
    decompile_with_options(
        script_name,
        bytes,
        &[],
        engine,
        formatter,
        text_before,
        text_after,
        DecompileOptions::default(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn decompile_with_options(
    script_name: &str,
    bytes: &[u8],
    functions: &[FunctionSpec],
    engine: &dyn Engine,
    formatter: &dyn Formatter,
    text_before: &str,
    text_after: &str,
    options: DecompileOptions,
) -> Result<DecompiledScript, DecompileError> {
    let mut disasm = Disassembler::new(bytes, options.base_address, engine.opcode_table());
    disasm.disassemble()?;
    let instrs = disasm.into_instructions();
    let functions = function::resolve_functions(script_name, functions, &instrs, formatter)?;
    log::debug!(
        "{script_name}: {} instructions in {} functions ({} engine)",
        instrs.len(),
        functions.len(),
        engine.name()
    );

    let (body, entities, lines) = match options.mode {
        DecompileMode::Disasm => {
            (disasm_listing(&instrs, &functions), entities_of(&functions), Vec::new())
        }
        DecompileMode::Dot => {
            let cf = ControlFlow::build(&instrs, &functions)?;
            (dot_graph(script_name, &cf, &functions), entities_of(&functions), Vec::new())
        }
        DecompileMode::Script => {
            let cf = ControlFlow::build(&instrs, &functions)?;
            let syntax = options.syntax.syntax();
            let code = CodeGenerator::new(
                &instrs,
                &cf,
                &functions,
                engine,
                formatter,
                syntax,
                options.labels,
            )
            .generate()?;
            (render_lines(syntax, &code.lines)?, code.entities, code.descriptors)
        }
    };

    Ok(DecompiledScript {
        text: format!("{text_before}{body}{text_after}"),
        entities,
        lines,
    })
}

/// Entities in first-appearance order with their functions.
pub(crate) fn entities_of(functions: &[Function]) -> Vec<EntityDescriptor> {
    let mut out: Vec<EntityDescriptor> = Vec::new();
    for f in functions {
        match out.iter_mut().find(|e| e.name == f.entity) {
            Some(e) => e.functions.push(f.name.clone()),
            None => out.push(EntityDescriptor {
                name: f.entity.clone(),
                functions: vec![f.name.clone()],
            }),
        }
    }
    out
}

fn disasm_listing(instrs: &[Instr], functions: &[Function]) -> String {
    let mut out = String::new();
    for f in functions {
        let _ = writeln!(out, "; {}::{} 0x{:04x}..0x{:04x}", f.entity, f.name, f.start, f.end);
        for ins in &instrs[f.entry..f.entry + f.instruction_count] {
            let _ = writeln!(out, "{ins}");
        }
        out.push('\n');
    }
    out
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('<', "\\<")
        .replace('>', "\\>")
        .replace('{', "\\{")
        .replace('}', "\\}")
        .replace('|', "\\|")
}

fn dot_graph(script_name: &str, cf: &ControlFlow, functions: &[Function]) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph \"{}\" {{", escape_dot(script_name));
    dot.push_str("    node [shape=record, fontname=\"Courier\", fontsize=10];\n");

    for (idx, f) in functions.iter().enumerate() {
        let _ = writeln!(dot, "    subgraph cluster_{idx} {{");
        let title = format!("{}::{}", f.entity, f.name);
        let _ = writeln!(dot, "        label=\"{}\";", escape_dot(&title));
        for id in cf.function_groups(idx) {
            let g = cf.group(id);
            let mut fields = vec![
                format!("0x{:04x}..0x{:04x}", g.start_address, g.end_address),
                format!("{:?} level {}", g.kind, g.stack_level),
            ];
            if g.start_else {
                fields.push(if g.coalesced_else { "elseif".into() } else { "else".into() });
            }
            if !g.end_else.is_empty() {
                let ends = g
                    .end_else
                    .iter()
                    .map(|t| format!("0x{:04x}", cf.group(*t).start_address))
                    .join(" ");
                fields.push(format!("closes else {ends}"));
            }
            let label = fields.iter().map(|s| escape_dot(s)).join("|");
            let _ = writeln!(dot, "        g_{:04x} [label=\"{{{label}}}\"];", g.start_address);
        }
        dot.push_str("    }\n");
    }

    for id in cf.groups_in_order() {
        let from = cf.group(id).start_address;
        for (to, kind) in cf.successors(id) {
            let style = if kind.is_jump() { "dashed" } else { "solid" };
            let _ = writeln!(
                dot,
                "    g_{from:04x} -> g_{:04x} [style={style}];",
                cf.group(to).start_address
            );
        }
    }
    dot.push_str("}\n");
    dot
}
