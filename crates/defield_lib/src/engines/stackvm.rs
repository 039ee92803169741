//! Reference engine for a small 8-bit-opcode stack machine.
//!
//! Kernel services live behind the `KERNEL` prefix byte and a second `EXT`
//! prefix below it, so opcodes compose as `0x50xx` and `0x5010xx`.

use crate::codegen::GenContext;
use crate::engine::{Engine, Handler};
use crate::error::DecompileError;
use crate::instr::InstKind::*;
use crate::instr::Instr;
use crate::opcode::{JumpBase, OpcodeDef, OpcodeEntry};
use crate::value::Value;

/// Timer ticks per second of the `WAIT` kernel call.
pub const FRAMES_PER_SECOND: f64 = 30.0;

/// Comparison selected by the high three bits of `IFCMP`'s packed operand.
const COMPARISONS: [&str; 6] = ["==", "!=", "<", "<=", ">", ">="];

const IFCMP: u32 = 0x34;
const WAIT: u32 = 0x5001;
const ANIM: u32 = 0x5005;
const CHAR: u32 = 0x5006;
const MAPJUMP: u32 = 0x5007;
const LINE: u32 = 0x5008;

const fn binary(opcode: u8, name: &'static str, op: &'static str) -> OpcodeEntry {
    OpcodeEntry::Op(OpcodeDef::new(opcode, name, BinaryOp, "", -1).codegen(op))
}

const EXT: &[OpcodeEntry] = &[OpcodeEntry::Op(
    OpcodeDef::new(0x01, "SCREEN_SHAKE", KernelCall, "B", 0).codegen("screen_shake|i"),
)];

const KERNEL: &[OpcodeEntry] = &[
    OpcodeEntry::Op(OpcodeDef::new(0x01, "WAIT", KernelCall, "w", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x02, "MESSAGE", KernelCall, "B", -1).codegen("message|ip")),
    OpcodeEntry::Op(OpcodeDef::new(0x03, "RANDOM", KernelCall, "", 0).codegen("random|pr")),
    OpcodeEntry::Op(OpcodeDef::new(0x04, "SOUND", KernelCall, "", -2).codegen("play_sound|pp")),
    OpcodeEntry::Op(OpcodeDef::new(0x05, "ANIM", KernelCall, "BB", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x06, "CHAR", KernelCall, "B", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x07, "MAPJUMP", KernelCall, "ws", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x08, "LINE", KernelCall, "ssssss", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x09, "FLAGS", KernelCall, "N", 0).codegen("set_flags|ii")),
    OpcodeEntry::Sub {
        opcode: 0x10,
        name: "EXT",
        table: EXT,
    },
];

pub const OPCODES: &[OpcodeEntry] = &[
    OpcodeEntry::Op(OpcodeDef::new(0x00, "NOP", Nop, "", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x01, "PUSHB", Load, "b", 1)),
    OpcodeEntry::Op(OpcodeDef::new(0x02, "PUSHW", Load, "s", 1)),
    OpcodeEntry::Op(OpcodeDef::new(0x03, "PUSHD", Load, "i", 1)),
    OpcodeEntry::Op(OpcodeDef::new(0x04, "PUSHV", Load, "BB", 1).codegen("var")),
    OpcodeEntry::Op(OpcodeDef::new(0x05, "POPV", Store, "BB", -1)),
    OpcodeEntry::Op(OpcodeDef::new(0x08, "DUP", Dup, "", 1)),
    OpcodeEntry::Op(OpcodeDef::new(0x09, "POP", Stack, "", -1)),
    binary(0x10, "ADD", "+"),
    binary(0x11, "SUB", "-"),
    binary(0x12, "MUL", "*"),
    binary(0x13, "DIV", "/"),
    binary(0x14, "MOD", "%"),
    binary(0x15, "AND", "&"),
    binary(0x16, "OR", "|"),
    binary(0x17, "XOR", "^"),
    binary(0x18, "SHL", "<<"),
    binary(0x19, "SHR", ">>"),
    binary(0x1a, "EQ", "=="),
    binary(0x1b, "NE", "!="),
    binary(0x1c, "LT", "<"),
    binary(0x1d, "LE", "<="),
    binary(0x1e, "GT", ">"),
    binary(0x1f, "GE", ">="),
    binary(0x20, "LAND", "&&"),
    binary(0x21, "LOR", "||"),
    OpcodeEntry::Op(OpcodeDef::new(0x22, "NEG", UnaryOp, "", 0).codegen("-")),
    OpcodeEntry::Op(OpcodeDef::new(0x23, "BNOT", UnaryOp, "", 0).codegen("~")),
    OpcodeEntry::Op(OpcodeDef::new(0x24, "NOT", BoolNegate, "", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x30, "JMP", Jump, "w", 0).jump(0, JumpBase::Absolute)),
    OpcodeEntry::Op(
        OpcodeDef::new(0x31, "JMPF", CondJump { when: false }, "s", -1)
            .jump(0, JumpBase::InstructionEnd),
    ),
    OpcodeEntry::Op(
        OpcodeDef::new(0x32, "JMPT", CondJump { when: true }, "s", -1)
            .jump(0, JumpBase::InstructionEnd),
    ),
    OpcodeEntry::Op(
        OpcodeDef::new(0x33, "JMPB", Jump, "w", 0).jump_back(0, JumpBase::InstructionStart),
    ),
    OpcodeEntry::Op(
        OpcodeDef::new(0x34, "IFCMP", CondJump { when: false }, "BBUbw", 0)
            .jump(5, JumpBase::Absolute),
    ),
    OpcodeEntry::Op(OpcodeDef::new(0x40, "CALL", Call, "wB", 0).pops_operand(1, 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x41, "CALLR", Call, "wB", 0).pops_operand(1, 1).codegen("r")),
    OpcodeEntry::Op(OpcodeDef::new(0x48, "RET", Return, "", 0)),
    OpcodeEntry::Op(OpcodeDef::new(0x49, "RETV", Return, "", -1).codegen("v")),
    OpcodeEntry::Sub {
        opcode: 0x50,
        name: "KERNEL",
        table: KERNEL,
    },
];

#[derive(Debug, Default, Clone, Copy)]
pub struct StackVm;

impl Engine for StackVm {
    fn name(&self) -> &'static str {
        "stackvm"
    }

    fn opcode_table(&self) -> &'static [OpcodeEntry] {
        OPCODES
    }

    fn handler(&self, opcode: u32) -> Option<Handler> {
        match opcode {
            IFCMP => Some(compare_variable),
            WAIT => Some(wait),
            ANIM => Some(animation),
            CHAR => Some(character),
            MAPJUMP => Some(map_jump),
            LINE => Some(line),
            _ => None,
        }
    }
}

/// Pushes `var <op> immediate`; the generator pops it as the branch condition.
fn compare_variable(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let operator = ins.operand_u32(2)?;
    let op = COMPARISONS
        .get(operator as usize)
        .copied()
        .ok_or(DecompileError::UnknownConditionalOperator {
            address: ins.address,
            operator,
        })?;
    let var = ctx.variable(ins.operand_u32(0)?, ins.operand_u32(1)?);
    ctx.push(Value::binary(var, ins.operand(4)?.clone(), op));
    Ok(())
}

fn wait(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let seconds = ins.operand_u32(0)? as f64 / FRAMES_PER_SECOND;
    let call = Value::call("wait", vec![Value::raw(seconds.to_string())]);
    let text = ctx.render(&call);
    ctx.emit_statement(&text);
    Ok(())
}

fn animation(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let name = ctx.formatter().animation_name(ins.operand_u32(0)?, ins.operand_u32(1)?);
    let text = ctx.render(&Value::call("play_animation", vec![Value::string(name)]));
    ctx.emit_statement(&text);
    Ok(())
}

fn character(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let name = ctx.formatter().character_name(ins.operand_u32(0)?);
    let text = ctx.render(&Value::call("set_character", vec![Value::string(name)]));
    ctx.emit_statement(&text);
    Ok(())
}

fn map_jump(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let map_id = ins.operand_u32(0)?;
    let f = ctx.function();
    let formatter = ctx.formatter();
    let map = formatter.map_name(map_id);
    let spawn = formatter.spawn_point_name(map_id, &f.entity, &f.name, ins.address);
    let call = Value::call(
        "map_jump",
        vec![Value::string(map), Value::string(spawn), ins.operand(1)?.clone()],
    );
    let text = ctx.render(&call);
    ctx.emit_statement(&text);
    Ok(())
}

fn line(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let mut coords = [0i16; 6];
    for (i, c) in coords.iter_mut().enumerate() {
        *c = ins.operand_u32(i)? as i16;
    }
    let point_a = [coords[0], coords[1], coords[2]];
    let point_b = [coords[3], coords[4], coords[5]];
    ctx.record_line(point_a, point_b);
    let f = ctx.function();
    ctx.emit_comment(&format!("line {}::{} {point_a:?} -> {point_b:?}", f.entity, f.name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DefaultFormatter, Formatter};
    use crate::function::FunctionSpec;
    use crate::syntax::SyntaxKind;
    use crate::{DecompileOptions, DecompiledScript, decompile, decompile_with_options};

    fn lua(bytes: &[u8]) -> DecompiledScript {
        decompile("field", bytes, &StackVm, &DefaultFormatter, "", "").unwrap()
    }

    #[test]
    fn every_opcode_is_unique_per_table() {
        for table in [OPCODES, KERNEL, EXT] {
            let mut seen: Vec<u8> = table.iter().map(OpcodeEntry::opcode).collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), table.len());
        }
    }

    #[test]
    fn arithmetic_on_variables() {
        // var_1_2 = var_1_2 + 3
        let out = lua(&[0x04, 1, 2, 0x01, 3, 0x10, 0x05, 1, 2, 0x48]);
        assert!(out.text.contains("        var_1_2 = var_1_2 + 3\n"), "{}", out.text);
    }

    #[test]
    fn repeated_minus_signs_stay_apart() {
        // var_0_1 = -(-3)
        let bytes = [0x01, 0xfd, 0x22, 0x05, 0x00, 0x01, 0x48];
        assert!(lua(&bytes).text.contains("        var_0_1 = -(-3)\n"));
        let options = DecompileOptions {
            syntax: SyntaxKind::C,
            ..DecompileOptions::default()
        };
        let c =
            decompile_with_options("f", &bytes, &[], &StackVm, &DefaultFormatter, "", "", options)
                .unwrap();
        assert!(c.text.contains("        var_0_1 = -(-3);\n"), "{}", c.text);

        let twice = lua(&[0x04, 0x00, 0x02, 0x22, 0x22, 0x05, 0x00, 0x01, 0x48]);
        assert!(twice.text.contains("        var_0_1 = -(-var_0_2)\n"), "{}", twice.text);
    }

    #[test]
    fn compare_and_jump_becomes_an_if() {
        let bytes = [
            0x34, 0x00, 0x04, 0x40, 0x0a, 0x0c, 0x00, // if var_0_4 < 10
            0x01, 0x01, //                               push 1
            0x50, 0x02, 0x05, //                         message(5, 1)
            0x48,
        ];
        let out = lua(&bytes);
        assert!(
            out.text.contains("        if var_0_4 < 10 then\n            message(5, 1)\n        end\n        return\n"),
            "{}",
            out.text
        );
    }

    #[test]
    fn unmapped_comparison_is_reported() {
        let bytes = [0x34, 0x00, 0x04, 0xc0, 0x0a, 0x07, 0x00, 0x48];
        assert!(matches!(
            decompile("field", &bytes, &StackVm, &DefaultFormatter, "", ""),
            Err(DecompileError::UnknownConditionalOperator { address: 0, operator: 6 })
        ));
    }

    #[test]
    fn kernel_calls_go_through_the_formatter() {
        let bytes = [
            0x50, 0x01, 45, 0x00, //            wait 45 frames
            0x50, 0x05, 3, 1, //                animation
            0x50, 0x06, 7, //                   character
            0x50, 0x07, 116, 0x00, 0xff, 0xff, // map jump
            0x50, 0x10, 0x01, 4, //             nested screen shake
            0x50, 0x09, 0x21, //                packed flags
            0x48,
        ];
        let text = lua(&bytes).text;
        for expected in [
            "wait(1.5)",
            "play_animation(\"anim_3_1\")",
            "set_character(\"character_7\")",
            "map_jump(\"map_116\", \"field_main_116_000b\", -1)",
            "screen_shake(4)",
            "set_flags(2, 1)",
        ] {
            assert!(text.contains(expected), "missing {expected} in\n{text}");
        }
    }

    #[test]
    fn line_opcode_records_a_descriptor() {
        let mut bytes = vec![0x50, 0x08];
        for v in [1i16, -2, 3, 4, 5, -6] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0x48);
        let out = lua(&bytes);
        assert_eq!(out.lines.len(), 1);
        assert_eq!(out.lines[0].entity, "field");
        assert_eq!(out.lines[0].function, "main");
        assert_eq!(out.lines[0].point_a, [1, -2, 3]);
        assert_eq!(out.lines[0].point_b, [4, 5, -6]);
    }

    struct Named;

    impl Formatter for Named {
        fn variable_name(&self, bank: u32, address: u32) -> Option<String> {
            (bank == 0 && address == 1).then(|| "gold".to_string())
        }
    }

    #[test]
    fn script_calls_resolve_through_the_function_table() {
        let bytes = [
            0x01, 0x02, //             push 2
            0x41, 0x0a, 0x00, 0x01, // callr helper, 1 argument
            0x05, 0x00, 0x01, //       gold = ...
            0x48, //
            0x04, 0x09, 0x09, //       helper: push var_9_9
            0x49, //                   return it
        ];
        let mut helper = FunctionSpec::new("npc", "helper", 10);
        helper.returns = true;
        let specs = [FunctionSpec::new("npc", "main", 0), helper];
        let out = decompile_with_options(
            "field",
            &bytes,
            &specs,
            &StackVm,
            &Named,
            "",
            "",
            DecompileOptions::default(),
        )
        .unwrap();
        assert_eq!(
            out.text,
            "EntityContainer[\"npc\"] = {\n    main = function(self)\n        gold = helper(2)\n        return\n    end,\n    helper = function(self)\n        return var_9_9\n    end,\n}\n"
        );
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].functions, ["main", "helper"]);
    }

    #[test]
    fn c_syntax_terminates_statements() {
        let options = DecompileOptions {
            syntax: SyntaxKind::C,
            ..DecompileOptions::default()
        };
        let bytes = [0x01, 0x05, 0x09, 0x48];
        let out =
            decompile_with_options("f", &bytes, &[], &StackVm, &DefaultFormatter, "", "", options)
                .unwrap();
        assert_eq!(
            out.text,
            "/* entity f */ {\n    void main(void *self) {\n        return;\n    }\n}\n"
        );
    }
}
