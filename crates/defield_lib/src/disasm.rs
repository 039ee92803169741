use crate::error::DecompileError;
use crate::instr::Instr;
use crate::opcode::{JumpBase, OpcodeDef, OpcodeEntry, StackEffect};
use crate::reader::Reader;
use crate::value::Value;

/// Walks a script buffer with a declarative opcode table.
pub struct Disassembler<'a> {
    reader: Reader<'a>,
    base: u32,
    table: &'static [OpcodeEntry],
    instrs: Vec<Instr>,
}

impl<'a> Disassembler<'a> {
    pub fn new(bytes: &'a [u8], base: u32, table: &'static [OpcodeEntry]) -> Self {
        Self {
            reader: Reader::new(bytes),
            base,
            table,
            instrs: Vec::new(),
        }
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn into_instructions(self) -> Vec<Instr> {
        self.instrs
    }

    /// Decodes the whole buffer. Once instructions exist, later calls return them unchanged.
    pub fn disassemble(&mut self) -> Result<&[Instr], DecompileError> {
        if !self.instrs.is_empty() {
            return Ok(&self.instrs);
        }
        self.reader.seek(0)?;
        let mut out = Vec::new();
        while !self.reader.is_eof() {
            out.push(self.decode_one()?);
        }
        log::debug!("disassembled {} instructions", out.len());
        self.instrs = out;
        Ok(&self.instrs)
    }

    fn decode_one(&mut self) -> Result<Instr, DecompileError> {
        let start = self.reader.position();
        let address = offset_address(self.base, start)?;
        let (def, opcode) = self.resolve(address)?;

        let mut operands = Vec::with_capacity(def.operands.len());
        for code in def.operands.chars() {
            self.read_operand(code, def, address, &mut operands)?;
        }
        let size = self.reader.position() - start;
        let end = offset_address(address, size)?;
        let size = size as u32;

        if let Some(jump) = def.jump {
            let raw = operands.get(jump.operand).and_then(Value::as_i32).ok_or(
                DecompileError::UnknownJumpTargetType {
                    address,
                    name: def.name,
                },
            )?;
            let offset = if jump.backward { raw.wrapping_neg() } else { raw };
            operands[jump.operand] = match jump.base {
                JumpBase::Absolute => Value::Address(raw as u32),
                JumpBase::InstructionStart => Value::RelAddress { base: address, offset },
                JumpBase::InstructionEnd => Value::RelAddress { base: end, offset },
            };
        }

        let stack_change = match def.stack {
            StackEffect::Fixed(n) => n,
            StackEffect::FromOperand { operand, push } => {
                let pops = operands.get(operand).and_then(Value::as_i32).ok_or_else(|| {
                    DecompileError::Internal(format!(
                        "{} at 0x{address:04x} has no pop count operand {operand}",
                        def.name
                    ))
                })?;
                push - pops
            }
        };

        Ok(Instr {
            address,
            opcode,
            name: def.name,
            size,
            kind: def.kind,
            operands,
            stack_change,
            codegen: def.codegen,
        })
    }

    fn resolve(&mut self, address: u32) -> Result<(&'static OpcodeDef, u32), DecompileError> {
        let mut table = self.table;
        let mut parent: Option<&'static str> = None;
        let mut opcode = 0u32;
        loop {
            let byte = self.reader.read_u8()?;
            opcode = (opcode << 8) | byte as u32;
            let entry = OpcodeEntry::lookup(table, byte).ok_or(match parent {
                None => DecompileError::UnknownOpcode {
                    address,
                    opcode: byte as u32,
                },
                Some(name) => DecompileError::UnknownSubOpcode {
                    address,
                    table: name,
                    opcode: byte as u32,
                },
            })?;
            match entry {
                OpcodeEntry::Op(def) => return Ok((def, opcode)),
                OpcodeEntry::Sub { name, table: sub, .. } => {
                    parent = Some(*name);
                    table = *sub;
                }
            }
        }
    }

    fn read_operand(
        &mut self,
        code: char,
        def: &OpcodeDef,
        address: u32,
        out: &mut Vec<Value>,
    ) -> Result<(), DecompileError> {
        let r = &mut self.reader;
        match code {
            'b' => out.push(Value::int(r.read_s8()? as i32)),
            'B' => out.push(Value::uint(r.read_u8()? as u32)),
            's' => out.push(Value::int(r.read_s16()? as i32)),
            'w' => out.push(Value::uint(r.read_u16()? as u32)),
            'i' => out.push(Value::int(r.read_s32()?)),
            'd' => out.push(Value::uint(r.read_u32()?)),
            'N' => {
                let b = r.read_u8()?;
                out.push(Value::uint((b >> 4) as u32));
                out.push(Value::uint((b & 0x0f) as u32));
            }
            'U' => {
                let b = r.read_u8()?;
                out.push(Value::uint((b >> 5) as u32));
                out.push(Value::uint((b & 0x1f) as u32));
            }
            _ => {
                return Err(DecompileError::UnknownOperandType {
                    address,
                    name: def.name,
                    code,
                });
            }
        }
        Ok(())
    }
}

/// `base + offset`, failing when the sum leaves the 32-bit address space.
fn offset_address(base: u32, offset: usize) -> Result<u32, DecompileError> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| base.checked_add(o))
        .ok_or(DecompileError::AddressOverflow { base, offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::InstKind;

    const EXT: &[OpcodeEntry] = &[
        OpcodeEntry::Op(OpcodeDef::new(0x01, "SHAKE", InstKind::KernelCall, "B", 0)),
        OpcodeEntry::Sub { opcode: 0x02, name: "EXT2", table: EXT2 },
    ];
    const EXT2: &[OpcodeEntry] =
        &[OpcodeEntry::Op(OpcodeDef::new(0x07, "DEEP", InstKind::Nop, "", 0))];
    const TABLE: &[OpcodeEntry] = &[
        OpcodeEntry::Op(OpcodeDef::new(0x00, "NOP", InstKind::Nop, "", 0)),
        OpcodeEntry::Op(OpcodeDef::new(0x01, "BYTES", InstKind::Nop, "BBB", 0)),
        OpcodeEntry::Op(OpcodeDef::new(0x02, "WIDE", InstKind::Load, "sdi", 1)),
        OpcodeEntry::Op(OpcodeDef::new(0x03, "PACKED", InstKind::Nop, "NU", 0)),
        OpcodeEntry::Op(
            OpcodeDef::new(0x04, "JMPB", InstKind::Jump, "w", 0)
                .jump_back(0, JumpBase::InstructionStart),
        ),
        OpcodeEntry::Op(
            OpcodeDef::new(0x05, "JMPF", InstKind::CondJump { when: false }, "b", -1)
                .jump(0, JumpBase::InstructionEnd),
        ),
        OpcodeEntry::Op(OpcodeDef::new(0x06, "CALL", InstKind::Call, "wB", 0).pops_operand(1, 1)),
        OpcodeEntry::Op(OpcodeDef::new(0x07, "BAD", InstKind::Nop, "x", 0)),
        OpcodeEntry::Sub { opcode: 0x10, name: "EXT", table: EXT },
    ];

    #[test]
    fn decodes_every_operand_width() {
        let bytes = [
            0x02, 0xfe, 0xff, 0x78, 0x56, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff, 0x03, 0xa5, 0xe3,
        ];
        let mut d = Disassembler::new(&bytes, 0, TABLE);
        let instrs = d.disassemble().unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(
            instrs[0].operands,
            vec![Value::int(-2), Value::uint(0x1234_5678), Value::int(-1)]
        );
        assert_eq!(instrs[0].size, 11);
        assert_eq!(instrs[1].address, 11);
        assert_eq!(
            instrs[1].operands,
            vec![Value::uint(0xa), Value::uint(0x5), Value::uint(0x7), Value::uint(0x3)]
        );
    }

    #[test]
    fn nested_tables_compose_the_opcode() {
        let bytes = [0x10, 0x01, 0x09, 0x10, 0x02, 0x07];
        let mut d = Disassembler::new(&bytes, 0x100, TABLE);
        let instrs = d.disassemble().unwrap();
        assert_eq!(instrs[0].opcode, 0x1001);
        assert_eq!(instrs[0].name, "SHAKE");
        assert_eq!(instrs[0].size, 3);
        assert_eq!(instrs[1].opcode, 0x10_02_07);
        assert_eq!(instrs[1].address, 0x103);
    }

    #[test]
    fn unknown_sub_opcode_names_its_table() {
        let mut d = Disassembler::new(&[0x00, 0x10, 0x02, 0x09], 0, TABLE);
        match d.disassemble() {
            Err(DecompileError::UnknownSubOpcode { address, table, opcode }) => {
                assert_eq!((address, table, opcode), (1, "EXT2", 9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_operand_code_is_fatal() {
        let mut d = Disassembler::new(&[0x07, 0x00], 0, TABLE);
        assert!(matches!(
            d.disassemble(),
            Err(DecompileError::UnknownOperandType { code: 'x', name: "BAD", .. })
        ));
        assert!(d.instructions().is_empty());
    }

    #[test]
    fn resolves_jump_bases() {
        // NOP; JMPF +1 (over the second NOP); NOP; JMPB 4 (back to the start)
        let bytes = [0x00, 0x05, 0x01, 0x00, 0x04, 0x04, 0x00];
        let mut d = Disassembler::new(&bytes, 0, TABLE);
        let instrs = d.disassemble().unwrap();
        assert_eq!(instrs[1].dest_address().unwrap(), 4);
        assert_eq!(instrs[3].dest_address().unwrap(), 0);
        assert_eq!(instrs[3].operands[0], Value::RelAddress { base: 4, offset: -4 });
    }

    #[test]
    fn call_stack_change_follows_argument_count() {
        let mut d = Disassembler::new(&[0x06, 0x20, 0x00, 0x03], 0, TABLE);
        let instrs = d.disassemble().unwrap();
        assert_eq!(instrs[0].stack_change, -2);
    }

    #[test]
    fn addresses_past_the_top_of_memory_are_rejected() {
        let mut d = Disassembler::new(&[0x00, 0x00], 0xffff_fffe, TABLE);
        assert!(matches!(
            d.disassemble(),
            Err(DecompileError::AddressOverflow { base: 0xffff_ffff, offset: 1 })
        ));

        let mut d = Disassembler::new(&[0x00], 0xffff_ffff, TABLE);
        assert!(matches!(d.disassemble(), Err(DecompileError::AddressOverflow { .. })));

        let mut d = Disassembler::new(&[0x00, 0x00], 0xffff_fffd, TABLE);
        let instrs = d.disassemble().unwrap();
        assert_eq!(instrs[1].next_address(), 0xffff_ffff);
    }

    #[test]
    fn truncated_operand_is_reported() {
        let mut d = Disassembler::new(&[0x01, 0x00], 0, TABLE);
        assert!(matches!(
            d.disassemble(),
            Err(DecompileError::TruncatedData { pos: 2, wanted: 1, remaining: 0 })
        ));
    }
}
