use crate::instr::InstKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpBase {
    Absolute,
    InstructionStart,
    InstructionEnd,
}

/// Which operand holds a jump destination and how to resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpSpec {
    pub operand: usize,
    pub base: JumpBase,
    pub backward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEffect {
    Fixed(i32),
    /// Pops as many values as the operand says, then pushes `push`.
    FromOperand { operand: usize, push: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeDef {
    pub opcode: u8,
    pub name: &'static str,
    pub kind: InstKind,
    /// One type code per operand, see the disassembler for the alphabet.
    pub operands: &'static str,
    pub stack: StackEffect,
    pub jump: Option<JumpSpec>,
    pub codegen: &'static str,
}

impl OpcodeDef {
    pub const fn new(
        opcode: u8,
        name: &'static str,
        kind: InstKind,
        operands: &'static str,
        stack: i32,
    ) -> Self {
        Self {
            opcode,
            name,
            kind,
            operands,
            stack: StackEffect::Fixed(stack),
            jump: None,
            codegen: "",
        }
    }

    pub const fn jump(mut self, operand: usize, base: JumpBase) -> Self {
        self.jump = Some(JumpSpec { operand, base, backward: false });
        self
    }

    pub const fn jump_back(mut self, operand: usize, base: JumpBase) -> Self {
        self.jump = Some(JumpSpec { operand, base, backward: true });
        self
    }

    pub const fn pops_operand(mut self, operand: usize, push: i32) -> Self {
        self.stack = StackEffect::FromOperand { operand, push };
        self
    }

    pub const fn codegen(mut self, codegen: &'static str) -> Self {
        self.codegen = codegen;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeEntry {
    Op(OpcodeDef),
    /// The next byte selects an entry in `table`.
    Sub {
        opcode: u8,
        name: &'static str,
        table: &'static [OpcodeEntry],
    },
}

impl OpcodeEntry {
    pub fn opcode(&self) -> u8 {
        match self {
            OpcodeEntry::Op(def) => def.opcode,
            OpcodeEntry::Sub { opcode, .. } => *opcode,
        }
    }

    pub fn lookup(table: &'static [OpcodeEntry], opcode: u8) -> Option<&'static OpcodeEntry> {
        table.iter().find(|e| e.opcode() == opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INNER: &[OpcodeEntry] =
        &[OpcodeEntry::Op(OpcodeDef::new(0x02, "INNER", InstKind::Nop, "", 0))];
    const TABLE: &[OpcodeEntry] = &[
        OpcodeEntry::Op(
            OpcodeDef::new(0x01, "JMP", InstKind::Jump, "w", 0).jump(0, JumpBase::Absolute),
        ),
        OpcodeEntry::Op(
            OpcodeDef::new(0x03, "CALL", InstKind::Call, "wB", 0).pops_operand(1, 1).codegen("r"),
        ),
        OpcodeEntry::Sub { opcode: 0x10, name: "EXT", table: INNER },
    ];

    #[test]
    fn builders_fill_in_table_entries() {
        let Some(OpcodeEntry::Op(jmp)) = OpcodeEntry::lookup(TABLE, 0x01) else {
            panic!("JMP missing");
        };
        assert_eq!(
            jmp.jump,
            Some(JumpSpec { operand: 0, base: JumpBase::Absolute, backward: false })
        );
        let Some(OpcodeEntry::Op(call)) = OpcodeEntry::lookup(TABLE, 0x03) else {
            panic!("CALL missing");
        };
        assert_eq!(call.stack, StackEffect::FromOperand { operand: 1, push: 1 });
        assert_eq!(call.codegen, "r");
    }

    #[test]
    fn lookup_finds_sub_tables() {
        assert!(matches!(
            OpcodeEntry::lookup(TABLE, 0x10),
            Some(OpcodeEntry::Sub { name: "EXT", .. })
        ));
        assert!(OpcodeEntry::lookup(TABLE, 0x02).is_none());
    }
}
