use std::fmt;

use crate::error::DecompileError;
use crate::syntax::{Syntax, UNARY_PRECEDENCE};

/// Expression node produced while replaying instructions against the simulated stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int { value: u32, signed: bool },
    Address(u32),
    RelAddress { base: u32, offset: i32 },
    Dup(u32),
    Str { text: String, quoted: bool },
    Var(String),
    Array { name: String, indices: Vec<Value> },
    Binary { lhs: Box<Value>, rhs: Box<Value>, op: &'static str },
    Unary { operand: Box<Value>, op: &'static str, postfix: bool },
    Negated(Box<Value>),
    Call { name: String, args: Vec<Value> },
}

const NEGATIONS: &[(&str, &str)] = &[
    ("==", "!="),
    ("!=", "=="),
    ("<", ">="),
    (">=", "<"),
    (">", "<="),
    ("<=", ">"),
];

impl Value {
    pub fn int(value: i32) -> Self {
        Value::Int { value: value as u32, signed: true }
    }

    pub fn uint(value: u32) -> Self {
        Value::Int { value, signed: false }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Value::Var(name.into())
    }

    pub fn string(text: impl Into<String>) -> Self {
        Value::Str { text: text.into(), quoted: true }
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Value::Str { text: text.into(), quoted: false }
    }

    pub fn binary(lhs: Value, rhs: Value, op: &'static str) -> Self {
        Value::Binary { lhs: Box::new(lhs), rhs: Box::new(rhs), op }
    }

    pub fn unary(operand: Value, op: &'static str) -> Self {
        Value::Unary { operand: Box::new(operand), op, postfix: false }
    }

    pub fn call(name: impl Into<String>, args: Vec<Value>) -> Self {
        Value::Call { name: name.into(), args }
    }

    /// Numeric value of an integer or address operand.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Int { value, .. } => Some(*value),
            Value::Address(a) => Some(*a),
            Value::RelAddress { base, offset } => Some(base.wrapping_add(*offset as u32)),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_u32().map(|v| v as i32)
    }

    /// Values that can be read twice without re-evaluating anything.
    pub fn is_simple(&self) -> bool {
        matches!(
            self,
            Value::Int { .. }
                | Value::Address(_)
                | Value::RelAddress { .. }
                | Value::Dup(_)
                | Value::Str { .. }
                | Value::Var(_)
        )
    }

    pub fn precedence(&self, syntax: &Syntax) -> u8 {
        match self {
            Value::Binary { op, .. } => syntax.precedence_of(op),
            Value::Unary { .. } | Value::Negated(_) => UNARY_PRECEDENCE,
            _ => 0,
        }
    }

    pub fn negate(self) -> Result<Value, DecompileError> {
        match self {
            Value::Address(_) | Value::RelAddress { .. } => {
                Err(DecompileError::InvalidNegation(self.to_string()))
            }
            Value::Negated(inner) => Ok(*inner),
            Value::Binary { lhs, rhs, op } => {
                if let Some((_, negated)) = NEGATIONS.iter().find(|(sym, _)| *sym == op) {
                    return Ok(Value::Binary { lhs, rhs, op: *negated });
                }
                match op {
                    "&&" => Ok(Value::binary((*lhs).negate()?, (*rhs).negate()?, "||")),
                    "||" => Ok(Value::binary((*lhs).negate()?, (*rhs).negate()?, "&&")),
                    _ => Ok(Value::Negated(Box::new(Value::Binary { lhs, rhs, op }))),
                }
            }
            other => Ok(Value::Negated(Box::new(other))),
        }
    }

    pub fn render(&self, syntax: &Syntax) -> String {
        match self {
            Value::Int { value, signed: true } => (*value as i32).to_string(),
            Value::Int { value, signed: false } => value.to_string(),
            Value::Address(a) => format!("0x{a:04x}"),
            Value::RelAddress { offset, .. } => format!("{offset:+}"),
            Value::Dup(idx) => format!("temp{idx}"),
            Value::Str { text, quoted: true } => {
                format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Value::Str { text, quoted: false } => text.clone(),
            Value::Var(name) => name.clone(),
            Value::Array { name, indices } => {
                let mut out = name.clone();
                for idx in indices {
                    out.push_str(&format!("[{}]", idx.render(syntax)));
                }
                out
            }
            Value::Binary { lhs, rhs, op } => {
                let prec = syntax.precedence_of(op);
                let l = lhs.render(syntax);
                let r = rhs.render(syntax);
                let l = if lhs.precedence(syntax) > prec { format!("({l})") } else { l };
                let r = if rhs.precedence(syntax) >= prec { format!("({r})") } else { r };
                format!("{l} {} {r}", syntax.operator(op))
            }
            Value::Unary { operand, op, postfix } => {
                let op = syntax.operator(op);
                if *postfix {
                    format!("{}{op}", operand.render_operand(syntax, ""))
                } else if is_word(op) {
                    format!("{op} {}", operand.render_operand(syntax, ""))
                } else {
                    format!("{op}{}", operand.render_operand(syntax, op))
                }
            }
            Value::Negated(operand) => match syntax.operator("!") {
                op if is_word(op) => format!("{op} {}", operand.render_operand(syntax, "")),
                op => format!("{op}{}", operand.render_operand(syntax, op)),
            },
            Value::Call { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.render(syntax)).collect();
                format!("{name}({})", args.join(syntax.arg_separator))
            }
        }
    }

    /// Renders the operand of a unary operator. Operands looser than any unary operator, or whose
    /// text would fuse with the prefix `op` (`-` and `-3` into `--3`), get parentheses.
    fn render_operand(&self, syntax: &Syntax, op: &str) -> String {
        let text = self.render(syntax);
        let fuses = op.chars().last().is_some_and(|c| text.starts_with(c));
        if fuses || self.precedence(syntax) > UNARY_PRECEDENCE {
            format!("({text})")
        } else {
            text
        }
    }
}

fn is_word(op: &str) -> bool {
    op.chars().all(|c| c.is_ascii_alphabetic())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(&Syntax::C))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> Value {
        Value::var("a")
    }

    fn b() -> Value {
        Value::var("b")
    }

    #[test]
    fn looser_left_operand_is_parenthesized() {
        let sum = Value::binary(a(), b(), "+");
        let product = Value::binary(sum.clone(), Value::int(2), "*");
        assert_eq!(product.to_string(), "(a + b) * 2");

        let shift = Value::binary(a(), b(), "<<");
        assert_eq!(Value::binary(shift, Value::int(1), "+").to_string(), "(a << b) + 1");

        let tighter = Value::binary(Value::binary(a(), b(), "*"), Value::int(1), "+");
        assert_eq!(tighter.to_string(), "a * b + 1");

        let equal = Value::binary(Value::binary(a(), b(), "-"), Value::int(1), "+");
        assert_eq!(equal.to_string(), "a - b + 1");
    }

    #[test]
    fn equal_precedence_on_the_right_is_parenthesized() {
        let v = Value::binary(a(), Value::binary(b(), Value::int(1), "-"), "-");
        assert_eq!(v.to_string(), "a - (b - 1)");
    }

    #[test]
    fn lua_rendering_spells_operators() {
        let cond = Value::binary(
            Value::binary(a(), Value::int(1), "!="),
            Value::Negated(Box::new(b())),
            "&&",
        );
        assert_eq!(cond.render(&Syntax::LUA), "a ~= 1 and not b");
        assert_eq!(cond.render(&Syntax::C), "a != 1 && !b");

        let masked = Value::binary(Value::binary(a(), Value::int(3), "&"), Value::int(0), "==");
        assert_eq!(masked.render(&Syntax::LUA), "a & 3 == 0");
        assert_eq!(masked.render(&Syntax::C), "(a & 3) == 0");
    }

    #[test]
    fn comparisons_negate_by_symbol() {
        let lt = Value::binary(a(), b(), "<");
        let ge = lt.clone().negate().unwrap();
        assert_eq!(ge.to_string(), "a >= b");
        assert_eq!(ge.negate().unwrap(), lt);
    }

    #[test]
    fn double_negation_collapses() {
        for v in [
            a(),
            Value::binary(a(), b(), "=="),
            Value::binary(a(), b(), "+"),
            Value::call("f", vec![a()]),
            Value::Negated(Box::new(a())),
            Value::binary(Value::binary(a(), b(), ">"), b(), "||"),
        ] {
            assert_eq!(v.clone().negate().unwrap().negate().unwrap(), v);
        }
    }

    #[test]
    fn literals_negate_by_wrapping() {
        let once = Value::int(1).negate().unwrap();
        assert_eq!(once, Value::Negated(Box::new(Value::int(1))));
        assert_eq!(once.render(&Syntax::LUA), "not 1");
    }

    #[test]
    fn logical_negation_applies_de_morgan() {
        let v = Value::binary(Value::binary(a(), Value::int(1), "=="), b(), "&&");
        assert_eq!(v.negate().unwrap().to_string(), "a != 1 || !b");
    }

    #[test]
    fn addresses_cannot_be_negated() {
        assert!(matches!(Value::Address(4).negate(), Err(DecompileError::InvalidNegation(_))));
        let rel = Value::RelAddress { base: 0x10, offset: -4 };
        assert_eq!(rel.as_u32(), Some(0x0c));
        assert_eq!(rel.to_string(), "-4");
        assert!(rel.negate().is_err());
    }

    #[test]
    fn prefix_operators_never_fuse_with_their_operand() {
        let minus_three = Value::unary(Value::int(-3), "-");
        assert_eq!(minus_three.render(&Syntax::LUA), "-(-3)");
        assert_eq!(minus_three.render(&Syntax::C), "-(-3)");

        let twice = Value::unary(Value::unary(a(), "-"), "-");
        assert_eq!(twice.render(&Syntax::LUA), "-(-a)");
        assert_eq!(Value::unary(Value::unary(a(), "~"), "-").to_string(), "-~a");
        assert_eq!(Value::unary(Value::int(3), "-").to_string(), "-3");

        let not_negative = Value::Negated(Box::new(Value::unary(a(), "-")));
        assert_eq!(not_negative.render(&Syntax::C), "!-a");
        assert_eq!(not_negative.render(&Syntax::LUA), "not -a");
        let not_not = Value::Negated(Box::new(Value::Negated(Box::new(a()))));
        assert_eq!(not_not.render(&Syntax::C), "!(!a)");
    }

    #[test]
    fn renders_leaves() {
        assert_eq!(Value::int(-3).to_string(), "-3");
        assert_eq!(Value::uint(0xffff_fffd).to_string(), "4294967293");
        assert_eq!(Value::string("say \"hi\"").to_string(), "\"say \\\"hi\\\"\"");
        assert_eq!(Value::Dup(2).to_string(), "temp2");
        let arr = Value::Array { name: "flags".into(), indices: vec![Value::int(1), a()] };
        assert_eq!(arr.to_string(), "flags[1][a]");
        assert_eq!(Value::call("f", vec![a(), Value::int(2)]).to_string(), "f(a, 2)");
        let neg = Value::unary(Value::binary(a(), b(), "+"), "-");
        assert_eq!(neg.to_string(), "-(a + b)");
    }
}
