use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyntaxKind {
    Lua,
    C,
}

impl SyntaxKind {
    pub fn syntax(self) -> &'static Syntax {
        match self {
            SyntaxKind::Lua => &Syntax::LUA,
            SyntaxKind::C => &Syntax::C,
        }
    }
}

/// Keyword and operator table of one output language.
///
/// Pairs are `(prefix, suffix)` wrapped around the variable part of a line.
#[derive(Debug)]
pub struct Syntax {
    pub kind: SyntaxKind,
    pub indent: &'static str,
    pub line_terminator: &'static str,
    pub arg_separator: &'static str,
    pub comment: &'static str,
    pub if_header: (&'static str, &'static str),
    pub elseif_header: (&'static str, &'static str),
    pub else_line: &'static str,
    pub block_end: &'static str,
    pub while_header: (&'static str, &'static str),
    pub do_header: &'static str,
    pub do_footer: (&'static str, &'static str),
    /// The do-loop footer exits when its condition holds (`until`).
    pub do_footer_negated: bool,
    pub goto: (&'static str, &'static str),
    /// `(prefix, middle, suffix)` of `if <cond> goto <label>`.
    pub cond_goto: (&'static str, &'static str, &'static str),
    pub label: (&'static str, &'static str),
    pub break_keyword: &'static str,
    pub continue_keyword: Option<&'static str>,
    pub return_keyword: &'static str,
    pub local_decl: &'static str,
    /// `(prefix, parameters open, parameters close)` around a function name.
    pub function_start: (&'static str, &'static str, &'static str),
    pub param_decl: &'static str,
    pub function_end: &'static str,
    pub entity_start: (&'static str, &'static str),
    pub entity_end: &'static str,
    pub precedence: &'static [(&'static str, u8)],
    pub operators: &'static [(&'static str, &'static str)],
}

pub const UNARY_PRECEDENCE: u8 = 2;
const UNKNOWN_PRECEDENCE: u8 = 15;

const C_PRECEDENCE: &[(&str, u8)] = &[
    ("*", 3),
    ("/", 3),
    ("%", 3),
    ("+", 4),
    ("-", 4),
    ("<<", 5),
    (">>", 5),
    ("<", 6),
    ("<=", 6),
    (">", 6),
    (">=", 6),
    ("==", 7),
    ("!=", 7),
    ("&", 8),
    ("^", 9),
    ("|", 10),
    ("&&", 11),
    ("||", 12),
];

// Lua binds bitwise operators tighter than comparisons.
const LUA_PRECEDENCE: &[(&str, u8)] = &[
    ("*", 3),
    ("/", 3),
    ("%", 3),
    ("+", 4),
    ("-", 4),
    ("<<", 5),
    (">>", 5),
    ("&", 6),
    ("^", 7),
    ("|", 8),
    ("<", 9),
    ("<=", 9),
    (">", 9),
    (">=", 9),
    ("==", 9),
    ("!=", 9),
    ("&&", 10),
    ("||", 11),
];

const LUA_OPERATORS: &[(&str, &str)] = &[
    ("!=", "~="),
    ("&&", "and"),
    ("||", "or"),
    ("!", "not"),
    ("^", "~"),
];

impl Syntax {
    pub const LUA: Syntax = Syntax {
        kind: SyntaxKind::Lua,
        indent: "    ",
        line_terminator: "",
        arg_separator: ", ",
        comment: "-- ",
        if_header: ("if ", " then"),
        elseif_header: ("elseif ", " then"),
        else_line: "else",
        block_end: "end",
        while_header: ("while ", " do"),
        do_header: "repeat",
        do_footer: ("until ", ""),
        do_footer_negated: true,
        goto: ("goto ", ""),
        cond_goto: ("if ", " then goto ", " end"),
        label: ("::", "::"),
        break_keyword: "break",
        continue_keyword: None,
        return_keyword: "return",
        local_decl: "local ",
        function_start: ("", " = function(self", ")"),
        param_decl: "",
        function_end: "end,",
        entity_start: ("EntityContainer[\"", "\"] = {"),
        entity_end: "}",
        precedence: LUA_PRECEDENCE,
        operators: LUA_OPERATORS,
    };

    pub const C: Syntax = Syntax {
        kind: SyntaxKind::C,
        indent: "    ",
        line_terminator: ";",
        arg_separator: ", ",
        comment: "// ",
        if_header: ("if (", ") {"),
        elseif_header: ("} else if (", ") {"),
        else_line: "} else {",
        block_end: "}",
        while_header: ("while (", ") {"),
        do_header: "do {",
        do_footer: ("} while (", ");"),
        do_footer_negated: false,
        goto: ("goto ", ";"),
        cond_goto: ("if (", ") goto ", ";"),
        label: ("", ":"),
        break_keyword: "break;",
        continue_keyword: Some("continue;"),
        return_keyword: "return",
        local_decl: "int ",
        function_start: ("void ", "(void *self", ") {"),
        param_decl: "int ",
        function_end: "}",
        entity_start: ("/* entity ", " */ {"),
        entity_end: "}",
        precedence: C_PRECEDENCE,
        operators: &[],
    };

    pub fn precedence_of(&self, op: &str) -> u8 {
        self.precedence
            .iter()
            .find(|(sym, _)| *sym == op)
            .map(|(_, p)| *p)
            .unwrap_or(UNKNOWN_PRECEDENCE)
    }

    /// Spelling of an operator symbol in this language.
    pub fn operator<'a>(&self, op: &'a str) -> &'a str {
        self.operators
            .iter()
            .find(|(sym, _)| *sym == op)
            .map(|(_, spelled)| *spelled)
            .unwrap_or(op)
    }

    pub fn function_header(&self, name: &str, args: u32) -> String {
        let (prefix, open, close) = self.function_start;
        let mut out = format!("{prefix}{name}{open}");
        for i in 0..args {
            out.push_str(&format!("{}{}arg{i}", self.arg_separator, self.param_decl));
        }
        out.push_str(close);
        out
    }

    pub fn label_name(&self, address: u32) -> String {
        format!("label_{address:04x}")
    }

    pub fn label_line(&self, address: u32) -> String {
        format!("{}{}{}", self.label.0, self.label_name(address), self.label.1)
    }

    pub fn goto_line(&self, address: u32) -> String {
        format!("{}{}{}", self.goto.0, self.label_name(address), self.goto.1)
    }

    pub fn cond_goto_line(&self, cond: &str, address: u32) -> String {
        let (prefix, middle, suffix) = self.cond_goto;
        format!("{prefix}{cond}{middle}{}{suffix}", self.label_name(address))
    }

    pub fn continue_line(&self) -> String {
        match self.continue_keyword {
            Some(kw) => kw.to_string(),
            None => format!("{}continue", self.comment),
        }
    }

    pub fn statement(&self, text: &str) -> String {
        format!("{text}{}", self.line_terminator)
    }

    pub fn is_return(&self, line: &str) -> bool {
        line == self.return_keyword
            || line.starts_with(&format!("{} ", self.return_keyword))
            || line == self.statement(self.return_keyword)
    }
}
