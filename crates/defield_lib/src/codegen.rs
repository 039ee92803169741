use std::collections::{BTreeSet, HashMap};

use crate::cfg::{ControlFlow, GroupId, GroupKind, LoopKind};
use crate::engine::{ArgOrder, Engine, Formatter};
use crate::error::DecompileError;
use crate::function::Function;
use crate::instr::{InstKind, Instr};
use crate::syntax::Syntax;
use crate::value::Value;
use crate::{EntityDescriptor, LabelMode, LineDescriptor};

/// One generated line and the indentation change around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLine {
    pub text: String,
    pub unindent_before: bool,
    pub indent_after: bool,
}

impl CodeLine {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            unindent_before: false,
            indent_after: false,
        }
    }

    /// Opens a block.
    pub fn open(text: impl Into<String>) -> Self {
        Self {
            indent_after: true,
            ..Self::plain(text)
        }
    }

    /// Closes a block.
    pub fn close(text: impl Into<String>) -> Self {
        Self {
            unindent_before: true,
            ..Self::plain(text)
        }
    }

    /// Closes one block and opens the next, like `else`.
    pub fn middle(text: impl Into<String>) -> Self {
        Self {
            unindent_before: true,
            indent_after: true,
            ..Self::plain(text)
        }
    }
}

/// Applies the indentation flags of `lines`, failing if the nesting is unbalanced.
pub fn render_lines(syntax: &Syntax, lines: &[CodeLine]) -> Result<String, DecompileError> {
    let mut out = String::new();
    let mut level = 0usize;
    for line in lines {
        if line.unindent_before {
            level = level.checked_sub(1).ok_or_else(|| {
                DecompileError::Internal(format!("block closed twice before `{}`", line.text))
            })?;
        }
        for _ in 0..level {
            out.push_str(syntax.indent);
        }
        out.push_str(&line.text);
        out.push('\n');
        if line.indent_after {
            level += 1;
        }
    }
    if level != 0 {
        return Err(DecompileError::Internal(format!("{level} blocks left open")));
    }
    Ok(out)
}

/// Simulated machine state handed to instruction handlers.
pub struct GenContext<'a> {
    syntax: &'static Syntax,
    formatter: &'a dyn Formatter,
    functions: &'a [Function],
    function: usize,
    binary_order: ArgOrder,
    call_order: ArgOrder,
    stack: Vec<Value>,
    out: Vec<CodeLine>,
    temps: u32,
    lines: Vec<LineDescriptor>,
}

impl<'a> GenContext<'a> {
    fn new(
        syntax: &'static Syntax,
        formatter: &'a dyn Formatter,
        engine: &dyn Engine,
        functions: &'a [Function],
    ) -> Self {
        Self {
            syntax,
            formatter,
            functions,
            function: 0,
            binary_order: engine.binary_arg_order(),
            call_order: engine.call_arg_order(),
            stack: Vec::new(),
            out: Vec::new(),
            temps: 0,
            lines: Vec::new(),
        }
    }

    pub fn syntax(&self) -> &'static Syntax {
        self.syntax
    }

    pub fn formatter(&self) -> &'a dyn Formatter {
        self.formatter
    }

    /// The function being generated.
    pub fn function(&self) -> &'a Function {
        &self.functions[self.function]
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self, address: u32) -> Result<Value, DecompileError> {
        self.stack.pop().ok_or(DecompileError::StackUnderflow { address })
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Pops `count` values and returns them in argument order.
    pub fn pop_args(
        &mut self,
        count: usize,
        order: ArgOrder,
        address: u32,
    ) -> Result<Vec<Value>, DecompileError> {
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.pop(address)?);
        }
        if order == ArgOrder::Fifo {
            args.reverse();
        }
        Ok(args)
    }

    pub fn call_order(&self) -> ArgOrder {
        self.call_order
    }

    pub fn binary_order(&self) -> ArgOrder {
        self.binary_order
    }

    pub fn emit(&mut self, line: CodeLine) {
        self.out.push(line);
    }

    pub fn emit_statement(&mut self, text: &str) {
        let line = self.syntax.statement(text);
        self.out.push(CodeLine::plain(line));
    }

    pub fn emit_comment(&mut self, text: &str) {
        let line = format!("{}{text}", self.syntax.comment);
        self.out.push(CodeLine::plain(line));
    }

    pub fn render(&self, v: &Value) -> String {
        v.render(self.syntax)
    }

    pub fn variable(&self, bank: u32, address: u32) -> Value {
        let name = self
            .formatter
            .variable_name(bank, address)
            .unwrap_or_else(|| format!("var_{bank}_{address}"));
        Value::Var(name)
    }

    /// Duplicates the top of the stack, binding anything with side effects to a temporary first.
    pub fn dup(&mut self, address: u32) -> Result<(), DecompileError> {
        let v = self.pop(address)?;
        if v.is_simple() {
            self.push(v.clone());
            self.push(v);
            return Ok(());
        }
        let idx = self.temps;
        self.temps += 1;
        let decl = format!(
            "{}{} = {}",
            self.syntax.local_decl,
            self.render(&Value::Dup(idx)),
            self.render(&v)
        );
        self.emit_statement(&decl);
        self.push(Value::Dup(idx));
        self.push(Value::Dup(idx));
        Ok(())
    }

    /// Name of the script function starting at `address`.
    pub fn function_name_at(&self, address: u32) -> Result<String, DecompileError> {
        self.functions
            .iter()
            .find(|f| f.start == address)
            .map(|f| f.name.clone())
            .ok_or_else(|| {
                DecompileError::Internal(format!("no function starts at 0x{address:04x}"))
            })
    }

    pub fn record_line(&mut self, point_a: [i16; 3], point_b: [i16; 3]) {
        let f = self.function();
        self.lines.push(LineDescriptor {
            entity: f.entity.clone(),
            function: f.name.clone(),
            point_a,
            point_b,
        });
    }
}

/// Lines of a whole script plus what the handlers collected on the way.
#[derive(Debug, Clone, Default)]
pub struct GeneratedCode {
    pub lines: Vec<CodeLine>,
    pub entities: Vec<EntityDescriptor>,
    pub descriptors: Vec<LineDescriptor>,
}

struct FunctionCode {
    groups: HashMap<GroupId, Vec<CodeLine>>,
}

/// Replays instructions group by group and wraps them in block syntax.
pub struct CodeGenerator<'a> {
    instrs: &'a [Instr],
    cf: &'a ControlFlow,
    functions: &'a [Function],
    engine: &'a dyn Engine,
    formatter: &'a dyn Formatter,
    syntax: &'static Syntax,
    labels: LabelMode,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(
        instrs: &'a [Instr],
        cf: &'a ControlFlow,
        functions: &'a [Function],
        engine: &'a dyn Engine,
        formatter: &'a dyn Formatter,
        syntax: &'static Syntax,
        labels: LabelMode,
    ) -> Self {
        Self {
            instrs,
            cf,
            functions,
            engine,
            formatter,
            syntax,
            labels,
        }
    }

    pub fn generate(&self) -> Result<GeneratedCode, DecompileError> {
        let mut ctx = GenContext::new(self.syntax, self.formatter, self.engine, self.functions);
        let mut targets = BTreeSet::new();

        // First pass replays every function and collects goto targets.
        let mut bodies = Vec::with_capacity(self.functions.len());
        for f in 0..self.functions.len() {
            ctx.function = f;
            ctx.temps = 0;
            bodies.push(self.replay_function(&mut ctx, f, &mut targets)?);
        }
        log::debug!("{} goto targets", targets.len());

        let mut code = GeneratedCode {
            entities: crate::entities_of(self.functions),
            ..GeneratedCode::default()
        };
        for entity in &code.entities {
            let (prefix, suffix) = self.syntax.entity_start;
            code.lines.push(CodeLine::open(format!("{prefix}{}{suffix}", entity.name)));
            for (f, func) in self.functions.iter().enumerate() {
                if func.entity == entity.name {
                    self.assemble_function(f, &bodies[f], &targets, &mut code.lines)?;
                }
            }
            code.lines.push(CodeLine::close(self.syntax.entity_end));
        }
        code.descriptors = std::mem::take(&mut ctx.lines);
        Ok(code)
    }

    /// Depth-first walk from the entry, one cloned stack per path.
    /// The first path into a group wins.
    fn replay_function(
        &self,
        ctx: &mut GenContext<'_>,
        f: usize,
        targets: &mut BTreeSet<u32>,
    ) -> Result<FunctionCode, DecompileError> {
        let mut code = FunctionCode { groups: HashMap::new() };
        let Some(entry) = self.cf.entry(f) else {
            return Ok(code);
        };
        let mut work = vec![(entry, Vec::new())];
        while let Some((id, stack)) = work.pop() {
            if code.groups.contains_key(&id) {
                continue;
            }
            ctx.stack = stack;
            let lines = self.replay_group(ctx, id, targets)?;
            code.groups.insert(id, lines);
            for (succ, _) in self.cf.successors(id).into_iter().rev() {
                if !code.groups.contains_key(&succ) {
                    work.push((succ, ctx.stack.clone()));
                }
            }
        }
        Ok(code)
    }

    fn replay_group(
        &self,
        ctx: &mut GenContext<'_>,
        id: GroupId,
        targets: &mut BTreeSet<u32>,
    ) -> Result<Vec<CodeLine>, DecompileError> {
        let group = self.cf.group(id);
        let mut conditions: Vec<Condition> = Vec::new();
        for ins in &self.instrs[group.start..=group.end] {
            match ins.kind {
                InstKind::CondJump { when } => {
                    if let Some(handler) = self.engine.handler(ins.opcode) {
                        handler(ctx, ins)?;
                    }
                    let cond = ctx.pop(ins.address)?;
                    conditions.push(Condition {
                        jumps_if: if when { cond } else { cond.negate()? },
                        dest: ins.dest_address()?,
                        next: ins.next_address(),
                    });
                }
                InstKind::Jump => self.uncond_jump(ctx, id, ins, targets)?,
                _ => match self.engine.handler(ins.opcode) {
                    Some(handler) => handler(ctx, ins)?,
                    None => generic(ctx, ins)?,
                },
            }
        }
        if !conditions.is_empty() {
            if !self.instrs[group.end].is_cond_jump() {
                return Err(DecompileError::Internal(format!(
                    "group at 0x{:04x} branches before its end",
                    group.start_address
                )));
            }
            self.cond_jump(ctx, id, conditions, targets)?;
        }
        Ok(std::mem::take(&mut ctx.out))
    }

    fn cond_jump(
        &self,
        ctx: &mut GenContext<'_>,
        id: GroupId,
        conditions: Vec<Condition>,
        targets: &mut BTreeSet<u32>,
    ) -> Result<(), DecompileError> {
        let group = self.cf.group(id);
        let dest = conditions.last().map(|c| c.dest).unwrap_or(0);
        let jumps = fold_conditions(group.start_address, conditions)?;
        let s = self.syntax;
        match group.kind {
            GroupKind::If => {
                let cond = ctx.render(&jumps.negate()?);
                ctx.emit(if group.coalesced_else {
                    CodeLine::middle(format!("{}{cond}{}", s.elseif_header.0, s.elseif_header.1))
                } else {
                    CodeLine::open(format!("{}{cond}{}", s.if_header.0, s.if_header.1))
                });
            }
            GroupKind::While => {
                let cond = ctx.render(&jumps.negate()?);
                ctx.emit(CodeLine::open(format!("{}{cond}{}", s.while_header.0, s.while_header.1)));
            }
            GroupKind::DoWhile => {
                let cond = if s.do_footer_negated { jumps.negate()? } else { jumps };
                let cond = ctx.render(&cond);
                ctx.emit(CodeLine::close(format!("{}{cond}{}", s.do_footer.0, s.do_footer.1)));
            }
            _ => {
                targets.insert(dest);
                let cond = ctx.render(&jumps);
                ctx.emit(CodeLine::plain(s.cond_goto_line(&cond, dest)));
            }
        }
        Ok(())
    }

    fn uncond_jump(
        &self,
        ctx: &mut GenContext<'_>,
        id: GroupId,
        ins: &Instr,
        targets: &mut BTreeSet<u32>,
    ) -> Result<(), DecompileError> {
        let group = self.cf.group(id);
        match group.kind {
            GroupKind::Break => ctx.emit(CodeLine::plain(self.syntax.break_keyword)),
            GroupKind::Continue => ctx.emit(CodeLine::plain(self.syntax.continue_line())),
            _ => {
                if self.closes_while(id) {
                    return Ok(());
                }
                let dest = ins.dest_address()?;
                if let Some(next) = group.next {
                    if self.cf.group(next).start_address == dest || self.ends_then_arm(next, dest) {
                        return Ok(());
                    }
                }
                targets.insert(dest);
                ctx.emit(CodeLine::plain(self.syntax.goto_line(dest)));
            }
        }
        Ok(())
    }

    fn closes_while(&self, id: GroupId) -> bool {
        self.cf.closing_loop(id).is_some_and(|l| l.kind == LoopKind::While)
    }

    /// Whether jumping to `dest` skips exactly the else arm starting at `next`.
    fn ends_then_arm(&self, next: GroupId, dest: u32) -> bool {
        if !self.cf.group(next).start_else {
            return false;
        }
        self.cf
            .group_at(dest)
            .and_then(|join| self.cf.group(join).prev)
            .is_some_and(|end| self.cf.group(end).end_else.contains(&next))
    }

    fn assemble_function(
        &self,
        f: usize,
        code: &FunctionCode,
        targets: &BTreeSet<u32>,
        out: &mut Vec<CodeLine>,
    ) -> Result<(), DecompileError> {
        let func = &self.functions[f];
        self.engine.on_before_start_function(func, self.syntax, out);
        self.engine.on_start_function(func, self.syntax, out);
        let body_start = out.len();

        for id in self.cf.function_groups(f) {
            let reached = code.groups.get(&id);
            self.prologue(id, code, targets, reached.is_some(), out)?;
            match reached {
                Some(lines) => out.extend(lines.iter().cloned()),
                None => log::warn!(
                    "skipping unreachable code at 0x{:04x} in {}",
                    self.cf.group(id).start_address,
                    func.name
                ),
            }
            if let Some(l) = self.cf.closing_loop(id) {
                if self.closes_while(id) && code.groups.contains_key(&l.cond) {
                    out.push(CodeLine::close(self.syntax.block_end));
                }
            }
        }

        let returns =
            out.len() > body_start && out.last().is_some_and(|l| self.syntax.is_return(&l.text));
        if !returns {
            out.push(CodeLine::plain(self.syntax.statement(self.syntax.return_keyword)));
        }
        self.engine.on_end_function(func, self.syntax, out);
        Ok(())
    }

    /// Block closers, `else`, label and loop header in front of a group.
    fn prologue(
        &self,
        id: GroupId,
        code: &FunctionCode,
        targets: &BTreeSet<u32>,
        reached: bool,
        out: &mut Vec<CodeLine>,
    ) -> Result<(), DecompileError> {
        let group = self.cf.group(id);
        let seen = |g: &GroupId| code.groups.contains_key(g);

        let mut ifs = 0;
        let mut repeats = 0;
        for (pred, _) in self.cf.predecessors(id) {
            if !seen(&pred) || self.cf.jump_target(self.instrs, pred)? != Some(id) {
                continue;
            }
            match self.cf.group(pred).kind {
                GroupKind::If => ifs += 1,
                GroupKind::DoWhile => repeats += 1,
                _ => {}
            }
        }
        let opened_else = group.start_else && ifs > 0;
        if opened_else {
            ifs -= 1;
        }
        let closed_elses = group
            .prev
            .map(|p| {
                self.cf
                    .group(p)
                    .end_else
                    .iter()
                    .filter(|t| {
                        seen(*t)
                            && !self.cf.group(**t).coalesced_else
                            && self.else_opened(**t, code)
                    })
                    .count()
            })
            .unwrap_or(0);
        for _ in 0..ifs + closed_elses {
            out.push(CodeLine::close(self.syntax.block_end));
        }
        if !reached {
            return Ok(());
        }
        if opened_else && !group.coalesced_else {
            out.push(CodeLine::middle(self.syntax.else_line));
        }
        if self.labels == LabelMode::EveryGroup || targets.contains(&group.start_address) {
            out.push(CodeLine::plain(self.syntax.label_line(group.start_address)));
        }
        for _ in 0..repeats {
            out.push(CodeLine::open(self.syntax.do_header));
        }
        Ok(())
    }

    /// Whether the `if` owning the else arm at `target` was generated.
    fn else_opened(&self, target: GroupId, code: &FunctionCode) -> bool {
        self.cf.predecessors(target).iter().any(|(pred, _)| {
            code.groups.contains_key(pred)
                && self.cf.group(*pred).kind == GroupKind::If
                && matches!(self.cf.jump_target(self.instrs, *pred), Ok(Some(t)) if t == target)
        })
    }
}

/// One conditional jump inside a group: taken when `jumps_if` holds.
struct Condition {
    jumps_if: Value,
    dest: u32,
    next: u32,
}

/// Folds the conditional jumps of a short-circuit group into one condition for taking the
/// last jump.
fn fold_conditions(start: u32, conditions: Vec<Condition>) -> Result<Value, DecompileError> {
    let n = conditions.len();
    let (taken, fallthrough) = match conditions.last() {
        Some(last) => (last.dest, last.next),
        None => return Err(DecompileError::Internal("empty condition list".into())),
    };
    let starts: Vec<u32> =
        std::iter::once(start).chain(conditions.iter().map(|c| c.next)).collect();

    let mut folded: Vec<Value> = Vec::with_capacity(n);
    let mut iter = conditions.into_iter().rev();
    if let Some(last) = iter.next() {
        folded.push(last.jumps_if);
    }
    // `folded` grows from the last condition backwards; position j from the end is `n - 1 - j`.
    for (k, c) in (0..n.saturating_sub(1)).rev().zip(iter) {
        let at = |j: usize, folded: &Vec<Value>| folded[n - 1 - j].clone();
        let rest = at(k + 1, &folded);
        let e = if c.dest == starts[k + 1] {
            rest
        } else if c.dest == taken {
            Value::binary(c.jumps_if, rest, "||")
        } else if c.dest == fallthrough {
            Value::binary(c.jumps_if.negate()?, rest, "&&")
        } else if let Some(j) = (k + 2..n).find(|&j| starts[j] == c.dest) {
            let target = at(j, &folded);
            match rest {
                Value::Binary { lhs, rhs, op: "||" } if *rhs == target => {
                    Value::binary(Value::binary(c.jumps_if.negate()?, *lhs, "&&"), target, "||")
                }
                Value::Binary { lhs, rhs, op: "&&" } if *rhs == target => {
                    Value::binary(Value::binary(c.jumps_if, *lhs, "||"), target, "&&")
                }
                rest => Value::binary(
                    Value::binary(c.jumps_if.clone(), target, "&&"),
                    Value::binary(c.jumps_if.negate()?, rest, "&&"),
                    "||",
                ),
            }
        } else {
            return Err(DecompileError::Internal(format!(
                "conditional jump to 0x{:04x} leaves its condition group",
                c.dest
            )));
        };
        folded.push(e);
    }
    folded
        .pop()
        .ok_or_else(|| DecompileError::Internal("empty condition list".into()))
}

/// Variable addressed by an instruction's `(bank, address)` operands, or by a single slot operand.
fn operand_variable(ctx: &GenContext<'_>, ins: &Instr) -> Result<Value, DecompileError> {
    if ins.operands.len() >= 2 {
        Ok(ctx.variable(ins.operand_u32(0)?, ins.operand_u32(1)?))
    } else {
        Ok(Value::var(format!("var_{}", ctx.render(ins.operand(0)?))))
    }
}

/// Default semantics of each instruction kind.
fn generic(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let address = ins.address;
    match ins.kind {
        InstKind::Nop => {}
        InstKind::Load => {
            let v = if ins.codegen == "var" {
                operand_variable(ctx, ins)?
            } else {
                ins.operand(0)?.clone()
            };
            ctx.push(v);
        }
        InstKind::Store => {
            let v = ctx.pop(address)?;
            let target = operand_variable(ctx, ins)?;
            let line = format!("{} = {}", ctx.render(&target), ctx.render(&v));
            ctx.emit_statement(&line);
        }
        InstKind::Stack => {
            let v = ctx.pop(address)?;
            if matches!(v, Value::Call { .. }) {
                let line = ctx.render(&v);
                ctx.emit_statement(&line);
            } else {
                log::trace!("dropping {v} at 0x{address:04x}");
            }
        }
        InstKind::Dup => ctx.dup(address)?,
        InstKind::BinaryOp => {
            let mut args = ctx.pop_args(2, ctx.binary_order(), address)?;
            let rhs = args.pop();
            let lhs = args.pop();
            let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                return Err(DecompileError::StackUnderflow { address });
            };
            ctx.push(Value::binary(lhs, rhs, ins.codegen));
        }
        InstKind::UnaryOp => {
            let v = ctx.pop(address)?;
            ctx.push(Value::unary(v, ins.codegen));
        }
        InstKind::BoolNegate => {
            let v = ctx.pop(address)?;
            ctx.push(v.negate()?);
        }
        InstKind::Call => {
            let name = ctx.function_name_at(ins.operand_u32(0)?)?;
            let argc = ins.operand_u32(1)? as usize;
            let args = ctx.pop_args(argc, ctx.call_order(), address)?;
            let call = Value::call(name, args);
            if ins.codegen.contains('r') {
                ctx.push(call);
            } else {
                let line = ctx.render(&call);
                ctx.emit_statement(&line);
            }
        }
        InstKind::KernelCall => kernel_call(ctx, ins)?,
        InstKind::Return => {
            if ins.codegen == "v" {
                let v = ctx.pop(address)?;
                let line = format!("{} {}", ctx.syntax().return_keyword, ctx.render(&v));
                ctx.emit_statement(&line);
            } else {
                let kw = ctx.syntax().return_keyword;
                ctx.emit_statement(kw);
            }
        }
        InstKind::Jump | InstKind::CondJump { .. } => {
            return Err(DecompileError::Internal(format!(
                "jump {} at 0x{address:04x} replayed as a plain instruction",
                ins.name
            )));
        }
    }
    Ok(())
}

/// Builds a call from `name|spec` metadata: `p` pops an argument, `i` takes the next operand,
/// `r` pushes the result instead of emitting a statement.
fn kernel_call(ctx: &mut GenContext<'_>, ins: &Instr) -> Result<(), DecompileError> {
    let default_spec = "i".repeat(ins.operands.len());
    let (name, spec) = match ins.codegen.split_once('|') {
        Some((name, spec)) => (name.to_string(), spec),
        None if ins.codegen.is_empty() => (ins.name.to_lowercase(), default_spec.as_str()),
        None => (ins.codegen.to_string(), ""),
    };

    let pops = spec.chars().filter(|&c| c == 'p').count();
    let mut popped = ctx.pop_args(pops, ctx.call_order(), ins.address)?.into_iter();
    let mut operands = ins.operands.iter();
    let mut args = Vec::new();
    let mut returns = false;
    for code in spec.chars() {
        match code {
            'p' => args.extend(popped.next()),
            'i' => args.push(operands.next().cloned().ok_or_else(|| {
                DecompileError::Internal(format!(
                    "{} at 0x{:04x} has too few operands",
                    ins.name, ins.address
                ))
            })?),
            'r' => returns = true,
            other => {
                return Err(DecompileError::Internal(format!(
                    "bad argument code '{other}' for {}",
                    ins.name
                )));
            }
        }
    }

    let call = Value::call(name, args);
    if returns {
        ctx.push(call);
    } else {
        let line = ctx.render(&call);
        ctx.emit_statement(&line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::{Op, assemble};
    use crate::engine::DefaultFormatter;
    use crate::opcode::OpcodeEntry;
    use crate::syntax::SyntaxKind;

    struct Plain;

    impl Engine for Plain {
        fn name(&self) -> &'static str {
            "plain"
        }

        fn opcode_table(&self) -> &'static [OpcodeEntry] {
            &[]
        }
    }

    fn main_function(instrs: &[Instr]) -> Vec<Function> {
        vec![Function {
            entity: "e".into(),
            name: "main".into(),
            start: 0,
            end: instrs.last().map(Instr::next_address).unwrap_or(0),
            entry: 0,
            instruction_count: instrs.len(),
            args: 0,
            returns: false,
            metadata: String::new(),
        }]
    }

    fn generate_with(
        ops: &[Op],
        kind: SyntaxKind,
        labels: LabelMode,
    ) -> Result<GeneratedCode, DecompileError> {
        let instrs = assemble(ops);
        let functions = main_function(&instrs);
        let cf = ControlFlow::build(&instrs, &functions)?;
        let syntax = kind.syntax();
        CodeGenerator::new(&instrs, &cf, &functions, &Plain, &DefaultFormatter, syntax, labels)
            .generate()
    }

    fn lua(ops: &[Op]) -> String {
        let code = generate_with(ops, SyntaxKind::Lua, LabelMode::Required).unwrap();
        render_lines(&Syntax::LUA, &code.lines).unwrap()
    }

    /// Body of `main` without the entity and function wrappers, dedented.
    fn lua_body(ops: &[Op]) -> String {
        let text = lua(ops);
        let lines: Vec<&str> = text.lines().collect();
        lines[2..lines.len() - 2]
            .iter()
            .map(|l| l.strip_prefix("        ").unwrap_or(l))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn balanced(code: &GeneratedCode) -> bool {
        let opens = code.lines.iter().filter(|l| l.indent_after).count();
        let closes = code.lines.iter().filter(|l| l.unindent_before).count();
        opens == closes
    }

    #[test]
    fn render_rejects_unbalanced_blocks() {
        let lines = [CodeLine::plain("x"), CodeLine::close("end")];
        assert!(matches!(render_lines(&Syntax::LUA, &lines), Err(DecompileError::Internal(_))));
        let lines = [CodeLine::open("if x then")];
        assert!(matches!(render_lines(&Syntax::LUA, &lines), Err(DecompileError::Internal(_))));
        let lines = [
            CodeLine::open("a"),
            CodeLine::middle("b"),
            CodeLine::plain("c"),
            CodeLine::close("d"),
        ];
        assert_eq!(render_lines(&Syntax::C, &lines).unwrap(), "a\nb\n    c\nd\n");
    }

    #[test]
    fn straight_line_code_is_wrapped_in_entity_and_function() {
        use Op::*;
        let text = lua(&[Push, Store, Stmt, Ret]);
        assert_eq!(
            text,
            "EntityContainer[\"e\"] = {\n    main = function(self)\n        var_1 = 0\n        stmt(2)\n        return\n    end,\n}\n"
        );
    }

    #[test]
    fn missing_return_is_synthesized() {
        use Op::*;
        assert_eq!(lua_body(&[Push, Store]), "var_1 = 0\nreturn");
    }

    #[test]
    fn if_else_renders_both_arms() {
        use Op::*;
        let ops = [Push, Jmpf(5), Push, Store, Jmp(7), Push, Store, Ret];
        assert_eq!(
            lua_body(&ops),
            "if 0 then\n    var_3 = 2\nelse\n    var_6 = 5\nend\nreturn"
        );

        let code = generate_with(&ops, SyntaxKind::C, LabelMode::Required).unwrap();
        assert_eq!(
            render_lines(&Syntax::C, &code.lines).unwrap(),
            "/* entity e */ {\n    void main(void *self) {\n        if (0) {\n            var_3 = 2;\n        } else {\n            var_6 = 5;\n        }\n        return;\n    }\n}\n"
        );
    }

    #[test]
    fn short_circuit_becomes_and() {
        use Op::*;
        assert_eq!(
            lua_body(&[Push, Jmpf(6), Push, Jmpf(6), Push, Store, Ret]),
            "if 0 and 2 then\n    var_5 = 4\nend\nreturn"
        );
    }

    #[test]
    fn jump_on_true_to_the_body_becomes_or() {
        use Op::*;
        // if a or b then x end
        assert_eq!(
            lua_body(&[Push, Jmpt(4), Push, Jmpf(6), Push, Store, Ret]),
            "if 0 or 2 then\n    var_5 = 4\nend\nreturn"
        );
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        use Op::*;
        let ops =
            [Push, Jmpf(10), Push, Jmpf(5), Jmp(10), Push, Jmpf(8), Jmp(0), Stmt, Jmp(0), Ret];
        assert_eq!(
            lua_body(&ops),
            "while 0 do\n    if 2 then\n        break\n    end\n    if 5 then\n        -- continue\n    end\n    stmt(8)\nend\nreturn"
        );
        let code = generate_with(&ops, SyntaxKind::C, LabelMode::Required).unwrap();
        let text = render_lines(&Syntax::C, &code.lines).unwrap();
        assert!(text.contains("                continue;\n"));
        assert!(text.contains("        while (0) {\n"));
    }

    #[test]
    fn do_while_footer_follows_the_language() {
        use Op::*;
        let ops = [Stmt, Push, Store, Push, Jmpt(1), Ret];
        assert_eq!(lua_body(&ops), "stmt(0)\nrepeat\n    var_2 = 1\nuntil not 3\nreturn");
        let code = generate_with(&ops, SyntaxKind::C, LabelMode::Required).unwrap();
        let text = render_lines(&Syntax::C, &code.lines).unwrap();
        assert!(text.contains("        do {\n            var_2 = 1;\n        } while (3);\n"));
    }

    #[test]
    fn else_if_chain_shares_one_end() {
        use Op::*;
        let ops = [Push, Jmpf(4), Stmt, Jmp(9), Push, Jmpf(8), Stmt, Jmp(9), Stmt, Ret];
        assert_eq!(
            lua_body(&ops),
            "if 0 then\n    stmt(2)\nelseif 4 then\n    stmt(6)\nelse\n    stmt(8)\nend\nreturn"
        );
    }

    #[test]
    fn unstructured_exit_uses_goto_and_label() {
        use Op::*;
        let ops = [Push, Jmpf(7), Stmt, Push, Jmpt(7), Stmt, Jmp(0), Ret];
        assert_eq!(
            lua_body(&ops),
            "while 0 do\n    stmt(2)\n    if 3 then goto label_000e end\n    stmt(5)\nend\n::label_000e::\nreturn"
        );
    }

    #[test]
    fn every_group_mode_labels_each_group() {
        use Op::*;
        let code =
            generate_with(&[Stmt, Stmt, Ret], SyntaxKind::Lua, LabelMode::EveryGroup).unwrap();
        let labels = code.lines.iter().filter(|l| l.text.starts_with("::label_")).count();
        assert_eq!(labels, 3);
    }

    #[test]
    fn blocks_balance_for_every_construct() {
        use Op::*;
        let programs: [&[Op]; 5] = [
            &[Push, Jmpf(5), Push, Store, Jmp(7), Push, Store, Ret],
            &[Push, Jmpf(10), Push, Jmpf(5), Jmp(10), Push, Jmpf(8), Jmp(0), Stmt, Jmp(0), Ret],
            &[Stmt, Push, Store, Push, Jmpt(1), Ret],
            &[Push, Jmpf(4), Stmt, Jmp(9), Push, Jmpf(8), Stmt, Jmp(9), Stmt, Ret],
            &[Push, Jmpf(7), Stmt, Push, Jmpt(7), Stmt, Jmp(0), Ret],
        ];
        for ops in programs {
            for kind in [SyntaxKind::Lua, SyntaxKind::C] {
                let code = generate_with(ops, kind, LabelMode::Required).unwrap();
                assert!(balanced(&code));
                assert!(render_lines(kind.syntax(), &code.lines).is_ok());
            }
        }
    }

    #[test]
    fn popping_an_empty_stack_fails() {
        use Op::*;
        assert!(matches!(
            generate_with(&[Push, Store, Store, Ret], SyntaxKind::Lua, LabelMode::Required),
            Err(DecompileError::StackUnderflow { address: 4 })
        ));
    }

    #[test]
    fn unreachable_code_is_skipped() {
        use Op::*;
        assert_eq!(lua_body(&[Jmp(2), Stmt, Ret]), "goto label_0004\n::label_0004::\nreturn");
        // The loop's back jump is dead after the return but the loop still closes.
        assert_eq!(
            lua_body(&[Push, Jmpf(4), Ret, Jmp(0), Ret]),
            "while 0 do\n    return\nend\nreturn"
        );
    }

    #[test]
    fn side_effects_are_bound_before_duplication() {
        let formatter = DefaultFormatter;
        let functions = main_function(&[]);
        let mut ctx = GenContext::new(&Syntax::LUA, &formatter, &Plain, &functions);
        ctx.push(Value::call("random", vec![]));
        ctx.dup(0).unwrap();
        assert_eq!(ctx.out[0].text, "local temp0 = random()");
        assert_eq!(ctx.pop(0).unwrap(), Value::Dup(0));
        assert_eq!(ctx.pop(0).unwrap(), Value::Dup(0));

        ctx.push(Value::int(3));
        ctx.dup(0).unwrap();
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.out.len(), 1);
    }

    #[test]
    fn fifo_and_lifo_argument_orders() {
        let formatter = DefaultFormatter;
        let functions = main_function(&[]);
        let mut ctx = GenContext::new(&Syntax::LUA, &formatter, &Plain, &functions);
        for i in 0..3 {
            ctx.push(Value::int(i));
        }
        assert_eq!(ctx.pop_args(2, ArgOrder::Fifo, 0).unwrap(), vec![Value::int(1), Value::int(2)]);
        ctx.push(Value::int(5));
        assert_eq!(ctx.pop_args(2, ArgOrder::Lifo, 0).unwrap(), vec![Value::int(5), Value::int(0)]);
        assert!(matches!(
            ctx.pop_args(1, ArgOrder::Fifo, 9),
            Err(DecompileError::StackUnderflow { address: 9 })
        ));
    }

    #[test]
    fn mixed_short_circuit_folds_into_one_condition() {
        // (a || b) && c: a jumps into c's evaluation on true, b and c leave on false.
        let conditions = vec![
            Condition { jumps_if: Value::var("a"), dest: 8, next: 4 },
            Condition { jumps_if: Value::var("b").negate().unwrap(), dest: 20, next: 8 },
            Condition { jumps_if: Value::var("c").negate().unwrap(), dest: 20, next: 12 },
        ];
        let jumps = fold_conditions(0, conditions).unwrap();
        assert_eq!(jumps.negate().unwrap().to_string(), "(a || b) && c");
    }
}
