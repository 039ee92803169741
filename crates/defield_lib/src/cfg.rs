use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::error::DecompileError;
use crate::function::Function;
use crate::instr::Instr;

pub type GroupId = NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    Jump,
}

impl EdgeKind {
    pub fn is_jump(self) -> bool {
        self == EdgeKind::Jump
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Normal,
    While,
    DoWhile,
    If,
    Break,
    Continue,
}

/// A run of instructions sharing one graph vertex.
#[derive(Debug, Clone)]
pub struct Group {
    /// Index of the first instruction.
    pub start: usize,
    /// Index of the last instruction, inclusive.
    pub end: usize,
    pub start_address: u32,
    pub end_address: u32,
    pub stack_level: i32,
    pub kind: GroupKind,
    pub start_else: bool,
    /// Else blocks that close after this group.
    pub end_else: Vec<GroupId>,
    pub coalesced_else: bool,
    pub prev: Option<GroupId>,
    pub next: Option<GroupId>,
    pub function: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    DoWhile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loop {
    pub kind: LoopKind,
    /// First group of the loop in address order.
    pub head: GroupId,
    /// Group evaluating the loop condition; `continue` lands here.
    pub cond: GroupId,
    /// Last group in address order; closes the loop.
    pub last: GroupId,
    /// Where `break` lands.
    pub exit: Option<GroupId>,
}

/// Group graph of one script, annotated with structured control constructs.
#[derive(Debug)]
pub struct ControlFlow {
    graph: StableDiGraph<Group, EdgeKind>,
    by_address: HashMap<u32, GroupId>,
    entries: Vec<GroupId>,
    /// First group of each function in address order.
    heads: Vec<Option<GroupId>>,
    loops: Vec<Loop>,
}

impl ControlFlow {
    pub fn build(instrs: &[Instr], functions: &[Function]) -> Result<Self, DecompileError> {
        let mut cf = ControlFlow {
            graph: StableDiGraph::new(),
            by_address: HashMap::new(),
            entries: Vec::new(),
            heads: Vec::new(),
            loops: Vec::new(),
        };
        if instrs.is_empty() {
            return Ok(cf);
        }

        let function_of = function_indices(instrs.len(), functions);
        let starts: HashSet<usize> = functions.iter().map(|f| f.entry).collect();

        let nodes: Vec<GroupId> = instrs
            .iter()
            .enumerate()
            .map(|(i, ins)| {
                cf.graph.add_node(Group {
                    start: i,
                    end: i,
                    start_address: ins.address,
                    end_address: ins.address,
                    stack_level: 0,
                    kind: GroupKind::Normal,
                    start_else: false,
                    end_else: Vec::new(),
                    coalesced_else: false,
                    prev: None,
                    next: None,
                    function: function_of[i],
                })
            })
            .collect();

        for (i, pair) in nodes.windows(2).enumerate() {
            if function_of[i] == function_of[i + 1] {
                cf.graph[pair[0]].next = Some(pair[1]);
                cf.graph[pair[1]].prev = Some(pair[0]);
            }
        }

        let index_of: HashMap<u32, usize> =
            instrs.iter().enumerate().map(|(i, ins)| (ins.address, i)).collect();
        for (i, ins) in instrs.iter().enumerate() {
            let falls = !ins.ends_flow() && i + 1 < instrs.len() && !starts.contains(&(i + 1));
            let mut jump_to = None;
            if ins.is_jump() {
                let dest = ins.dest_address()?;
                let invalid = DecompileError::InvalidJumpTarget {
                    address: ins.address,
                    target: dest,
                };
                if functions.get(function_of[i]).is_some_and(|f| !f.contains(dest)) {
                    return Err(invalid);
                }
                let t = *index_of.get(&dest).ok_or(invalid)?;
                cf.graph.add_edge(nodes[i], nodes[t], EdgeKind::Jump);
                jump_to = Some(t);
            }
            if falls && jump_to != Some(i + 1) {
                cf.graph.add_edge(nodes[i], nodes[i + 1], EdgeKind::Fallthrough);
            }
        }

        cf.entries = functions.iter().map(|f| nodes[f.entry]).collect();
        if cf.entries.is_empty() {
            cf.entries.push(nodes[0]);
        }
        cf.heads = vec![None; functions.len().max(1)];
        for (i, &n) in nodes.iter().enumerate() {
            cf.heads[function_of[i]].get_or_insert(n);
        }

        cf.set_stack_levels(instrs, &nodes);
        cf.create_groups(instrs, &nodes, &starts);
        cf.reindex();
        log::debug!("{} instructions grouped into {} groups", instrs.len(), cf.group_count());

        cf.detect_short_circuit(instrs);
        cf.reindex();
        cf.detect_do_while(instrs)?;
        cf.detect_while(instrs)?;
        cf.detect_break_continue(instrs)?;
        cf.detect_if(instrs)?;
        cf.detect_else(instrs)?;
        cf.detect_elseif(instrs)?;

        for id in cf.groups_in_order() {
            let g = &cf.graph[id];
            log::trace!(
                "group 0x{:04x}..=0x{:04x} level {} {:?}{}",
                g.start_address,
                g.end_address,
                g.stack_level,
                g.kind,
                if g.start_else { " else" } else { "" }
            );
        }
        Ok(cf)
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.graph[id]
    }

    pub fn group_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn entry(&self, function: usize) -> Option<GroupId> {
        self.entries.get(function).copied()
    }

    pub fn group_at(&self, address: u32) -> Option<GroupId> {
        self.by_address.get(&address).copied()
    }

    /// Groups of every function, in address order.
    pub fn groups_in_order(&self) -> Vec<GroupId> {
        (0..self.heads.len()).flat_map(|f| self.function_groups(f)).collect()
    }

    pub fn function_groups(&self, function: usize) -> Vec<GroupId> {
        let mut out = Vec::new();
        let mut cur = self.heads.get(function).copied().flatten();
        while let Some(id) = cur {
            out.push(id);
            cur = self.graph[id].next;
        }
        out
    }

    pub fn successors(&self, id: GroupId) -> Vec<(GroupId, EdgeKind)> {
        self.edges(id, Direction::Outgoing)
    }

    pub fn predecessors(&self, id: GroupId) -> Vec<(GroupId, EdgeKind)> {
        self.edges(id, Direction::Incoming)
    }

    fn edges(&self, id: GroupId, dir: Direction) -> Vec<(GroupId, EdgeKind)> {
        let mut out: Vec<(GroupId, EdgeKind)> = self
            .graph
            .edges_directed(id, dir)
            .map(|e| {
                let other = if dir == Direction::Outgoing { e.target() } else { e.source() };
                (other, *e.weight())
            })
            .collect();
        out.sort_by_key(|(g, _)| self.graph[*g].start_address);
        out
    }

    /// The loop this group closes, if any.
    pub fn closing_loop(&self, id: GroupId) -> Option<&Loop> {
        self.loops.iter().find(|l| l.last == id)
    }

    /// Target group of the jump ending `id`.
    pub fn jump_target(
        &self,
        instrs: &[Instr],
        id: GroupId,
    ) -> Result<Option<GroupId>, DecompileError> {
        let last = &instrs[self.graph[id].end];
        if !last.is_jump() {
            return Ok(None);
        }
        let dest = last.dest_address()?;
        self.group_at(dest).map(Some).ok_or(DecompileError::InvalidJumpTarget {
            address: last.address,
            target: dest,
        })
    }

    fn reindex(&mut self) {
        self.by_address = self
            .graph
            .node_indices()
            .map(|n| (self.graph[n].start_address, n))
            .collect();
    }

    fn set_stack_levels(&mut self, instrs: &[Instr], nodes: &[GroupId]) {
        let mut seen = HashSet::new();
        let roots = self.entries.iter().copied().chain(nodes.iter().copied()).collect::<Vec<_>>();
        for root in roots {
            if seen.contains(&root) {
                continue;
            }
            if !self.entries.contains(&root) {
                log::debug!("unreachable instruction at 0x{:04x}", self.graph[root].start_address);
            }
            let mut stack = vec![(root, 0i32)];
            while let Some((n, level)) = stack.pop() {
                if !seen.insert(n) {
                    let known = self.graph[n].stack_level;
                    if known != level {
                        log::warn!(
                            "inconsistent stack level at 0x{:04x}: {} vs {}, keeping {}",
                            self.graph[n].start_address,
                            known,
                            level,
                            known
                        );
                    }
                    continue;
                }
                self.graph[n].stack_level = level;
                let after = level + instrs[self.graph[n].start].stack_change;
                // Lowest address on top, so the fallthrough path is walked first.
                let mut succs: Vec<GroupId> =
                    self.graph.neighbors_directed(n, Direction::Outgoing).collect();
                succs.sort_by_key(|&s| Reverse(self.graph[s].start_address));
                stack.extend(succs.into_iter().map(|s| (s, after)));
            }
        }
    }

    fn create_groups(&mut self, instrs: &[Instr], nodes: &[GroupId], starts: &HashSet<usize>) {
        let mut cur = nodes[0];
        for i in 1..nodes.len() {
            let n = nodes[i];
            let before = &instrs[i - 1];
            let split = starts.contains(&i)
                || before.is_jump()
                || before.is_return()
                || self.in_degree(n) != 1
                || self.graph[n].stack_level == self.graph[cur].stack_level
                || self.graph[n].function != self.graph[cur].function;
            if split {
                cur = n;
            } else {
                self.merge(cur, n);
            }
        }
    }

    fn in_degree(&self, id: GroupId) -> usize {
        self.graph.edges_directed(id, Direction::Incoming).count()
    }

    /// Folds `g2` into `g1`, which directly precedes it.
    fn merge(&mut self, g1: GroupId, g2: GroupId) {
        let inner: Vec<_> = self
            .graph
            .edges_directed(g1, Direction::Outgoing)
            .filter(|e| e.target() == g2)
            .map(|e| e.id())
            .collect();
        for e in inner {
            self.graph.remove_edge(e);
        }

        let outs: Vec<(GroupId, EdgeKind)> = self
            .graph
            .edges_directed(g2, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
            .collect();
        let ins: Vec<(GroupId, EdgeKind)> = self
            .graph
            .edges_directed(g2, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();
        for (target, kind) in outs {
            let target = if target == g2 { g1 } else { target };
            self.set_edge(g1, target, kind);
        }
        for (source, kind) in ins {
            self.set_edge(source, g1, kind);
        }

        let (end, end_address, next) = {
            let g = &self.graph[g2];
            (g.end, g.end_address, g.next)
        };
        let g = &mut self.graph[g1];
        g.end = end;
        g.end_address = end_address;
        g.next = next;
        if let Some(n) = next {
            self.graph[n].prev = Some(g1);
        }
        self.graph.remove_node(g2);
    }

    fn set_edge(&mut self, from: GroupId, to: GroupId, kind: EdgeKind) {
        match self.graph.find_edge(from, to) {
            Some(e) => self.graph[e] = kind,
            None => {
                self.graph.add_edge(from, to, kind);
            }
        }
    }

    fn ends_in_cond_jump(&self, instrs: &[Instr], id: GroupId) -> bool {
        instrs[self.graph[id].end].is_cond_jump()
    }

    fn ends_in_uncond_jump(&self, instrs: &[Instr], id: GroupId) -> bool {
        instrs[self.graph[id].end].is_uncond_jump()
    }

    fn detect_short_circuit(&mut self, instrs: &[Instr]) {
        for f in 0..self.heads.len() {
            let mut cur = self.function_groups(f).last().copied();
            while let Some(c) = cur {
                let Some(p) = self.graph[c].prev else {
                    break;
                };
                if self.can_short_circuit(instrs, p, c) {
                    log::trace!(
                        "short-circuit 0x{:04x} into 0x{:04x}",
                        self.graph[c].start_address,
                        self.graph[p].start_address
                    );
                    self.merge(p, c);
                }
                cur = Some(p);
            }
        }
    }

    fn can_short_circuit(&self, instrs: &[Instr], prev: GroupId, cur: GroupId) -> bool {
        let (p, c) = (&self.graph[prev], &self.graph[cur]);
        if !self.ends_in_cond_jump(instrs, prev) || !self.ends_in_cond_jump(instrs, cur) {
            return false;
        }
        if p.stack_level != c.stack_level {
            return false;
        }
        let preds = self.predecessors(cur);
        if preds.len() != 1 || preds[0].0 != prev {
            return false;
        }
        let mut allowed: HashSet<GroupId> =
            self.graph.neighbors_directed(cur, Direction::Outgoing).collect();
        allowed.insert(cur);
        self.graph
            .neighbors_directed(prev, Direction::Outgoing)
            .all(|s| allowed.contains(&s))
    }

    fn detect_do_while(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            if self.graph[id].kind != GroupKind::Normal || !self.ends_in_cond_jump(instrs, id) {
                continue;
            }
            let Some(target) = self.jump_target(instrs, id)? else {
                continue;
            };
            if self.graph[target].start_address > self.graph[id].start_address {
                continue;
            }
            if target != id && self.ends_in_cond_jump(instrs, target) {
                if let Some(exit) = self.jump_target(instrs, target)? {
                    if self.graph[exit].start_address > self.graph[id].end_address {
                        continue;
                    }
                }
            }
            self.graph[id].kind = GroupKind::DoWhile;
            self.loops.push(Loop {
                kind: LoopKind::DoWhile,
                head: target,
                cond: id,
                last: id,
                exit: self.graph[id].next,
            });
            log::debug!("do-while loop 0x{:04x}", self.graph[target].start_address);
        }
        Ok(())
    }

    fn detect_while(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            if self.graph[id].kind != GroupKind::Normal || !self.ends_in_cond_jump(instrs, id) {
                continue;
            }
            let Some(exit) = self.jump_target(instrs, id)? else {
                continue;
            };
            let start = self.graph[id].start_address;
            let exit_address = self.graph[exit].start_address;
            if exit_address <= start {
                continue;
            }
            let closing = self
                .predecessors(id)
                .into_iter()
                .filter(|&(src, kind)| {
                    let g = &self.graph[src];
                    kind.is_jump()
                        && g.kind == GroupKind::Normal
                        && g.start_address > start
                        && g.start_address < exit_address
                        && self.ends_in_uncond_jump(instrs, src)
                })
                .map(|(src, _)| src)
                .max_by_key(|&src| self.graph[src].start_address);
            if let Some(last) = closing {
                self.graph[id].kind = GroupKind::While;
                self.loops.push(Loop {
                    kind: LoopKind::While,
                    head: id,
                    cond: id,
                    last,
                    exit: Some(exit),
                });
                log::debug!("while loop 0x{start:04x}");
            }
        }
        Ok(())
    }

    fn loop_contains(&self, l: &Loop, id: GroupId) -> bool {
        let a = self.graph[id].start_address;
        self.graph[l.head].start_address <= a && a <= self.graph[l.last].start_address
    }

    /// Whether landing on `id` from elsewhere stays inside `l`.
    fn loop_contains_target(&self, l: &Loop, id: GroupId) -> bool {
        let a = self.graph[id].start_address;
        self.graph[l.head].start_address < a && a <= self.graph[l.last].start_address
    }

    fn innermost_loop(&self, id: GroupId) -> Option<Loop> {
        self.loops
            .iter()
            .filter(|l| self.loop_contains(l, id))
            .min_by_key(|l| self.graph[l.last].start_address - self.graph[l.head].start_address)
            .copied()
    }

    /// A forward jump from `from` to `to` neither enters nor leaves a loop.
    fn stays_in_loops(&self, from: GroupId, to: GroupId) -> bool {
        self.loops
            .iter()
            .all(|l| self.loop_contains(l, from) == self.loop_contains_target(l, to))
    }

    /// A forward jump from `from` to `to` stays inside every `if` arm enclosing `from`.
    fn stays_in_ifs(
        &self,
        instrs: &[Instr],
        from: GroupId,
        to: GroupId,
    ) -> Result<bool, DecompileError> {
        let a = self.graph[from].start_address;
        let b = self.graph[to].start_address;
        for id in self.graph.node_indices() {
            if id == from || self.graph[id].kind != GroupKind::If {
                continue;
            }
            let Some(t) = self.jump_target(instrs, id)? else {
                continue;
            };
            let end = self.graph[t].start_address;
            if self.graph[id].start_address < a && a < end && b > end {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn detect_break_continue(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            if self.graph[id].kind != GroupKind::Normal || !self.ends_in_uncond_jump(instrs, id) {
                continue;
            }
            let Some(l) = self.innermost_loop(id) else {
                continue;
            };
            if l.last == id {
                continue;
            }
            let target = self.jump_target(instrs, id)?;
            if target.is_some() && target == l.exit {
                self.graph[id].kind = GroupKind::Break;
            } else if target == Some(l.cond) {
                self.graph[id].kind = GroupKind::Continue;
            }
        }
        Ok(())
    }

    fn detect_if(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            if self.graph[id].kind != GroupKind::Normal || !self.ends_in_cond_jump(instrs, id) {
                continue;
            }
            let Some(target) = self.jump_target(instrs, id)? else {
                continue;
            };
            if self.graph[target].start_address <= self.graph[id].start_address {
                continue;
            }
            if self.stays_in_loops(id, target) && self.stays_in_ifs(instrs, id, target)? {
                self.graph[id].kind = GroupKind::If;
            } else {
                log::debug!(
                    "conditional jump at 0x{:04x} left unstructured",
                    self.graph[id].end_address
                );
            }
        }
        Ok(())
    }

    fn detect_else(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            if self.graph[id].kind != GroupKind::If {
                continue;
            }
            let Some(target) = self.jump_target(instrs, id)? else {
                continue;
            };
            if let Some(end) = self.validate_else_block(instrs, id, target)? {
                self.graph[target].start_else = true;
                self.graph[end].end_else.push(target);
                log::trace!("else block at 0x{:04x}", self.graph[target].start_address);
            }
        }
        Ok(())
    }

    /// Returns the group closing the else arm that starts at `target`.
    fn validate_else_block(
        &self,
        instrs: &[Instr],
        cond: GroupId,
        target: GroupId,
    ) -> Result<Option<GroupId>, DecompileError> {
        if self.graph[target].start_else {
            return Ok(None);
        }
        let Some(then_end) = self.graph[target].prev else {
            return Ok(None);
        };
        let g = &self.graph[then_end];
        if then_end == cond
            || g.kind != GroupKind::Normal
            || g.start_address <= self.graph[cond].start_address
            || !self.ends_in_uncond_jump(instrs, then_end)
        {
            return Ok(None);
        }
        let Some(join) = self.jump_target(instrs, then_end)? else {
            return Ok(None);
        };
        if self.graph[join].start_address <= self.graph[target].start_address {
            return Ok(None);
        }
        if !self.stays_in_loops(cond, join) || !self.stays_in_ifs(instrs, cond, join)? {
            return Ok(None);
        }
        Ok(self.graph[join].prev)
    }

    fn detect_elseif(&mut self, instrs: &[Instr]) -> Result<(), DecompileError> {
        for id in self.groups_in_order() {
            let g = &self.graph[id];
            if g.kind != GroupKind::If || !g.start_else {
                continue;
            }
            let Some(outer_end) =
                self.graph.node_indices().find(|&n| self.graph[n].end_else.contains(&id))
            else {
                continue;
            };
            let Some(inner) = self.jump_target(instrs, id)? else {
                continue;
            };
            let closes_together = if self.graph[inner].start_else {
                self.graph[outer_end].end_else.contains(&inner)
            } else {
                self.graph[inner].prev == Some(outer_end)
            };
            if closes_together {
                self.graph[id].coalesced_else = true;
            }
        }
        Ok(())
    }
}

fn function_indices(len: usize, functions: &[Function]) -> Vec<usize> {
    let mut entries: Vec<(usize, usize)> =
        functions.iter().enumerate().map(|(f, func)| (func.entry, f)).collect();
    entries.sort();
    let mut out = vec![0; len];
    let mut current = entries.first().map(|(_, f)| *f).unwrap_or(0);
    let mut pending = entries.iter().peekable();
    for (i, slot) in out.iter_mut().enumerate() {
        while let Some(&&(entry, f)) = pending.peek() {
            if entry > i {
                break;
            }
            current = f;
            pending.next();
        }
        *slot = current;
    }
    out
}
