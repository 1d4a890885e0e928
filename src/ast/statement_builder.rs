//! Statement assembly
//!
//! Walks a recovered [`Block`] tree and simulates the register file one
//! instruction at a time. Values that are not bound to a name stay *pending*
//! in their register until an instruction consumes them, so nested
//! expressions come out nested. Anything still pending when a statement is
//! emitted is declared as a `local` first, which keeps evaluation order.
//!
//! With debug info, locals are declared exactly where the local variable
//! table says. Stripped functions get synthesized names (`L{depth}_{n}`) for
//! every register that turns out to be read more than once, read out of
//! stack order, or overwritten before use.

use crate::ast::condition::{Condition, Resolver};
use crate::ast::expression::{
    BinaryOp, CallExpression, Closure, Expression, TableConstructor, TableEntry,
    UpvalueRef,
};
use crate::ast::register_manager::{RegisterManager, Slot};
use crate::ast::statement::{Attribute, FunctionBody, LocalDeclaration, Statement};
use crate::ast::target::Target;
use crate::cfg::{Block, BlockKind, ForBlock, IfBlock, WhileBlock};
use crate::chunk::{Constant, FunctionId, Instruction, Operand, Prototype, Register};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

/// Output shaping that does not change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyOptions {
    /// Fold `NEWTABLE` plus the stores that follow it into one constructor.
    pub fold_table_constructors: bool,
    /// Keep the empty `return` every function ends with.
    pub keep_trailing_return: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            fold_table_constructors: true,
            keep_trailing_return: false,
        }
    }
}

/// Assemble the statements of `proto` from its block tree.
///
/// `env` is the index of the upvalue holding `_ENV`, if any; table accesses
/// through it with identifier keys become globals.
pub fn assemble(
    proto: &Prototype,
    id: &FunctionId,
    env: Option<usize>,
    root: &Block,
    options: AssemblyOptions,
) -> Result<FunctionBody> {
    StatementBuilder::new(proto, id.clone(), env, root, options).build(root)
}

/// A value waiting in a register. Multi-result writes span `len` registers
/// from `base` and are only ever consumed or declared together.
#[derive(Debug, Clone, Copy)]
struct Pending {
    pc: usize,
    base: Register,
    len: usize,
}

#[derive(Debug)]
struct DebugLocal {
    register: Register,
    name: String,
    start: usize,
    end: usize,
    internal: bool,
}

/// `x = a or b` built from a single test over a value-only branch.
#[derive(Debug, Clone, Copy)]
struct ValueFold {
    dest: Register,
    source: Register,
    keep_if_truthy: bool,
}

pub struct StatementBuilder<'a> {
    proto: &'a Prototype,
    code: &'a [Instruction],
    id: FunctionId,
    env: Option<usize>,
    options: AssemblyOptions,
    regs: RegisterManager,
    pending: BTreeMap<Register, Pending>,
    /// First register past an open multi-value result.
    open_top: Option<Register>,
    locals: Vec<DebugLocal>,
    declared: Vec<bool>,
    /// Innermost block body containing each instruction.
    regions: Vec<Range<usize>>,
    /// Test operands bound while walking a condition header, keyed by test pc.
    bound: HashMap<(usize, Register), Expression>,
    skip: BTreeSet<usize>,
    names: usize,
}

impl<'a> StatementBuilder<'a> {
    pub fn new(
        proto: &'a Prototype,
        id: FunctionId,
        env: Option<usize>,
        root: &Block,
        options: AssemblyOptions,
    ) -> Self {
        let locals: Vec<DebugLocal> = proto
            .local_registers()
            .into_iter()
            .map(|(register, local)| DebugLocal {
                register,
                name: local.name.clone(),
                start: local.start_pc,
                end: local.end_pc,
                internal: local.is_internal(),
            })
            .collect();
        let mut regions = vec![0..proto.code.len(); proto.code.len()];
        mark_regions(root, &mut regions);
        Self {
            proto,
            code: &proto.code,
            id,
            env,
            options,
            regs: RegisterManager::new(proto.max_registers),
            pending: BTreeMap::new(),
            open_top: None,
            declared: vec![false; locals.len()],
            locals,
            regions,
            bound: HashMap::new(),
            skip: BTreeSet::new(),
            names: 0,
        }
    }

    pub fn build(mut self, root: &Block) -> Result<FunctionBody> {
        let mut params = Vec::with_capacity(self.proto.num_params);
        for register in 0..self.proto.num_params {
            let name = match self.claim(|local| local.register == register && local.start == 0) {
                Some(name) => name,
                None => self.synthesize(),
            };
            self.regs.declare_local(register, name.clone(), 0)?;
            params.push(name);
        }
        let mut body = self.body(root, root.range())?;
        self.flush(&mut body)?;
        log::debug!(
            "function {}: {} top-level statements, {} synthesized names",
            self.id,
            body.len(),
            self.names
        );
        Ok(FunctionBody {
            params,
            is_vararg: self.proto.is_vararg,
            body,
            upvalue_names: self.proto.upvalues.iter().map(|u| u.name.clone()).collect(),
        })
    }

    fn synthesize(&mut self) -> String {
        self.names += 1;
        format!("L{}_{}", self.id.depth(), self.names)
    }

    /// Take the first undeclared debug local matching `predicate`.
    fn claim(&mut self, predicate: impl Fn(&DebugLocal) -> bool) -> Option<String> {
        let index = (0..self.locals.len()).find(|&i| {
            !self.declared[i] && !self.locals[i].internal && predicate(&self.locals[i])
        })?;
        self.declared[index] = true;
        Some(self.locals[index].name.clone())
    }

    fn name_for(&mut self, register: Register, from: usize) -> String {
        let named = self
            .claim(|local| local.register == register && local.start == from)
            .or_else(|| {
                self.claim(|local| {
                    local.register == register && local.start <= from && from < local.end
                })
            });
        match named {
            Some(name) => name,
            None => self.synthesize(),
        }
    }

    // Block walking

    fn body(&mut self, block: &Block, range: Range<usize>) -> Result<Vec<Statement>> {
        let mut out = Vec::new();
        for child in block.children_in(&range) {
            self.end_locals(child.begin, range.end, &mut out)?;
            self.child(child, range.end, &mut out)?;
        }
        guard_terminators(&mut out);
        Ok(out)
    }

    fn child(&mut self, child: &Block, body_end: usize, out: &mut Vec<Statement>) -> Result<()> {
        match &child.kind {
            BlockKind::Sequence => {
                for pc in child.range() {
                    if pc > child.begin {
                        self.end_locals(pc, body_end, out)?;
                    }
                    self.step(pc, body_end, out)?;
                }
                return Ok(());
            }
            BlockKind::Break => {
                self.flush(out)?;
                out.push(Statement::Break);
            }
            BlockKind::If(branch) => self.if_block(child, branch, out)?,
            BlockKind::While(looped) => self.while_block(child, looped, out)?,
            BlockKind::Repeat {
                condition,
                body_end: until,
            } => self.repeat_block(child, condition, *until, out)?,
            BlockKind::NumericFor(looped) => self.numeric_for(child, looped, out)?,
            BlockKind::GenericFor {
                register,
                variables,
            } => self.generic_for(child, *register, *variables, out)?,
            BlockKind::Function => {
                return Err(Error::internal(format!(
                    "function block nested at {} in {}",
                    child.begin, self.id
                )))
            }
        }
        self.declare_locals(child.end - 1, out)
    }

    fn if_block(&mut self, block: &Block, branch: &IfBlock, out: &mut Vec<Statement>) -> Result<()> {
        self.bound.clear();
        if branch.then_break {
            self.header(block.range(), out)?;
            let condition = self.resolve(&branch.condition)?;
            self.flush(out)?;
            out.push(Statement::If {
                condition,
                then_body: vec![Statement::Break],
                else_body: None,
            });
            return Ok(());
        }
        if let Some(fold) = self.value_fold_candidate(block, branch) {
            return self.value_fold(block, branch, fold);
        }

        self.header(block.begin..branch.then_range.start, out)?;
        let condition = self.resolve(&branch.condition)?;
        self.flush(out)?;
        let floor = self.regs.locals_top(self.regs.boundary());
        let hoisted = self.hoist(block, branch, floor, out)?;
        let then_body = self.branch(block, branch.then_range.clone(), floor, &hoisted)?;
        let else_body = match &branch.else_range {
            Some(range) => Some(self.branch(block, range.clone(), floor, &hoisted)?),
            None => None,
        };
        out.push(Statement::If {
            condition,
            then_body,
            else_body,
        });
        Ok(())
    }

    fn branch(
        &mut self,
        block: &Block,
        range: Range<usize>,
        floor: Register,
        hoisted: &[(Register, String)],
    ) -> Result<Vec<Statement>> {
        let mut body = self.body(block, range.clone())?;
        self.flush(&mut body)?;
        if !range.is_empty() {
            self.close_scope(floor, range.end - 1);
            let from = self.regs.boundary().max(range.end);
            for (register, name) in hoisted {
                self.regs.declare_local(*register, name.clone(), from)?;
            }
        }
        Ok(body)
    }

    /// Declare before the `if` the registers its branches leave a value in.
    fn hoist(
        &mut self,
        block: &Block,
        branch: &IfBlock,
        floor: Register,
        out: &mut Vec<Statement>,
    ) -> Result<Vec<(Register, String)>> {
        let code = self.code;
        let mut written = BTreeSet::new();
        for range in block.body_ranges() {
            for instruction in &code[range] {
                written.extend(instruction.writes().into_iter().filter(|r| *r >= floor));
            }
        }
        let mut tested: BTreeSet<Register> =
            branch.condition.registers().into_iter().map(|(r, _)| r).collect();
        for instruction in &code[block.begin..branch.then_range.start] {
            tested.extend(instruction.writes());
        }

        let stripped = !self.proto.has_debug_locals();
        let mut hoisted = Vec::new();
        for register in written {
            let named = self.claim(|local| local.register == register && local.start == block.end);
            let escapes = named.is_some() || (stripped && self.first_access_is_read(register, block.end));
            if !escapes {
                continue;
            }
            if tested.contains(&register) {
                return Err(Error::unsupported(
                    block.begin,
                    format!("conditional expression leaving its value in register {}", register),
                ));
            }
            let name = match named {
                Some(name) => name,
                None => self.synthesize(),
            };
            hoisted.push((register, name));
        }
        if !hoisted.is_empty() {
            let from = self.regs.boundary();
            for (register, name) in &hoisted {
                self.regs.declare_local(*register, name.clone(), from)?;
            }
            out.push(Statement::Local {
                declarations: hoisted.iter().map(|(_, name)| LocalDeclaration::new(name.clone())).collect(),
                values: Vec::new(),
            });
        }
        Ok(hoisted)
    }

    fn first_access_is_read(&self, register: Register, from: usize) -> bool {
        for instruction in self.code.iter().skip(from) {
            if instruction.reads(None).contains(&register) {
                return true;
            }
            if instruction.writes().contains(&register) {
                return false;
            }
        }
        false
    }

    fn value_fold_candidate(&self, block: &Block, branch: &IfBlock) -> Option<ValueFold> {
        if branch.else_range.is_some() {
            return None;
        }
        let (_, test, _) = branch.condition.single_test()?;
        let then = branch.then_range.clone();
        if test != block.begin || then.start != test + 2 || then.is_empty() || then.end != block.end {
            return None;
        }
        let (dest, source, keep_if_truthy) = match self.code[test] {
            Instruction::Test { a, k } => (a, a, k),
            Instruction::TestSet { a, b, k } => (a, b, k),
            _ => return None,
        };
        let at = self.regs.boundary().max(test);
        if self.regs.is_local(dest, at) {
            return None;
        }
        if !matches!(block.children.as_slice(), [child] if child.kind == BlockKind::Sequence) {
            return None;
        }
        let code = &self.code[then.clone()];
        if !code.iter().all(Instruction::is_value) || !code.last()?.writes().contains(&dest) {
            return None;
        }
        if code
            .iter()
            .flat_map(Instruction::writes)
            .any(|r| self.regs.is_local(r, at))
        {
            return None;
        }
        if self
            .locals
            .iter()
            .any(|local| !local.internal && local.start > then.start && local.start < then.end)
        {
            return None;
        }
        Some(ValueFold {
            dest,
            source,
            keep_if_truthy,
        })
    }

    fn value_fold(&mut self, block: &Block, branch: &IfBlock, fold: ValueFold) -> Result<()> {
        let test = block.begin;
        let original = self.value(fold.source, test)?;
        let before: BTreeSet<Register> = self.pending.keys().copied().collect();
        let mut body = Vec::new();
        for pc in branch.then_range.clone() {
            self.execute(pc, branch.then_range.end, &mut body)?;
        }
        let leftovers = self
            .pending
            .keys()
            .any(|r| *r != fold.dest && !before.contains(r));
        if !body.is_empty() || leftovers || !self.pending.contains_key(&fold.dest) {
            return Err(Error::unsupported(test, "conditional value with side effects"));
        }
        let alternative = self.value(fold.dest, block.end)?;
        let op = if fold.keep_if_truthy {
            BinaryOp::Or
        } else {
            BinaryOp::And
        };
        let last = block.end - 1;
        self.regs
            .assign(fold.dest, last, Expression::binary(op, original, alternative))?;
        self.pending.insert(
            fold.dest,
            Pending {
                pc: last,
                base: fold.dest,
                len: 1,
            },
        );
        Ok(())
    }

    fn while_block(&mut self, block: &Block, looped: &WhileBlock, out: &mut Vec<Statement>) -> Result<()> {
        self.flush(out)?;
        self.bound.clear();
        let mut test = Vec::new();
        let (condition, body) = match looped.unprotected_target {
            None => {
                self.header(block.begin..looped.body.start, &mut test)?;
                let condition = self.loop_condition(looped.condition.as_ref(), block.begin)?;
                let floor = self.regs.locals_top(self.regs.boundary());
                let body = self.loop_body(block, looped.body.clone(), floor, block.scope_end())?;
                (condition, body)
            }
            Some(target) => {
                let floor = self.regs.locals_top(self.regs.boundary());
                let body = self.loop_body(block, looped.body.clone(), floor, block.scope_end())?;
                self.header(target..block.end, &mut test)?;
                let condition = self.loop_condition(looped.condition.as_ref(), target)?;
                (condition, body)
            }
        };
        if !test.is_empty() {
            return Err(Error::unsupported(block.begin, "statements inside a loop test"));
        }
        out.push(Statement::While { condition, body });
        Ok(())
    }

    fn loop_condition(&mut self, condition: Option<&Condition>, pc: usize) -> Result<Expression> {
        let expression = match condition {
            Some(condition) => self.resolve(condition)?,
            None => Expression::boolean(true),
        };
        if !self.pending.is_empty() {
            return Err(Error::unsupported(pc, "loop test leaves values behind"));
        }
        Ok(expression)
    }

    fn loop_body(
        &mut self,
        block: &Block,
        range: Range<usize>,
        floor: Register,
        scope_end: usize,
    ) -> Result<Vec<Statement>> {
        let mut body = self.body(block, range)?;
        self.flush(&mut body)?;
        self.close_scope(floor, scope_end);
        Ok(body)
    }

    fn repeat_block(
        &mut self,
        block: &Block,
        condition: &Condition,
        until: usize,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        self.flush(out)?;
        let floor = self.regs.locals_top(self.regs.boundary());
        let mut body = self.body(block, block.begin..until)?;
        // The test still sees the body's locals and pending values.
        self.bound.clear();
        self.header(until..block.end, &mut body)?;
        let condition = self.resolve(condition)?;
        self.flush(&mut body)?;
        guard_terminators(&mut body);
        self.close_scope(floor, block.end - 1);
        out.push(Statement::Repeat { body, condition });
        Ok(())
    }

    fn numeric_for(&mut self, block: &Block, looped: &ForBlock, out: &mut Vec<Statement>) -> Result<()> {
        let prep = block.begin;
        let a = looped.register;
        let (variable, start, stop, step) = self.handle_variable_declarations(prep, a, out)?;
        let body_range = prep + 1..block.end - 1 - looped.closes();
        let body = self.loop_body(block, body_range, a, block.scope_end())?;
        out.push(Statement::NumericFor {
            variable,
            start,
            stop,
            step,
            body,
        });
        Ok(())
    }

    /// Bind the three control values of a numeric for and declare its variable.
    fn handle_variable_declarations(
        &mut self,
        prep: usize,
        a: Register,
        out: &mut Vec<Statement>,
    ) -> Result<(String, Expression, Expression, Expression)> {
        let controls = [a, a + 1, a + 2];
        self.settle(prep, &controls, None, out)?;
        let start = self.value(a, prep)?;
        let stop = self.value(a + 1, prep)?;
        let step = self.value(a + 2, prep)?;
        self.flush(out)?;
        let variable = a + 3;
        let name = match self.claim(|local| {
            local.register == variable && (local.start == prep || local.start == prep + 1)
        }) {
            Some(name) => name,
            None => self.synthesize(),
        };
        self.regs.declare_local(variable, name.clone(), prep + 1)?;
        Ok((name, start, stop, step))
    }

    fn generic_for(
        &mut self,
        block: &Block,
        a: Register,
        variables: usize,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let prep = block.begin;
        let call = block.end - 2;
        let present: Vec<Register> = (a..a + 4)
            .filter(|r| matches!(self.regs.slot(*r, prep), Some(Slot::Temporary(_) | Slot::Local(_))))
            .collect();
        self.settle(prep, &present, None, out)?;
        let mut iterators = Vec::new();
        for register in present {
            match self.pending.get(&register).copied() {
                Some(entry) if entry.base != register => {
                    self.pending.remove(&register);
                }
                _ => iterators.push(self.value(register, prep)?),
            }
        }
        while iterators.len() > 1 && iterators.last().map_or(false, Expression::is_nil) {
            iterators.pop();
        }
        self.flush(out)?;

        let mut names = Vec::with_capacity(variables);
        for register in a + 4..a + 4 + variables {
            let name = match self.claim(|local| {
                local.register == register && local.start >= prep && local.start <= prep + 1
            }) {
                Some(name) => name,
                None => self.synthesize(),
            };
            self.regs.declare_local(register, name.clone(), prep + 1)?;
            names.push(name);
        }
        let body = self.loop_body(block, prep + 1..call, a, block.scope_end())?;
        out.push(Statement::GenericFor {
            variables: names,
            iterators,
            body,
        });
        Ok(())
    }

    /// Walk a condition header: value runs are executed, test operands bound.
    fn header(&mut self, range: Range<usize>, out: &mut Vec<Statement>) -> Result<()> {
        let code = self.code;
        for pc in range.clone() {
            let instruction = &code[pc];
            if instruction.is_jmp() {
                continue;
            }
            if !instruction.is_test() {
                self.step(pc, range.end, out)?;
                continue;
            }
            if let Instruction::TestSet { .. } = instruction {
                return Err(Error::unsupported(pc, "value-producing test inside a condition"));
            }
            let reads = instruction.reads(None);
            self.settle(pc, &reads, None, out)?;
            for register in reads {
                if !self.bound.contains_key(&(pc, register)) {
                    let value = self.value(register, pc)?;
                    self.bound.insert((pc, register), value);
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, condition: &Condition) -> Result<Expression> {
        condition.as_expression(&mut BoundOperands {
            bound: &self.bound,
            proto: self.proto,
        })
    }

    fn close_scope(&mut self, floor: Register, pc: usize) {
        let at = pc.max(self.regs.boundary().saturating_sub(1));
        self.regs.close_scope(floor, at);
    }

    // Locals

    /// Declare the debug locals that become active right after `pc`.
    fn declare_locals(&mut self, pc: usize, out: &mut Vec<Statement>) -> Result<()> {
        let from = pc + 1;
        let registers: Vec<Register> = self
            .locals
            .iter()
            .enumerate()
            .filter(|(i, local)| !self.declared[*i] && !local.internal && local.start == from)
            .map(|(_, local)| local.register)
            .collect();
        if registers.is_empty() {
            return Ok(());
        }
        self.materialize(registers, from, out)
    }

    /// Close debug locals whose scope ends at `pc` before their block does.
    fn end_locals(&mut self, pc: usize, body_end: usize, out: &mut Vec<Statement>) -> Result<()> {
        if pc >= body_end {
            return Ok(());
        }
        let floor = self
            .locals
            .iter()
            .enumerate()
            .filter(|(i, local)| self.declared[*i] && !local.internal && local.end == pc && local.start < pc)
            .filter(|(_, local)| self.regs.local_name(local.register, pc) == Some(local.name.as_str()))
            .map(|(_, local)| local.register)
            .min();
        let Some(floor) = floor else {
            return Ok(());
        };
        self.flush(out)?;
        let scope = self.regs.locals_from(floor, pc);
        wrap_scope(&scope, out);
        self.close_scope(floor, pc - 1);
        Ok(())
    }

    /// Bind pending registers to locals, coalescing consecutive ones.
    fn materialize(
        &mut self,
        registers: impl IntoIterator<Item = Register>,
        from: usize,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let mut set = BTreeSet::new();
        for register in registers {
            match self.pending.get(&register) {
                Some(entry) => set.extend(entry.base..entry.base + entry.len),
                None => {
                    set.insert(register);
                }
            }
        }

        let mut declarations = Vec::new();
        let mut values = Vec::new();
        let mut previous: Option<(Register, usize)> = None;
        let mut sealed = false;
        for register in set {
            if self.regs.is_local(register, from) {
                continue;
            }
            let entry = self.pending.remove(&register);
            let pc = entry.map_or(from, |e| e.pc);
            let continues = !sealed && previous.map_or(false, |(r, p)| r + 1 == register && p <= pc);
            if !continues {
                push_local(&mut declarations, &mut values, out);
            }
            match entry {
                Some(e) if e.base == register => values.push(self.pending_value(register, from)?),
                Some(_) => {}
                None => values.push(Expression::nil()),
            }
            let name = self.name_for(register, from);
            declarations.push(LocalDeclaration::new(name.clone()));
            self.regs.declare_local(register, name, from)?;
            // A multi-value expression must end its list.
            sealed = entry.map_or(false, |e| e.len > 1 && register + 1 == e.base + e.len);
            previous = Some((register, pc));
        }
        push_local(&mut declarations, &mut values, out);
        Ok(())
    }

    fn pending_value(&self, register: Register, from: usize) -> Result<Expression> {
        match self.regs.slot(register, from) {
            Some(Slot::Temporary(expression)) => Ok(expression.clone()),
            _ => Err(Error::internal(format!(
                "register {} is pending without a value at {}",
                register, from
            ))),
        }
    }

    fn flush(&mut self, out: &mut Vec<Statement>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let from = self.regs.boundary();
        let registers: Vec<Register> = self.pending.keys().copied().collect();
        self.materialize(registers, from, out)
    }

    fn statement(&mut self, statement: Statement, out: &mut Vec<Statement>) -> Result<()> {
        self.flush(out)?;
        out.push(statement);
        Ok(())
    }

    // Pending value bookkeeping

    /// Decide which pending registers read at `pc` must become locals first.
    ///
    /// A register is bound to a name when it is read more than once, when a
    /// register above it is still pending, or when it is one part of a
    /// multi-value result.
    fn settle(
        &mut self,
        pc: usize,
        reads: &[Register],
        table: Option<Register>,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let consumed: BTreeSet<Register> = reads
            .iter()
            .copied()
            .filter(|r| Some(*r) != table && self.pending.contains_key(r))
            .collect();
        if consumed.is_empty() {
            return Ok(());
        }
        let whole_groups = matches!(self.code[pc], Instruction::TForPrep { .. });
        let mut force = BTreeSet::new();
        for &register in &consumed {
            let entry = self.pending[&register];
            let split = entry.len > 1
                && !(whole_groups && (entry.base..entry.base + entry.len).all(|r| consumed.contains(&r)));
            let uses = reads.iter().filter(|r| **r == register).count();
            let buried = self
                .pending
                .keys()
                .any(|q| *q > register && Some(*q) != table && !consumed.contains(q));
            if split || buried || self.read_count(register, pc, uses) > 1 {
                force.insert(register);
            }
        }
        if force.is_empty() {
            return Ok(());
        }
        log::debug!("{}: binding registers {:?} read at {}", self.id, force, pc);
        let from = self.regs.boundary();
        self.materialize(force, from, out)
    }

    /// Reads of the value in `register` from `pc` on, stopping at a write that
    /// dominates `pc`. Writes inside a nested body only hide that body.
    fn read_count(&self, register: Register, pc: usize, uses: usize) -> usize {
        let code = self.code;
        let mut count = uses;
        if code[pc].writes().contains(&register) {
            return count;
        }
        let mut hidden: Vec<Range<usize>> = Vec::new();
        for (q, instruction) in code.iter().enumerate().skip(pc + 1) {
            if !hidden.iter().any(|range| range.contains(&q)) {
                count += instruction.reads(None).iter().filter(|r| **r == register).count();
            }
            if count > 1 {
                break;
            }
            if instruction.writes().contains(&register) {
                let region = &self.regions[q];
                if region.contains(&pc) {
                    break;
                }
                hidden.push(q + 1..region.end);
            }
        }
        count
    }

    fn value(&mut self, register: Register, pc: usize) -> Result<Expression> {
        let expression = match self.regs.bind(register, pc)? {
            Slot::Local(name) => return Ok(Expression::Local(name.clone())),
            Slot::Temporary(expression) => expression.clone(),
            Slot::Unassigned => {
                return Err(Error::internal(format!("register {} bound while unassigned", register)))
            }
        };
        if self.pending.remove(&register).is_none() {
            return Err(Error::unresolvable(
                pc,
                format!("register {} is read again after its value was used", register),
            ));
        }
        Ok(expression)
    }

    fn operand(&mut self, operand: Operand, pc: usize) -> Result<Expression> {
        match operand {
            Operand::Register(register) => self.value(register, pc),
            Operand::Constant(index) => constant_expression(self.proto, index, pc),
            Operand::Integer(value) => Ok(Expression::integer(value)),
        }
    }

    fn write(&mut self, register: Register, pc: usize, value: Expression, out: &mut Vec<Statement>) -> Result<()> {
        if self.pending.contains_key(&register) {
            let from = self.regs.boundary();
            self.materialize([register], from, out)?;
        }
        let at = pc.max(self.regs.boundary());
        if let Some(name) = self.regs.local_name(register, at).map(str::to_string) {
            return self.statement(Statement::assign(Target::Local(name), value), out);
        }
        self.regs.assign(register, pc, value)?;
        self.pending.insert(
            register,
            Pending {
                pc,
                base: register,
                len: 1,
            },
        );
        Ok(())
    }

    fn write_group(
        &mut self,
        base: Register,
        len: usize,
        pc: usize,
        value: Expression,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        for register in base..base + len {
            if self.pending.contains_key(&register) {
                let from = self.regs.boundary();
                self.materialize([register], from, out)?;
            }
            if self.regs.is_local(register, pc.max(self.regs.boundary())) {
                return Err(Error::unsupported(pc, "multiple results stored straight into locals"));
            }
        }
        self.regs.assign(base, pc, value)?;
        for register in base + 1..base + len {
            self.regs.assign(register, pc, Expression::nil())?;
        }
        for register in base..base + len {
            self.pending.insert(register, Pending { pc, base, len });
        }
        Ok(())
    }

    // Instructions

    fn step(&mut self, pc: usize, body_end: usize, out: &mut Vec<Statement>) -> Result<()> {
        self.execute(pc, body_end, out)?;
        self.declare_locals(pc, out)
    }

    fn execute(&mut self, pc: usize, body_end: usize, out: &mut Vec<Statement>) -> Result<()> {
        if self.skip.remove(&pc) {
            return Ok(());
        }
        let code = self.code;
        let instruction = &code[pc];
        let top = self.open_top;
        let reads = instruction.reads(top);
        let table = self.folding_table(instruction, pc);
        self.settle(pc, &reads, table, out)?;
        if consumes_open(instruction) {
            self.open_top = None;
        }

        match *instruction {
            Instruction::Move { a, b } => {
                let value = self.value(b, pc)?;
                self.write(a, pc, value, out)?;
            }
            Instruction::LoadK { a, constant } => {
                let value = constant_expression(self.proto, constant, pc)?;
                self.write(a, pc, value, out)?;
            }
            Instruction::LoadInt { a, value } => self.write(a, pc, Expression::integer(value), out)?,
            Instruction::LoadFloat { a, value } => {
                self.write(a, pc, Expression::Constant(Constant::Float(value)), out)?
            }
            Instruction::LoadBool { a, value } => self.write(a, pc, Expression::boolean(value), out)?,
            Instruction::LoadNil { a, count } => {
                for register in a..a + count.max(1) {
                    self.write(register, pc, Expression::nil(), out)?;
                }
            }
            Instruction::GetUpval { a, upvalue } => {
                self.check_upvalue(upvalue, pc)?;
                self.write(a, pc, Expression::Upvalue(upvalue), out)?;
            }
            Instruction::SetUpval { a, upvalue } => {
                self.check_upvalue(upvalue, pc)?;
                let value = self.value(a, pc)?;
                self.statement(Statement::assign(Target::Upvalue(upvalue), value), out)?;
            }
            Instruction::GetTabUp { a, upvalue, key } => {
                self.check_upvalue(upvalue, pc)?;
                let key = self.operand(key, pc)?;
                let value = match self.global_name(upvalue, &key) {
                    Some(name) => Expression::Global(name),
                    None => Expression::index(Expression::Upvalue(upvalue), key),
                };
                self.write(a, pc, value, out)?;
            }
            Instruction::SetTabUp { upvalue, key, value } => {
                self.check_upvalue(upvalue, pc)?;
                let key = self.operand(key, pc)?;
                let value = self.operand(value, pc)?;
                let target = match self.global_name(upvalue, &key) {
                    Some(name) => Target::Global(name),
                    None => Target::Index {
                        table: Expression::Upvalue(upvalue),
                        key,
                    },
                };
                self.statement(Statement::assign(target, value), out)?;
            }
            Instruction::GetTable { a, table: t, key } => {
                let table = self.value(t, pc)?;
                let key = self.operand(key, pc)?;
                self.write(a, pc, Expression::index(table, key), out)?;
            }
            Instruction::SetTable { table: t, key, value } => {
                if table == Some(t) {
                    let key = self.operand(key, pc)?;
                    let value = self.operand(value, pc)?;
                    self.fold_entries(t, pc, vec![TableEntry::Keyed(key, value)])?;
                } else {
                    let table = self.value(t, pc)?;
                    let key = self.operand(key, pc)?;
                    let value = self.operand(value, pc)?;
                    self.statement(Statement::assign(Target::Index { table, key }, value), out)?;
                }
            }
            Instruction::NewTable { a, .. } => {
                self.write(a, pc, Expression::Table(TableConstructor::default()), out)?
            }
            Instruction::SetList { a, count, offset } => {
                let end = match count {
                    Some(n) => a + 1 + n,
                    None => top.unwrap_or(a + 1).max(a + 1),
                };
                let values = (a + 1..end)
                    .map(|r| self.value(r, pc))
                    .collect::<Result<Vec<_>>>()?;
                if table == Some(a) {
                    let entries = values.into_iter().map(TableEntry::Positional).collect();
                    self.fold_entries(a, pc, entries)?;
                } else {
                    self.list_stores(a, pc, offset, values, out)?;
                }
            }
            Instruction::Method { a, object, key } => {
                let object = self.value(object, pc)?;
                let name = self.method_name(key, pc)?;
                self.write(
                    a,
                    pc,
                    Expression::Method {
                        object: Box::new(object),
                        name,
                    },
                    out,
                )?;
                self.write(a + 1, pc, Expression::SelfArgument, out)?;
            }
            Instruction::Binary { a, op, left, right } => {
                let left = self.operand(left, pc)?;
                let right = self.operand(right, pc)?;
                self.write(a, pc, Expression::binary(BinaryOp::from(op), left, right), out)?;
            }
            Instruction::Unary { a, op, operand } => {
                let operand = self.value(operand, pc)?;
                self.write(a, pc, Expression::unary(op, operand), out)?;
            }
            Instruction::Concat { a, count } => {
                let parts = (a..a + count)
                    .map(|r| self.value(r, pc))
                    .collect::<Result<Vec<_>>>()?;
                self.write(a, pc, Expression::Concat(parts), out)?;
            }
            Instruction::Close { a } => self.close(a, pc, body_end, out)?,
            Instruction::Tbc { a } => self.mark_to_be_closed(a, pc, out)?,
            Instruction::Jmp { .. } => {}
            Instruction::Compare { .. } | Instruction::Test { .. } | Instruction::TestSet { .. } => {
                return Err(Error::unsupported(
                    pc,
                    format!("{} outside of a control structure", instruction.name()),
                ));
            }
            Instruction::Call { a, args, results } => {
                let mut call = self.call(a, args, top, pc)?;
                match results {
                    Some(0) => self.statement(Statement::Call(call), out)?,
                    Some(1) => self.write(a, pc, Expression::Call(Box::new(call)), out)?,
                    None => {
                        call.multi = true;
                        self.write(a, pc, Expression::Call(Box::new(call)), out)?;
                        self.open_top = Some(a + 1);
                    }
                    Some(n) => {
                        call.multi = true;
                        self.write_group(a, n, pc, Expression::Call(Box::new(call)), out)?;
                    }
                }
            }
            Instruction::TailCall { a, args } => {
                let mut call = self.call(a, args, top, pc)?;
                call.multi = true;
                self.statement(Statement::Return(vec![Expression::Call(Box::new(call))]), out)?;
                if matches!(code.get(pc + 1), Some(Instruction::Return { .. })) {
                    self.skip.insert(pc + 1);
                }
            }
            Instruction::Return { a, count } => {
                let end = match count {
                    Some(n) => a + n,
                    None => top.unwrap_or(a).max(a),
                };
                let values = (a..end)
                    .map(|r| self.value(r, pc))
                    .collect::<Result<Vec<_>>>()?;
                let trailing = pc + 1 == code.len() && values.is_empty();
                let redundant = !self.options.keep_trailing_return
                    || out.last().map_or(false, Statement::is_terminator);
                if !(trailing && redundant) {
                    self.statement(Statement::Return(values), out)?;
                }
            }
            Instruction::Closure { a, proto } => self.closure(a, proto, pc, out)?,
            Instruction::VarArg { a, count } => match count {
                Some(0) => {}
                Some(1) => self.write(a, pc, Expression::VarArg { multi: false }, out)?,
                None => {
                    self.write(a, pc, Expression::VarArg { multi: true }, out)?;
                    self.open_top = Some(a + 1);
                }
                Some(n) => self.write_group(a, n, pc, Expression::VarArg { multi: true }, out)?,
            },
            Instruction::ForPrep { .. }
            | Instruction::ForLoop { .. }
            | Instruction::TForPrep { .. }
            | Instruction::TForCall { .. }
            | Instruction::TForLoop { .. } => {
                return Err(Error::structural(
                    pc,
                    format!("{} outside of its loop", instruction.name()),
                ));
            }
        }
        Ok(())
    }

    fn call(&mut self, a: Register, args: Option<usize>, top: Option<Register>, pc: usize) -> Result<CallExpression> {
        let function = self.value(a, pc)?;
        let end = match args {
            Some(n) => a + 1 + n,
            None => top.unwrap_or(a + 1).max(a + 1),
        };
        let mut arguments = (a + 1..end)
            .map(|r| self.value(r, pc))
            .collect::<Result<Vec<_>>>()?;
        let (function, method) = match function {
            Expression::Method { object, name } if arguments.first() == Some(&Expression::SelfArgument) => {
                arguments.remove(0);
                (*object, Some(name))
            }
            other => (other, None),
        };
        Ok(CallExpression {
            function,
            method,
            args: arguments,
            multi: false,
        })
    }

    fn closure(&mut self, a: Register, index: usize, pc: usize, out: &mut Vec<Statement>) -> Result<()> {
        let child = self.proto.prototypes.get(index).ok_or_else(|| {
            Error::unresolvable(pc, format!("closure refers to missing prototype {}", index))
        })?;
        let function = self.id.child(index);
        let recursive = child.upvalues.iter().any(|u| u.in_stack && u.index == a)
            && !self.regs.is_local(a, pc.max(self.regs.boundary()));
        let mut name = None;
        if recursive {
            self.flush(out)?;
            let local = match self.claim(|l| l.register == a && (l.start == pc || l.start == pc + 1)) {
                Some(local) => local,
                None => self.synthesize(),
            };
            self.regs.declare_local(a, local.clone(), pc)?;
            name = Some(local);
        }

        let mut upvalues = Vec::with_capacity(child.upvalues.len());
        for upvalue in &child.upvalues {
            if !upvalue.in_stack {
                upvalues.push(UpvalueRef::Parent(upvalue.index));
                continue;
            }
            if self.pending.contains_key(&upvalue.index) {
                let from = self.regs.boundary();
                self.materialize([upvalue.index], from, out)?;
            }
            let at = pc.max(self.regs.boundary());
            match self.regs.local_name(upvalue.index, at) {
                Some(local) => upvalues.push(UpvalueRef::Local(local.to_string())),
                None => {
                    return Err(Error::unresolvable(
                        pc,
                        format!("closure captures register {} which holds no local", upvalue.index),
                    ))
                }
            }
        }

        let closure = Closure { function, upvalues };
        match name {
            Some(name) => {
                out.push(Statement::LocalFunction {
                    name,
                    function: closure,
                });
                Ok(())
            }
            None => self.write(a, pc, Expression::Closure(closure), out),
        }
    }

    fn close(&mut self, a: Register, pc: usize, body_end: usize, out: &mut Vec<Statement>) -> Result<()> {
        let at_end = pc + 1 >= body_end
            || matches!(
                self.code.get(pc + 1),
                Some(Instruction::Jmp { .. } | Instruction::Return { .. } | Instruction::TailCall { .. })
            );
        if at_end {
            return Ok(());
        }
        self.flush(out)?;
        let scope = self.regs.locals_from(a, pc);
        wrap_scope(&scope, out);
        self.close_scope(a, pc);
        Ok(())
    }

    fn mark_to_be_closed(&mut self, a: Register, pc: usize, out: &mut Vec<Statement>) -> Result<()> {
        if self.pending.contains_key(&a) {
            let from = self.regs.boundary();
            self.materialize([a], from, out)?;
        }
        let at = pc.max(self.regs.boundary());
        let Some(name) = self.regs.local_name(a, at).map(str::to_string) else {
            return Err(Error::unresolvable(pc, format!("to-be-closed register {} holds no local", a)));
        };
        for statement in out.iter_mut().rev() {
            if let Statement::Local { declarations, .. } = statement {
                if let Some(declaration) = declarations.iter_mut().find(|d| d.name == name) {
                    declaration.attribute = Some(Attribute::Close);
                    return Ok(());
                }
            }
        }
        Err(Error::unsupported(
            pc,
            format!("to-be-closed variable {} is declared outside the current block", name),
        ))
    }

    fn list_stores(
        &mut self,
        a: Register,
        pc: usize,
        offset: usize,
        values: Vec<Expression>,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        if values.last().map_or(false, Expression::is_multi) {
            return Err(Error::unsupported(pc, "open list store outside a table constructor"));
        }
        let table = self.value(a, pc)?;
        if !matches!(table, Expression::Local(_) | Expression::Global(_) | Expression::Upvalue(_)) {
            return Err(Error::unsupported(pc, "list store into a computed table"));
        }
        self.flush(out)?;
        for (i, value) in values.into_iter().enumerate() {
            let key = Expression::integer((offset + i + 1) as i64);
            out.push(Statement::assign(
                Target::Index {
                    table: table.clone(),
                    key,
                },
                value,
            ));
        }
        Ok(())
    }

    /// The pending constructor a table store at `pc` folds into, if any.
    fn folding_table(&self, instruction: &Instruction, pc: usize) -> Option<Register> {
        if !self.options.fold_table_constructors {
            return None;
        }
        let register = match instruction {
            Instruction::SetTable { table, .. } => *table,
            Instruction::SetList { a, .. } => *a,
            _ => return None,
        };
        if !self.pending.contains_key(&register) {
            return None;
        }
        match self.regs.slot(register, pc) {
            Some(Slot::Temporary(Expression::Table(_))) => Some(register),
            _ => None,
        }
    }

    fn fold_entries(&mut self, register: Register, pc: usize, entries: Vec<TableEntry>) -> Result<()> {
        let mut constructor = match self.regs.slot(register, pc) {
            Some(Slot::Temporary(Expression::Table(constructor))) => constructor.clone(),
            _ => {
                return Err(Error::internal(format!(
                    "register {} holds no table constructor at {}",
                    register, pc
                )))
            }
        };
        constructor.entries.extend(entries);
        self.regs.assign(register, pc, Expression::Table(constructor))
    }

    fn check_upvalue(&self, index: usize, pc: usize) -> Result<()> {
        if index >= self.proto.upvalues.len() {
            return Err(Error::unresolvable(
                pc,
                format!("upvalue {} out of range ({} upvalues)", index, self.proto.upvalues.len()),
            ));
        }
        Ok(())
    }

    fn global_name(&self, upvalue: usize, key: &Expression) -> Option<String> {
        if self.env != Some(upvalue) {
            return None;
        }
        key.as_identifier().map(str::to_string)
    }

    fn method_name(&self, key: Operand, pc: usize) -> Result<String> {
        match key {
            Operand::Constant(index) => constant_expression(self.proto, index, pc)?
                .as_identifier()
                .map(str::to_string)
                .ok_or_else(|| Error::unsupported(pc, "method name is not an identifier")),
            _ => Err(Error::unsupported(pc, "method name is not a constant")),
        }
    }
}

/// Operands bound during the header walk, looked up again by the condition.
struct BoundOperands<'s> {
    bound: &'s HashMap<(usize, Register), Expression>,
    proto: &'s Prototype,
}

impl Resolver for BoundOperands<'_> {
    fn register(&mut self, register: Register, pc: usize) -> Result<Expression> {
        self.bound.get(&(pc, register)).cloned().ok_or_else(|| {
            Error::internal(format!("register {} was not bound at test {}", register, pc))
        })
    }

    fn operand(&mut self, operand: Operand, pc: usize) -> Result<Expression> {
        match operand {
            Operand::Register(register) => self.register(register, pc),
            Operand::Constant(index) => constant_expression(self.proto, index, pc),
            Operand::Integer(value) => Ok(Expression::integer(value)),
        }
    }
}

fn constant_expression(proto: &Prototype, index: usize, pc: usize) -> Result<Expression> {
    proto
        .constant(index)
        .cloned()
        .map(Expression::Constant)
        .ok_or_else(|| {
            Error::unresolvable(
                pc,
                format!("constant {} out of range ({} constants)", index, proto.constants.len()),
            )
        })
}

fn consumes_open(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Call { args: None, .. }
            | Instruction::TailCall { args: None, .. }
            | Instruction::Return { count: None, .. }
            | Instruction::SetList { count: None, .. }
    )
}

fn mark_regions(block: &Block, regions: &mut [Range<usize>]) {
    for range in block.body_ranges() {
        for pc in range.clone() {
            if let Some(region) = regions.get_mut(pc) {
                *region = range.clone();
            }
        }
    }
    for child in &block.children {
        mark_regions(child, regions);
    }
}

fn push_local(declarations: &mut Vec<LocalDeclaration>, values: &mut Vec<Expression>, out: &mut Vec<Statement>) {
    if declarations.is_empty() {
        return;
    }
    let mut values = std::mem::take(values);
    while values.last().map_or(false, Expression::is_nil) {
        values.pop();
    }
    out.push(Statement::Local {
        declarations: std::mem::take(declarations),
        values,
    });
}

/// Wrap everything from the first declaration of `scope` on in `do ... end`.
fn wrap_scope(scope: &[(Register, String)], out: &mut Vec<Statement>) {
    let first = out
        .iter()
        .position(|statement| scope.iter().any(|(_, name)| statement.declares(name)));
    if let Some(index) = first {
        let mut inner = out.split_off(index);
        guard_terminators(&mut inner);
        out.push(Statement::Do(inner));
    }
}

/// `return` and `break` must end their block; earlier ones get their own `do`.
fn guard_terminators(statements: &mut [Statement]) {
    let last = statements.len().saturating_sub(1);
    for statement in statements.iter_mut().take(last) {
        if statement.is_terminator() {
            let inner = std::mem::replace(statement, Statement::Break);
            *statement = Statement::Do(vec![inner]);
        }
    }
}
