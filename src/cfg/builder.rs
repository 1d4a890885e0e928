//! Block structuring
//!
//! [`BlockStructurer`] tiles an instruction range with blocks by recursive
//! descent. At every position it asks, in order: is this the head of a loop
//! closed by a backward jump, a for-loop prep, an unconditional jump (break,
//! entry of a bottom-tested loop), or the first test of a condition chain?
//! Anything else belongs to the surrounding statement run.
//!
//! The compiler retargets jumps that land on another unconditional jump, so
//! a jump to the head of a `while` loop from inside its body stands for a
//! jump to the loop's closing back-edge. Targets are normalized accordingly
//! before they are classified.

use crate::ast::condition::Condition;
use crate::cfg::block::{Block, BlockKind, ForBlock, IfBlock, WhileBlock};
use crate::cfg::chain::{chain_condition, closed_prefix, ChainScanner, LocalRanges, Pair};
use crate::cfg::JumpGraph;
use crate::chunk::{Instruction, Prototype};
use crate::error::{Error, Result};
use log::debug;
use std::ops::Range;

/// Innermost-last stack entry for the loops enclosing the range being structured.
#[derive(Debug, Clone, Copy)]
struct LoopContext {
    /// Where `break` lands.
    exit: usize,
    head: usize,
    /// The closing unconditional back-edge of `while` loops.
    back_jump: Option<usize>,
    /// The backward jump closing the loop, conditional or not.
    closing: Option<usize>,
}

pub struct BlockStructurer<'a> {
    code: &'a [Instruction],
    graph: JumpGraph,
    chains: ChainScanner<'a>,
    loops: Vec<LoopContext>,
}

/// Structure a prototype into its block tree.
pub fn structure(proto: &Prototype) -> Result<Block> {
    BlockStructurer::new(proto)?.build()
}

impl<'a> BlockStructurer<'a> {
    pub fn new(proto: &'a Prototype) -> Result<Self> {
        if proto.code.is_empty() {
            return Err(Error::structural(0, "function has no instructions"));
        }
        let graph = JumpGraph::build(&proto.code)?;
        let chains = ChainScanner::new(&proto.code, LocalRanges::new(proto), graph.loop_heads());
        Ok(Self {
            code: &proto.code,
            graph,
            chains,
            loops: Vec::new(),
        })
    }

    pub fn graph(&self) -> &JumpGraph {
        &self.graph
    }

    pub fn build(mut self) -> Result<Block> {
        let len = self.code.len();
        let children = self.sequence(0..len)?;
        let root = Block::new(BlockKind::Function, 0, len, children);
        root.validate()?;
        Ok(root)
    }

    fn normalize(&self, target: usize) -> usize {
        for context in self.loops.iter().rev() {
            if let Some(back_jump) = context.back_jump {
                if target == context.head {
                    return back_jump;
                }
            }
        }
        target
    }

    /// Follow unconditional jumps from `pc` to the instruction that finally runs.
    fn final_target(&self, mut pc: usize) -> usize {
        for _ in 0..self.code.len() {
            let unconditional = pc < self.code.len()
                && self.code[pc].is_jmp()
                && !(pc > 0 && self.code[pc - 1].is_test());
            match self.code.get(pc).and_then(|i| i.jump_target(pc)) {
                Some(next) if unconditional && next != pc => pc = next,
                _ => break,
            }
        }
        pc
    }

    fn is_break(&self, target: usize) -> bool {
        self.loops.last().map_or(false, |context| {
            target == context.exit || self.final_target(target) == self.final_target(context.exit)
        })
    }

    fn with_loop<T>(&mut self, context: LoopContext, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.loops.push(context);
        let result = f(self);
        self.loops.pop();
        result
    }

    /// Tile `range` with blocks and statement runs.
    fn sequence(&mut self, range: Range<usize>) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        let mut run_start = range.start;
        let mut pc = range.start;
        while pc < range.end {
            let Some(block) = self.block_at(pc, range.end)? else {
                pc += 1;
                continue;
            };
            if block.end > range.end {
                return Err(Error::structural(
                    pc,
                    format!(
                        "{} block [{}, {}) crosses the end of its parent at {}",
                        block.kind.name(),
                        block.begin,
                        block.end,
                        range.end
                    ),
                ));
            }
            if run_start < pc {
                blocks.push(Block::leaf(BlockKind::Sequence, run_start, pc));
            }
            pc = block.end;
            run_start = pc;
            blocks.push(block);
        }
        if run_start < range.end {
            blocks.push(Block::leaf(BlockKind::Sequence, run_start, range.end));
        }
        Ok(blocks)
    }

    fn block_at(&mut self, pc: usize, end: usize) -> Result<Option<Block>> {
        // Backward jumps to the head of an enclosing `while` are retargeted
        // jumps to its back-edge, not loops of their own.
        let enclosing = self
            .loops
            .iter()
            .any(|context| context.back_jump.is_some() && context.head == pc);
        let back_jump = if enclosing {
            None
        } else {
            self.graph
                .back_jumps_to(pc)
                .into_iter()
                .filter(|s| *s >= pc && !self.loops.iter().any(|c| c.closing == Some(*s)))
                .last()
        };
        if let Some(back_jump) = back_jump {
            if back_jump >= end {
                return Err(Error::structural(
                    back_jump,
                    format!("loop back to {} crosses the end of its parent at {}", pc, end),
                ));
            }
            let conditional = back_jump > pc && self.code[back_jump - 1].is_test();
            let block = if conditional {
                self.repeat_loop(pc, back_jump)?
            } else {
                self.while_loop(pc, back_jump)?
            };
            return Ok(Some(block));
        }

        let code = self.code;
        match code[pc] {
            Instruction::ForPrep { a, .. } => self.numeric_for(pc, a, end).map(Some),
            Instruction::TForPrep { a, .. } => self.generic_for(pc, a, end).map(Some),
            Instruction::Jmp { .. } => self.jump(pc, end),
            Instruction::ForLoop { .. } | Instruction::TForCall { .. } | Instruction::TForLoop { .. } => {
                Err(Error::structural(
                    pc,
                    format!("{} outside of its loop", code[pc].name()),
                ))
            }
            _ if code[pc].is_test() => self.conditional(pc, end).map(Some),
            _ => Ok(None),
        }
    }

    fn jump(&mut self, pc: usize, end: usize) -> Result<Option<Block>> {
        let raw = self.code[pc]
            .jump_target(pc)
            .ok_or_else(|| Error::structural(pc, "jump before the first instruction"))?;
        if raw == pc + 1 {
            return Ok(None);
        }
        let target = self.normalize(raw);
        if target <= pc {
            return Err(Error::structural(
                pc,
                format!("backward jump to {} does not close a loop", raw),
            ));
        }
        if self.is_break(target) {
            return Ok(Some(Block::leaf(BlockKind::Break, pc, pc + 1)));
        }

        let bottom_test = self
            .graph
            .back_jumps_to(pc + 1)
            .into_iter()
            .filter(|s| *s >= target && *s < end && self.code[*s - 1].is_test())
            .last();
        match bottom_test {
            Some(back_jump) => self.bottom_tested_loop(pc, target, back_jump).map(Some),
            None => Err(Error::structural(
                pc,
                format!("jump to {} crosses block boundaries", target),
            )),
        }
    }

    /// Fail with `cause` when a loop starting inside `range` ends outside it.
    fn check_nesting(&self, range: Range<usize>, cause: usize) -> Result<()> {
        for pc in range.clone() {
            let loop_end = match self.code[pc] {
                Instruction::ForPrep { .. } | Instruction::TForPrep { .. } => self.graph.target(pc),
                _ => self.graph.back_jumps_to(pc).last().copied(),
            };
            if let Some(loop_end) = loop_end {
                if loop_end >= range.end {
                    return Err(Error::structural(
                        cause,
                        format!(
                            "jump to {} lands inside the loop spanning [{}, {}]",
                            range.end, pc, loop_end
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn while_loop(&mut self, head: usize, back_jump: usize) -> Result<Block> {
        let exit = back_jump + 1;
        let (condition, body) = match self.loop_header(head, back_jump)? {
            Some((condition, body_start)) => (Some(condition), body_start..back_jump),
            None => (None, head..back_jump),
        };
        debug!(
            "while loop [{}, {}) {}",
            head,
            exit,
            condition.as_ref().map_or("true".to_string(), |c| c.to_string())
        );
        let context = LoopContext {
            exit,
            head,
            back_jump: Some(back_jump),
            closing: Some(back_jump),
        };
        let children = self.with_loop(context, |s| s.sequence(body.clone()))?;
        Ok(Block::new(
            BlockKind::While(WhileBlock {
                condition,
                body,
                unprotected_target: None,
            }),
            head,
            exit,
            children,
        ))
    }

    /// Condition chain at the top of a `while` loop whose false exit leaves the loop.
    fn loop_header(&self, head: usize, back_jump: usize) -> Result<Option<(Condition, usize)>> {
        let exit = back_jump + 1;
        let mut first_test = head;
        while first_test < back_jump && self.code[first_test].is_value() {
            first_test += 1;
        }
        if !self.chains.is_temporary_run(head..first_test, &[]) {
            return Ok(None);
        }
        let pairs = self.chains.collect(first_test, back_jump, |t| self.normalize(t));
        let closed = closed_prefix(&pairs, &[]);
        let Some(k) = (1..=closed).rev().find(|&k| {
            pairs[k - 1].target == exit && closed_prefix(&pairs[..k], &[]) == k
        }) else {
            return Ok(None);
        };
        let last = pairs[k - 1];
        let condition = chain_condition(self.code, &pairs[..k], last.fallthrough(), exit)?;
        Ok(Some((condition, last.fallthrough())))
    }

    /// Trailing condition chain of a loop closed by a conditional back-edge at `back_jump`.
    fn bottom_chain(&self, region_start: usize, back_jump: usize) -> Option<Vec<Pair>> {
        let loop_target = self.code[back_jump].jump_target(back_jump)?;
        let exit = back_jump + 1;
        let mut candidates = vec![back_jump - 1];
        let mut test = back_jump - 1;
        loop {
            let mut before = test;
            while before > region_start && self.code[before - 1].is_value() {
                before -= 1;
            }
            if before >= region_start + 2
                && self.code[before - 1].is_jmp()
                && self.code[before - 2].is_test()
            {
                test = before - 2;
                candidates.push(test);
            } else {
                break;
            }
        }
        candidates.into_iter().rev().find_map(|start| {
            let pairs = self.chains.collect(start, exit, |t| self.normalize(t));
            let complete = pairs.last().map_or(false, |p| p.jump == back_jump);
            (complete && closed_prefix(&pairs, &[exit, loop_target]) == pairs.len()).then_some(pairs)
        })
    }

    fn repeat_loop(&mut self, head: usize, back_jump: usize) -> Result<Block> {
        let exit = back_jump + 1;
        let pairs = self
            .bottom_chain(head, back_jump)
            .ok_or_else(|| Error::structural(back_jump, "malformed repeat condition"))?;
        let body_end = pairs[0].test;
        let condition = chain_condition(self.code, &pairs, exit, head)?;
        debug!("repeat loop [{}, {}) until {}", head, exit, condition);
        let context = LoopContext {
            exit,
            head,
            back_jump: None,
            closing: Some(back_jump),
        };
        let children = self.with_loop(context, |s| s.sequence(head..body_end))?;
        Ok(Block::new(
            BlockKind::Repeat { condition, body_end },
            head,
            exit,
            children,
        ))
    }

    /// `jmp test; body; test: cond; jmp-if body` loops.
    fn bottom_tested_loop(&mut self, entry: usize, target: usize, back_jump: usize) -> Result<Block> {
        let exit = back_jump + 1;
        let pairs = self
            .bottom_chain(target, back_jump)
            .ok_or_else(|| Error::structural(entry, "malformed loop test"))?;
        if self.code[target..pairs[0].test].iter().any(|i| !i.is_value()) {
            return Err(Error::structural(entry, "loop test mixes statements into its condition"));
        }
        let condition = chain_condition(self.code, &pairs, entry + 1, exit)?;
        debug!("bottom-tested while [{}, {}) test at {}", entry, exit, target);
        let body = entry + 1..target;
        let context = LoopContext {
            exit,
            head: entry + 1,
            back_jump: None,
            closing: Some(back_jump),
        };
        let children = self.with_loop(context, |s| s.sequence(body.clone()))?;
        Ok(Block::new(
            BlockKind::While(WhileBlock {
                condition: Some(condition),
                body,
                unprotected_target: Some(target),
            }),
            entry,
            exit,
            children,
        ))
    }

    fn numeric_for(&mut self, prep: usize, a: usize, end: usize) -> Result<Block> {
        let looping = self
            .graph
            .target(prep)
            .filter(|l| *l < end)
            .filter(|l| matches!(self.code[*l], Instruction::ForLoop { a: b, .. } if b == a))
            .filter(|l| self.graph.target(*l) == Some(prep + 1))
            .ok_or_else(|| Error::structural(prep, "for loop prep without matching loop instruction"))?;

        let mut tail = looping;
        let mut block = ForBlock {
            register: a,
            forvar_close: false,
            inner_close: false,
        };
        if tail > prep + 1 && matches!(self.code[tail - 1], Instruction::Close { a: r } if r == a + 3) {
            block.forvar_close = true;
            tail -= 1;
        }
        if tail > prep + 1 && matches!(self.code[tail - 1], Instruction::Close { a: r } if r > a + 3) {
            block.inner_close = true;
            tail -= 1;
        }
        debug!("numeric for [{}, {}) closes={}", prep, looping + 1, block.closes());

        let context = LoopContext {
            exit: looping + 1,
            head: prep + 1,
            back_jump: None,
            closing: None,
        };
        let children = self.with_loop(context, |s| s.sequence(prep + 1..tail))?;
        Ok(Block::new(BlockKind::NumericFor(block), prep, looping + 1, children))
    }

    fn generic_for(&mut self, prep: usize, a: usize, end: usize) -> Result<Block> {
        let call = self
            .graph
            .target(prep)
            .filter(|c| c + 1 < end)
            .ok_or_else(|| Error::structural(prep, "generic for prep without matching call"))?;
        let variables = match (&self.code[call], &self.code[call + 1]) {
            (Instruction::TForCall { a: ca, results }, Instruction::TForLoop { a: la, .. })
                if *ca == a && *la == a && self.graph.target(call + 1) == Some(prep + 1) =>
            {
                *results
            }
            _ => {
                return Err(Error::structural(
                    prep,
                    "generic for prep without matching call and loop instructions",
                ))
            }
        };
        debug!("generic for [{}, {}) with {} variables", prep, call + 2, variables);

        let context = LoopContext {
            exit: call + 2,
            head: prep + 1,
            back_jump: None,
            closing: None,
        };
        let children = self.with_loop(context, |s| s.sequence(prep + 1..call))?;
        Ok(Block::new(
            BlockKind::GenericFor { register: a, variables },
            prep,
            call + 2,
            children,
        ))
    }

    /// Condition chain starting at `start`: an if, if-else, or if-break.
    fn conditional(&mut self, start: usize, end: usize) -> Result<Block> {
        let pairs = self.chains.collect(start, end, |t| self.normalize(t));
        let k = closed_prefix(&pairs, &[]);
        if k == 0 {
            return Err(Error::unsupported(start, "test without a following jump"));
        }
        let pairs = &pairs[..k];
        let last = pairs[k - 1];
        let then_start = last.fallthrough();
        let false_target = last.target;

        if false_target >= then_start && false_target <= end {
            let condition = chain_condition(self.code, pairs, then_start, false_target)?;
            self.check_nesting(then_start..false_target, last.jump)?;
            let else_end = self.else_target(then_start, false_target, end);
            let then_range = match else_end {
                Some(_) => then_start..false_target - 1,
                None => then_start..false_target,
            };
            let else_range = else_end.map(|e| false_target..e);
            if let Some(range) = &else_range {
                self.check_nesting(range.clone(), false_target - 1)?;
            }
            debug!(
                "if [{}, {}) then {:?} else {:?}",
                start,
                else_end.unwrap_or(false_target),
                then_range,
                else_range
            );
            let mut children = self.sequence(then_range.clone())?;
            if let Some(range) = &else_range {
                children.extend(self.sequence(range.clone())?);
            }
            return Ok(Block::new(
                BlockKind::If(IfBlock {
                    condition,
                    then_range,
                    else_range,
                    then_break: false,
                }),
                start,
                else_end.unwrap_or(false_target),
                children,
            ));
        }

        if self.is_break(false_target) {
            let condition = chain_condition(self.code, pairs, false_target, then_start)?;
            debug!("if-break [{}, {})", start, then_start);
            return Ok(Block::leaf(
                BlockKind::If(IfBlock {
                    condition,
                    then_range: then_start..then_start,
                    else_range: None,
                    then_break: true,
                }),
                start,
                then_start,
            ));
        }

        Err(Error::structural(
            last.jump,
            format!("conditional jump to {} crosses block boundaries", false_target),
        ))
    }

    /// End of the else branch when the then branch closes with a forward skip.
    fn else_target(&self, then_start: usize, false_target: usize, end: usize) -> Option<usize> {
        let skip = false_target.checked_sub(1)?;
        if skip < then_start || !self.code[skip].is_jmp() {
            return None;
        }
        if skip > then_start && self.code[skip - 1].is_test() {
            return None;
        }
        let target = self.normalize(self.code[skip].jump_target(skip)?);
        (target > false_target && target <= end).then_some(target)
    }
}
