//! Structured blocks
//!
//! A [`Block`] is a control construct recovered from an instruction range.
//! Blocks own their header and tail instructions (loop tests, for-loop
//! control instructions, the else-skip jump); everything else in their range
//! is covered by children, in order, without gaps.

use crate::ast::condition::Condition;
use crate::chunk::{Prototype, Register};
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt::Write;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhileBlock {
    /// `None` for `while true`.
    pub condition: Option<Condition>,
    pub body: Range<usize>,
    /// Start of the loop test for bottom-tested loops entered by a forward jump.
    pub unprotected_target: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForBlock {
    /// Base of the control registers; the loop variable is `register + 3`.
    pub register: Register,
    /// A `Close` of the loop variable precedes the `ForLoop`.
    pub forvar_close: bool,
    /// A `Close` of the body locals precedes the `ForLoop`.
    pub inner_close: bool,
}

impl ForBlock {
    pub fn closes(&self) -> usize {
        self.forvar_close as usize + self.inner_close as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfBlock {
    /// Condition for entering the then branch.
    pub condition: Condition,
    pub then_range: Range<usize>,
    pub else_range: Option<Range<usize>>,
    /// `if ... then break end`, whose jump leaves the enclosing loop.
    pub then_break: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Function,
    While(WhileBlock),
    Repeat {
        condition: Condition,
        /// First instruction of the `until` test.
        body_end: usize,
    },
    NumericFor(ForBlock),
    GenericFor {
        register: Register,
        variables: usize,
    },
    If(IfBlock),
    Break,
    /// A run of plain statements.
    Sequence,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Function => "function",
            BlockKind::While(w) if w.unprotected_target.is_some() => "while (bottom-tested)",
            BlockKind::While(_) => "while",
            BlockKind::Repeat { .. } => "repeat",
            BlockKind::NumericFor(_) => "numeric for",
            BlockKind::GenericFor { .. } => "generic for",
            BlockKind::If(i) if i.then_break => "if-break",
            BlockKind::If(_) => "if",
            BlockKind::Break => "break",
            BlockKind::Sequence => "sequence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub kind: BlockKind,
    pub begin: usize,
    pub end: usize,
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(kind: BlockKind, begin: usize, end: usize, children: Vec<Block>) -> Self {
        Self {
            kind,
            begin,
            end,
            children,
        }
    }

    pub fn leaf(kind: BlockKind, begin: usize, end: usize) -> Self {
        Self::new(kind, begin, end, Vec::new())
    }

    pub fn range(&self) -> Range<usize> {
        self.begin..self.end
    }

    /// Last instruction at which locals declared in the block body are live.
    pub fn scope_end(&self) -> usize {
        match &self.kind {
            BlockKind::While(WhileBlock {
                unprotected_target: Some(target),
                ..
            }) => target.saturating_sub(1),
            BlockKind::While(_) => self.end.saturating_sub(2),
            BlockKind::NumericFor(f) => self.end.saturating_sub(2 + f.closes()),
            BlockKind::GenericFor { .. } => self.end.saturating_sub(3),
            _ => self.end.saturating_sub(1),
        }
    }

    /// Whether a `break` may target this block.
    pub fn breakable(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::While(_)
                | BlockKind::Repeat { .. }
                | BlockKind::NumericFor(_)
                | BlockKind::GenericFor { .. }
        )
    }

    pub fn is_unprotected(&self) -> bool {
        self.unprotected_target().is_some()
    }

    pub fn unprotected_target(&self) -> Option<usize> {
        match &self.kind {
            BlockKind::While(w) => w.unprotected_target,
            _ => None,
        }
    }

    /// Source line of the bottom test of an unprotected loop.
    pub fn unprotected_line(&self, proto: &Prototype) -> Option<usize> {
        self.unprotected_target()
            .and_then(|_| proto.line(self.end - 1))
    }

    /// Instruction the loop's back-edge jumps to.
    ///
    /// # Panics
    ///
    /// Panics when called on a block that is not a loop.
    pub fn loopback(&self) -> usize {
        match &self.kind {
            BlockKind::While(w) if w.unprotected_target.is_some() => self.begin + 1,
            BlockKind::While(_) | BlockKind::Repeat { .. } => self.begin,
            BlockKind::NumericFor(_) | BlockKind::GenericFor { .. } => self.begin + 1,
            other => panic!("loopback requested on a {} block", other.name()),
        }
    }

    /// Where a `break` out of this block lands.
    pub fn break_target(&self) -> Option<usize> {
        self.breakable().then_some(self.end)
    }

    /// Sub-ranges of this block that children cover.
    pub fn body_ranges(&self) -> Vec<Range<usize>> {
        match &self.kind {
            BlockKind::Function => vec![self.range()],
            BlockKind::While(w) => vec![w.body.clone()],
            BlockKind::Repeat { body_end, .. } => vec![self.begin..*body_end],
            BlockKind::NumericFor(f) => vec![self.begin + 1..self.end - 1 - f.closes()],
            BlockKind::GenericFor { .. } => vec![self.begin + 1..self.end - 2],
            BlockKind::If(i) => {
                let mut ranges = vec![i.then_range.clone()];
                ranges.extend(i.else_range.clone());
                ranges
            }
            BlockKind::Break | BlockKind::Sequence => Vec::new(),
        }
    }

    /// Children lying inside `range`.
    pub fn children_in(&self, range: &Range<usize>) -> impl Iterator<Item = &Block> {
        let range = range.clone();
        self.children
            .iter()
            .filter(move |child| child.begin >= range.start && child.end <= range.end)
    }

    /// Check nesting: non-empty ranges, children tiling the body ranges in order.
    pub fn validate(&self) -> Result<()> {
        if self.begin >= self.end {
            return Err(Error::structural(
                self.begin,
                format!("empty {} block [{}, {})", self.kind.name(), self.begin, self.end),
            ));
        }
        let mut children = self.children.iter().peekable();
        for range in self.body_ranges() {
            if range.start < self.begin || range.end > self.end {
                return Err(Error::structural(
                    range.start,
                    format!("body [{}, {}) leaves its {} block", range.start, range.end, self.kind.name()),
                ));
            }
            let mut at = range.start;
            while let Some(child) = children.next_if(|child| child.begin < range.end) {
                if child.begin > at {
                    return Err(Error::structural(at, "gap in block body"));
                }
                if child.begin < at || child.end > range.end {
                    return Err(Error::structural(
                        child.begin,
                        format!(
                            "{} block [{}, {}) does not nest at {}",
                            child.kind.name(),
                            child.begin,
                            child.end,
                            at
                        ),
                    ));
                }
                child.validate()?;
                at = child.end;
            }
            if at != range.end {
                return Err(Error::structural(at, "gap in block body"));
            }
        }
        if let Some(child) = children.next() {
            return Err(Error::structural(
                child.begin,
                format!("{} block lies outside its parent body", child.kind.name()),
            ));
        }
        Ok(())
    }

    /// Indented one-line-per-block rendering.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let _ = write!(out, "{}{} [{}, {})", "  ".repeat(depth), self.kind.name(), self.begin, self.end);
        match &self.kind {
            BlockKind::While(WhileBlock {
                condition: Some(condition),
                ..
            })
            | BlockKind::Repeat { condition, .. }
            | BlockKind::If(IfBlock { condition, .. }) => {
                let _ = write!(out, " {}", condition);
            }
            BlockKind::NumericFor(f) if f.closes() > 0 => {
                let _ = write!(out, " closes={}", f.closes());
            }
            _ => {}
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_for(forvar_close: bool, inner_close: bool) -> Block {
        let closes = forvar_close as usize + inner_close as usize;
        Block::new(
            BlockKind::NumericFor(ForBlock {
                register: 0,
                forvar_close,
                inner_close,
            }),
            0,
            6,
            vec![Block::leaf(BlockKind::Sequence, 1, 5 - closes)],
        )
    }

    #[test]
    fn test_for_scope_end_tracks_closes() {
        let plain = numeric_for(false, false);
        assert_eq!(plain.scope_end(), 4);
        assert_eq!(numeric_for(true, false).scope_end(), 3);
        assert_eq!(numeric_for(false, true).scope_end(), 3);
        assert_eq!(numeric_for(true, true).scope_end(), 2);
        plain.validate().unwrap();
        numeric_for(true, true).validate().unwrap();
    }

    #[test]
    fn test_loopback() {
        let pre = Block::new(
            BlockKind::While(WhileBlock {
                condition: None,
                body: 0..3,
                unprotected_target: None,
            }),
            0,
            4,
            vec![Block::leaf(BlockKind::Sequence, 0, 3)],
        );
        assert_eq!(pre.loopback(), 0);
        assert!(!pre.is_unprotected());
        assert_eq!(pre.break_target(), Some(4));

        let bottom = Block::new(
            BlockKind::While(WhileBlock {
                condition: Some(Condition::Test { register: 0, pc: 3 }),
                body: 1..3,
                unprotected_target: Some(3),
            }),
            0,
            5,
            vec![Block::leaf(BlockKind::Sequence, 1, 3)],
        );
        assert_eq!(bottom.loopback(), 1);
        assert!(bottom.is_unprotected());
        assert_eq!(bottom.scope_end(), 2);
        bottom.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "loopback")]
    fn test_loopback_on_sequence_panics() {
        Block::leaf(BlockKind::Sequence, 0, 1).loopback();
    }

    #[test]
    fn test_validate_rejects_gaps_and_overlaps() {
        let gap = Block::new(
            BlockKind::Function,
            0,
            4,
            vec![
                Block::leaf(BlockKind::Sequence, 0, 1),
                Block::leaf(BlockKind::Sequence, 2, 4),
            ],
        );
        assert_eq!(gap.validate().unwrap_err().pc(), Some(1));

        let overlap = Block::new(
            BlockKind::Function,
            0,
            4,
            vec![
                Block::leaf(BlockKind::Sequence, 0, 3),
                Block::leaf(BlockKind::Sequence, 2, 4),
            ],
        );
        assert_eq!(overlap.validate().unwrap_err().pc(), Some(2));
    }

    #[test]
    fn test_dump() {
        let block = Block::new(
            BlockKind::Function,
            0,
            2,
            vec![Block::leaf(BlockKind::Sequence, 0, 2)],
        );
        assert_eq!(block.dump(), "function [0, 2)\n  sequence [0, 2)\n");
    }
}
