//! Boolean conditions built from test/jump patterns
//!
//! A [`Condition`] is assembled while the block structure is recovered, long
//! before any register holds a symbolic value. It only records which
//! registers and operands are tested at which instruction; turning it into an
//! [`Expression`] happens later through a [`Resolver`].

use crate::ast::expression::{BinaryOp, Expression};
use crate::chunk::{CompareOp, Instruction, Operand, Register, UnOp};
use crate::error::Result;
use serde::Serialize;
use std::fmt;

/// Supplies expressions for the operands a condition refers to.
pub trait Resolver {
    fn register(&mut self, register: Register, pc: usize) -> Result<Expression>;
    fn operand(&mut self, operand: Operand, pc: usize) -> Result<Expression>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// `left op right`, evaluated at `pc`.
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
        pc: usize,
    },
    /// Truthiness of a register at `pc`.
    Test { register: Register, pc: usize },
    Constant { value: bool },
    Not { operand: Box<Condition> },
    And {
        left: Box<Condition>,
        right: Box<Condition>,
    },
    Or {
        left: Box<Condition>,
        right: Box<Condition>,
    },
}

impl Condition {
    /// The condition under which the jump following a test instruction is taken.
    pub fn from_test(instruction: &Instruction, pc: usize) -> Option<Self> {
        let (leaf, k) = match instruction {
            Instruction::Compare { op, left, right, k } => (
                Condition::Compare {
                    op: *op,
                    left: *left,
                    right: *right,
                    pc,
                },
                *k,
            ),
            Instruction::Test { a, k } => (Condition::Test { register: *a, pc }, *k),
            Instruction::TestSet { b, k, .. } => (Condition::Test { register: *b, pc }, *k),
            _ => return None,
        };
        Some(if k { leaf } else { leaf.negate() })
    }

    pub fn and(left: Condition, right: Condition) -> Self {
        Condition::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Condition, right: Condition) -> Self {
        Condition::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Logical negation, pushed through `and`/`or`.
    pub fn negate(self) -> Self {
        match self {
            Condition::Not { operand } => *operand,
            Condition::Constant { value } => Condition::Constant { value: !value },
            Condition::And { left, right } => Condition::or(left.negate(), right.negate()),
            Condition::Or { left, right } => Condition::and(left.negate(), right.negate()),
            leaf => Condition::Not {
                operand: Box::new(leaf),
            },
        }
    }

    /// Registers tested directly by the leaves, with the instruction testing them.
    pub fn registers(&self) -> Vec<(Register, usize)> {
        let mut out = Vec::new();
        self.collect_registers(&mut out);
        out
    }

    fn collect_registers(&self, out: &mut Vec<(Register, usize)>) {
        match self {
            Condition::Compare { left, right, pc, .. } => {
                out.extend(left.register().map(|r| (r, *pc)));
                out.extend(right.register().map(|r| (r, *pc)));
            }
            Condition::Test { register, pc } => out.push((*register, *pc)),
            Condition::Constant { .. } => {}
            Condition::Not { operand } => operand.collect_registers(out),
            Condition::And { left, right } | Condition::Or { left, right } => {
                left.collect_registers(out);
                right.collect_registers(out);
            }
        }
    }

    /// The single register test this condition consists of, and whether it is negated.
    pub fn single_test(&self) -> Option<(Register, usize, bool)> {
        match self {
            Condition::Test { register, pc } => Some((*register, *pc, false)),
            Condition::Not { operand } => match operand.as_ref() {
                Condition::Test { register, pc } => Some((*register, *pc, true)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Resolve into a boolean expression, leaves left to right.
    pub fn as_expression<R: Resolver + ?Sized>(&self, resolver: &mut R) -> Result<Expression> {
        Ok(match self {
            Condition::Compare { op, left, right, pc } => {
                let left = resolver.operand(*left, *pc)?;
                let right = resolver.operand(*right, *pc)?;
                Expression::binary(BinaryOp::from(*op), left, right)
            }
            Condition::Test { register, pc } => resolver.register(*register, *pc)?,
            Condition::Constant { value } => Expression::boolean(*value),
            Condition::Not { operand } => match operand.as_expression(resolver)? {
                cmp @ Expression::Binary { op: BinaryOp::Eq, .. } => cmp.negate(),
                other => Expression::unary(UnOp::Not, other),
            },
            Condition::And { left, right } => {
                let left = left.as_expression(resolver)?;
                let right = right.as_expression(resolver)?;
                Expression::binary(BinaryOp::And, left, right)
            }
            Condition::Or { left, right } => {
                let left = left.as_expression(resolver)?;
                let right = right.as_expression(resolver)?;
                Expression::binary(BinaryOp::Or, left, right)
            }
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { op, left, right, .. } => {
                let symbol = BinaryOp::from(*op).symbol();
                write!(f, "{} {} {}", left, symbol, right)
            }
            Condition::Test { register, .. } => write!(f, "r{}", register),
            Condition::Constant { value } => write!(f, "{}", value),
            Condition::Not { operand } => write!(f, "not ({})", operand),
            Condition::And { left, right } => write!(f, "({} and {})", left, right),
            Condition::Or { left, right } => write!(f, "({} or {})", left, right),
        }
    }
}
