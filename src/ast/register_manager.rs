//! Register state simulation
//!
//! The register file is simulated as a per-register history of slot changes.
//! Each change records the first instruction that observes it, so the state
//! at any instruction boundary can be queried after the fact: the expression
//! resolver binds the operands of a condition at the test instruction that
//! read them, long after later instructions have been processed.
//!
//! Changes must arrive in instruction order. A change behind the last
//! processed instruction means the caller walked the blocks out of order,
//! which is a bug rather than a property of the input, and panics.

use crate::ast::expression::Expression;
use crate::chunk::Register;
use crate::error::{Error, Result};

/// What a register holds at an instruction boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Unassigned,
    /// A declared local variable.
    Local(String),
    /// A value that has not been bound to a name.
    Temporary(Expression),
}

/// Tracks register contents across a single prototype.
#[derive(Debug)]
pub struct RegisterManager {
    history: Vec<Vec<(usize, Slot)>>,
    last_boundary: usize,
}

impl RegisterManager {
    pub fn new(max_registers: usize) -> Self {
        Self {
            history: vec![vec![(0, Slot::Unassigned)]; max_registers],
            last_boundary: 0,
        }
    }

    pub fn max_registers(&self) -> usize {
        self.history.len()
    }

    /// First instruction that has not been processed yet.
    pub fn boundary(&self) -> usize {
        self.last_boundary
    }

    /// `boundary` is the first instruction observing the change.
    fn advance(&mut self, boundary: usize) {
        if boundary < self.last_boundary {
            panic!(
                "register state changed before instruction {} after instruction {} was processed",
                boundary, self.last_boundary
            );
        }
        self.last_boundary = boundary;
    }

    fn entries_mut(&mut self, register: Register, pc: usize) -> Result<&mut Vec<(usize, Slot)>> {
        let max = self.history.len();
        self.history.get_mut(register).ok_or_else(|| {
            Error::unresolvable(pc, format!("register {} exceeds the frame size {}", register, max))
        })
    }

    /// Declare a local living in `register`, visible from instruction `from` on.
    ///
    /// # Panics
    ///
    /// Panics if `from` lies before an instruction already processed.
    pub fn declare_local(&mut self, register: Register, name: impl Into<String>, from: usize) -> Result<()> {
        self.advance(from);
        self.entries_mut(register, from)?
            .push((from, Slot::Local(name.into())));
        Ok(())
    }

    /// Record the value written by the instruction at `pc`; later instructions see it.
    ///
    /// # Panics
    ///
    /// Panics if the instruction after `pc` was already processed.
    pub fn assign(&mut self, register: Register, pc: usize, expression: Expression) -> Result<()> {
        self.advance(pc + 1);
        self.entries_mut(register, pc)?
            .push((pc + 1, Slot::Temporary(expression)));
        Ok(())
    }

    /// End every local and temporary at or above `floor` after instruction `pc`.
    ///
    /// # Panics
    ///
    /// Panics if the instruction after `pc` was already processed.
    pub fn close_scope(&mut self, floor: Register, pc: usize) {
        self.advance(pc + 1);
        for entries in self.history.iter_mut().skip(floor) {
            if !matches!(entries.last(), Some((_, Slot::Unassigned))) {
                entries.push((pc + 1, Slot::Unassigned));
            }
        }
    }

    /// Slot of `register` as seen by the instruction at `pc`.
    ///
    /// The most recent change visible at `pc` wins, so a local declared over a
    /// temporary at the same boundary shadows it.
    pub fn slot(&self, register: Register, pc: usize) -> Option<&Slot> {
        self.history
            .get(register)?
            .iter()
            .rev()
            .find(|(from, _)| *from <= pc)
            .map(|(_, slot)| slot)
    }

    /// Like [`slot`](Self::slot), failing for unassigned or out-of-frame registers.
    pub fn bind(&self, register: Register, pc: usize) -> Result<&Slot> {
        match self.slot(register, pc) {
            None => Err(Error::unresolvable(
                pc,
                format!("register {} exceeds the frame size {}", register, self.history.len()),
            )),
            Some(Slot::Unassigned) => Err(Error::unresolvable(
                pc,
                format!("register {} is read before it is assigned", register),
            )),
            Some(slot) => Ok(slot),
        }
    }

    pub fn local_name(&self, register: Register, pc: usize) -> Option<&str> {
        match self.slot(register, pc) {
            Some(Slot::Local(name)) => Some(name),
            _ => None,
        }
    }

    pub fn is_local(&self, register: Register, pc: usize) -> bool {
        self.local_name(register, pc).is_some()
    }

    /// Locals at or above `floor` visible at `pc`, by register.
    pub fn locals_from(&self, floor: Register, pc: usize) -> Vec<(Register, String)> {
        (floor..self.history.len())
            .filter_map(|r| self.local_name(r, pc).map(|name| (r, name.to_string())))
            .collect()
    }

    /// One past the highest register holding a local at `pc`.
    pub fn locals_top(&self, pc: usize) -> Register {
        (0..self.history.len())
            .rev()
            .find(|r| self.is_local(*r, pc))
            .map_or(0, |r| r + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_visible_after_instruction() {
        let mut regs = RegisterManager::new(2);
        regs.assign(0, 3, Expression::integer(1)).unwrap();
        assert!(regs.bind(0, 3).is_err());
        assert_eq!(regs.bind(0, 4).unwrap(), &Slot::Temporary(Expression::integer(1)));
        assert_eq!(regs.bind(0, 40).unwrap(), &Slot::Temporary(Expression::integer(1)));
    }

    #[test]
    fn test_local_visible_from_declaration() {
        let mut regs = RegisterManager::new(2);
        regs.declare_local(1, "x", 5).unwrap();
        assert!(regs.bind(1, 4).is_err());
        assert_eq!(regs.local_name(1, 5), Some("x"));
        assert_eq!(regs.locals_top(5), 2);
        assert_eq!(regs.locals_top(4), 0);
    }

    #[test]
    fn test_history_answers_past_queries() {
        let mut regs = RegisterManager::new(1);
        regs.assign(0, 0, Expression::integer(1)).unwrap();
        regs.assign(0, 2, Expression::integer(2)).unwrap();
        assert_eq!(regs.bind(0, 2).unwrap(), &Slot::Temporary(Expression::integer(1)));
        assert_eq!(regs.bind(0, 3).unwrap(), &Slot::Temporary(Expression::integer(2)));
    }

    #[test]
    fn test_close_scope_unassigns() {
        let mut regs = RegisterManager::new(3);
        regs.declare_local(0, "a", 0).unwrap();
        regs.declare_local(1, "b", 1).unwrap();
        regs.close_scope(1, 4);
        assert_eq!(regs.local_name(1, 4), Some("b"));
        assert!(regs.bind(1, 5).is_err());
        assert_eq!(regs.local_name(0, 5), Some("a"));
        assert_eq!(regs.locals_from(0, 4), vec![(0, "a".to_string()), (1, "b".to_string())]);
    }

    #[test]
    fn test_out_of_frame_register() {
        let mut regs = RegisterManager::new(1);
        let err = regs.assign(3, 7, Expression::nil()).unwrap_err();
        assert!(matches!(err, Error::UnresolvableReference { pc: 7, .. }));
        assert!(regs.bind(3, 0).is_err());
    }

    #[test]
    #[should_panic]
    fn test_mutation_behind_processed_instruction_panics() {
        let mut regs = RegisterManager::new(1);
        regs.assign(0, 5, Expression::nil()).unwrap();
        let _ = regs.assign(0, 4, Expression::nil());
    }

    #[test]
    #[should_panic]
    fn test_declaration_behind_processed_instruction_panics() {
        let mut regs = RegisterManager::new(2);
        regs.assign(0, 5, Expression::nil()).unwrap();
        let _ = regs.declare_local(1, "x", 3);
    }

    #[test]
    #[should_panic]
    fn test_closing_behind_processed_instruction_panics() {
        let mut regs = RegisterManager::new(2);
        regs.declare_local(0, "x", 6).unwrap();
        regs.close_scope(0, 2);
    }
}
