//! Short-circuit condition chains
//!
//! The compiler lowers `a and b or c` style conditions into consecutive
//! test/jump pairs, optionally separated by the value computations feeding the
//! next test. A chain is reduced to a single [`Condition`] by walking it
//! backwards and asking, for every pair, under which condition control
//! reaches the chain's true target.

use crate::ast::condition::Condition;
use crate::chunk::{Instruction, Prototype, Register};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::ops::{Range, RangeInclusive};

/// One test instruction and the jump it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub test: usize,
    pub jump: usize,
    /// Normalized jump target.
    pub target: usize,
    /// First instruction of the value run leading up to `test`.
    pub segment: usize,
}

impl Pair {
    pub fn fallthrough(&self) -> usize {
        self.jump + 1
    }
}

/// Debug local lifetimes by register.
#[derive(Debug, Clone, Default)]
pub struct LocalRanges {
    entries: Vec<(Register, Range<usize>)>,
}

impl LocalRanges {
    pub fn new(proto: &Prototype) -> Self {
        Self::from_entries(
            proto
                .local_registers()
                .into_iter()
                .map(|(register, local)| (register, local.start_pc..local.end_pc))
                .collect(),
        )
    }

    pub fn from_entries(entries: Vec<(Register, Range<usize>)>) -> Self {
        Self { entries }
    }

    /// Whether some local becomes active at an instruction in `range`.
    pub fn starts_in(&self, range: RangeInclusive<usize>) -> bool {
        self.entries.iter().any(|(_, live)| range.contains(&live.start))
    }

    pub fn is_live(&self, register: Register, pc: usize) -> bool {
        self.entries
            .iter()
            .any(|(r, live)| *r == register && live.contains(&pc))
    }
}

/// Finds condition chains in one prototype.
pub struct ChainScanner<'a> {
    code: &'a [Instruction],
    locals: LocalRanges,
    /// Targets of backward jumps; a chain never extends over one.
    loop_heads: BTreeSet<usize>,
}

impl<'a> ChainScanner<'a> {
    pub fn new(code: &'a [Instruction], locals: LocalRanges, loop_heads: BTreeSet<usize>) -> Self {
        Self {
            code,
            locals,
            loop_heads,
        }
    }

    pub fn locals(&self) -> &LocalRanges {
        &self.locals
    }

    fn is_pair(&self, pc: usize, limit: usize) -> bool {
        pc + 1 < limit && self.code[pc].is_test() && self.code[pc + 1].is_jmp()
    }

    /// Whether `range` only computes temporaries: it declares no debug local,
    /// assigns no live local, and overwrites no register it (or `prior`) read.
    pub fn is_temporary_run(&self, range: Range<usize>, prior: &[Register]) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.locals.starts_in(range.start + 1..=range.end) {
            return false;
        }
        let mut written = BTreeSet::new();
        let mut read: BTreeSet<Register> = prior.iter().copied().collect();
        for pc in range {
            let instruction = &self.code[pc];
            read.extend(
                instruction
                    .reads(None)
                    .into_iter()
                    .filter(|r| !written.contains(r)),
            );
            for register in instruction.writes() {
                if read.contains(&register) || self.locals.is_live(register, pc) {
                    return false;
                }
                written.insert(register);
            }
        }
        true
    }

    /// Collect test/jump pairs starting with the test at `start`.
    ///
    /// Value runs between pairs are accepted only when they are temporary
    /// runs feeding the next test.
    pub fn collect(&self, start: usize, limit: usize, normalize: impl Fn(usize) -> usize) -> Vec<Pair> {
        let code = self.code;
        let mut pairs = Vec::new();
        let mut pc = start;
        let mut segment = start;
        while self.is_pair(pc, limit) {
            let Some(target) = code[pc + 1].jump_target(pc + 1) else {
                break;
            };
            pairs.push(Pair {
                test: pc,
                jump: pc + 1,
                target: normalize(target),
                segment,
            });
            pc += 2;
            segment = pc;

            let mut next = pc;
            while next < limit && code[next].is_value() {
                next += 1;
            }
            if self.loop_heads.range(pc..=next).next().is_some() {
                break;
            }
            if next == pc {
                continue;
            }
            let prior: Vec<Register> = pairs.iter().flat_map(|p| code[p.test].reads(None)).collect();
            let written: BTreeSet<_> = code[pc..next].iter().flat_map(|i| i.writes()).collect();
            let feeds_test = self.is_pair(next, limit)
                && code[next].reads(None).iter().any(|r| written.contains(r));
            if !feeds_test || !self.is_temporary_run(pc..next, &prior) {
                break;
            }
            pc = next;
        }
        pairs
    }
}

/// Length of the longest prefix whose jumps all stay inside the chain.
///
/// For a prefix of `k` pairs the true target is the fallthrough of the last
/// pair and the false target is its jump target; every earlier jump must land
/// on a later segment, on one of those two, or on one of `extra`.
pub fn closed_prefix(pairs: &[Pair], extra: &[usize]) -> usize {
    (1..=pairs.len())
        .rev()
        .find(|&k| {
            let last = pairs[k - 1];
            pairs[..k - 1].iter().enumerate().all(|(i, pair)| {
                pair.target == last.fallthrough()
                    || pair.target == last.target
                    || extra.contains(&pair.target)
                    || pairs[i + 1..k].iter().any(|later| later.segment == pair.target)
            })
        })
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
enum Reach {
    Always,
    Never,
    When(Condition),
}

/// `if c then x else y`, simplified.
fn combine(c: Condition, x: Reach, y: Reach) -> Reach {
    use Reach::*;
    match (x, y) {
        (x, y) if x == y => x,
        (Always, Always) => Always,
        (Never, Never) => Never,
        (Always, Never) => When(c),
        (Never, Always) => When(c.negate()),
        (Always, When(y)) => When(Condition::or(c, y)),
        (Never, When(y)) => When(Condition::and(c.negate(), y)),
        (When(x), Always) => When(Condition::or(c.negate(), x)),
        (When(x), Never) => When(Condition::and(c, x)),
        (When(x), When(y)) => match y {
            Condition::And { left, right } if *right == x => {
                When(Condition::and(Condition::or(c, *left), x))
            }
            Condition::Or { left, right } if *right == x => {
                When(Condition::or(Condition::and(c.negate(), *left), x))
            }
            y => When(Condition::or(
                Condition::and(c.clone(), x),
                Condition::and(c.negate(), y),
            )),
        },
    }
}

/// Condition under which the chain transfers control to `true_target`.
pub fn chain_condition(
    code: &[Instruction],
    pairs: &[Pair],
    true_target: usize,
    false_target: usize,
) -> Result<Condition> {
    let Some(last) = pairs.last() else {
        return Err(Error::internal("empty condition chain"));
    };
    let reach_exit = |target: usize, pc: usize| {
        if target == true_target {
            Ok(Reach::Always)
        } else if target == false_target {
            Ok(Reach::Never)
        } else {
            Err(Error::structural(
                pc,
                format!("condition jump to {} leaves the chain", target),
            ))
        }
    };

    let mut reach = vec![Reach::Never; pairs.len() + 1];
    reach[pairs.len()] = reach_exit(last.fallthrough(), last.jump)?;
    for (i, pair) in pairs.iter().enumerate().rev() {
        let c = Condition::from_test(&code[pair.test], pair.test)
            .ok_or_else(|| Error::internal(format!("instruction {} is not a test", pair.test)))?;
        let taken = match reach_exit(pair.target, pair.jump) {
            Ok(reach) => reach,
            Err(err) => match pairs[i + 1..].iter().position(|p| p.segment == pair.target) {
                Some(offset) => reach[i + 1 + offset].clone(),
                None => return Err(err),
            },
        };
        reach[i] = combine(c, taken, reach[i + 1].clone());
    }

    Ok(match reach.swap_remove(0) {
        Reach::Always => Condition::Constant { value: true },
        Reach::Never => Condition::Constant { value: false },
        Reach::When(condition) => condition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Instruction::*;
    use crate::chunk::{Instruction, Operand};

    fn test(register: usize) -> Condition {
        Condition::Test {
            register,
            pc: 0,
        }
    }

    fn at(condition: Condition, pcs: &[(usize, usize)]) -> Condition {
        // Rewrite leaf pcs so expectations can be written with `test(r)`.
        match condition {
            Condition::Test { register, .. } => Condition::Test {
                register,
                pc: pcs.iter().find(|(r, _)| *r == register).map_or(0, |(_, pc)| *pc),
            },
            Condition::Not { operand } => at(*operand, pcs).negate(),
            Condition::And { left, right } => Condition::and(at(*left, pcs), at(*right, pcs)),
            Condition::Or { left, right } => Condition::or(at(*left, pcs), at(*right, pcs)),
            other => other,
        }
    }

    fn pairs_of(code: &[Instruction]) -> Vec<Pair> {
        ChainScanner::new(code, LocalRanges::default(), BTreeSet::new()).collect(0, code.len(), |t| t)
    }

    #[test]
    fn test_and_chain() {
        // if a and b then <4> end <5>
        let code = vec![
            Test { a: 0, k: false },
            Jmp { offset: 3 },
            Test { a: 1, k: false },
            Jmp { offset: 1 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        assert_eq!(pairs.len(), 2);
        assert_eq!(closed_prefix(&pairs, &[]), 2);
        let cond = chain_condition(&code, &pairs, 4, 5).unwrap();
        assert_eq!(cond, at(Condition::and(test(0), test(1)), &[(0, 0), (1, 2)]));
    }

    #[test]
    fn test_or_chain() {
        // if a or b then <4> end <5>
        let code = vec![
            Test { a: 0, k: true },
            Jmp { offset: 2 },
            Test { a: 1, k: false },
            Jmp { offset: 1 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        let cond = chain_condition(&code, &pairs, 4, 5).unwrap();
        assert_eq!(cond, at(Condition::or(test(0), test(1)), &[(0, 0), (1, 2)]));
        assert_eq!(cond.to_string(), "(r0 or r1)");
    }

    #[test]
    fn test_grouped_or_inside_and() {
        // if (a or b) and c then <6> end <7>
        let code = vec![
            Test { a: 0, k: true },
            Jmp { offset: 2 },
            Test { a: 1, k: false },
            Jmp { offset: 3 },
            Test { a: 2, k: false },
            Jmp { offset: 1 },
            Move { a: 3, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        assert_eq!(pairs.len(), 3);
        let cond = chain_condition(&code, &pairs, 6, 7).unwrap();
        assert_eq!(cond.to_string(), "((r0 or r1) and r2)");
    }

    #[test]
    fn test_value_run_must_feed_next_test() {
        let code = vec![
            Test { a: 0, k: false },
            Jmp { offset: 4 },
            LoadInt { a: 1, value: 1 },
            Test { a: 1, k: false },
            Jmp { offset: 1 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].segment, 2);

        let mut unrelated = code.clone();
        unrelated[2] = LoadInt { a: 3, value: 1 };
        assert_eq!(pairs_of(&unrelated).len(), 1);

        let declared = LocalRanges::from_entries(vec![(1, 3..6)]);
        let scanner = ChainScanner::new(&code, declared, BTreeSet::new());
        assert_eq!(scanner.collect(0, code.len(), |t| t).len(), 1);

        let heads: BTreeSet<usize> = [2].into_iter().collect();
        let scanner = ChainScanner::new(&code, LocalRanges::default(), heads);
        assert_eq!(scanner.collect(0, code.len(), |t| t).len(), 1);
    }

    #[test]
    fn test_run_assigning_tested_register_is_not_temporary() {
        let code = vec![
            Test { a: 0, k: false },
            Jmp { offset: 4 },
            Binary { a: 1, op: crate::chunk::BinOp::Add, left: Operand::Register(1), right: Operand::Integer(1) },
            Test { a: 1, k: false },
            Jmp { offset: 1 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        assert_eq!(pairs_of(&code).len(), 1);
        let scanner = ChainScanner::new(&code, LocalRanges::default(), BTreeSet::new());
        assert!(!scanner.is_temporary_run(2..3, &[]));
        assert!(scanner.is_temporary_run(5..6, &[]));
        let live = LocalRanges::from_entries(vec![(2, 0..7)]);
        let scanner = ChainScanner::new(&code, live, BTreeSet::new());
        assert!(!scanner.is_temporary_run(5..6, &[]));
    }

    #[test]
    fn test_prefix_stops_at_foreign_target() {
        // if a then break end; if b then ... end
        let code = vec![
            Test { a: 0, k: true },
            Jmp { offset: 10 },
            Test { a: 1, k: false },
            Jmp { offset: 1 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        assert_eq!(pairs.len(), 2);
        assert_eq!(closed_prefix(&pairs, &[]), 1);
        assert_eq!(closed_prefix(&pairs, &[12]), 2);
    }

    #[test]
    fn test_jump_leaving_chain_is_structural() {
        let code = vec![
            Test { a: 0, k: false },
            Jmp { offset: 3 },
            Move { a: 2, b: 0 },
            Return { a: 0, count: Some(0) },
        ];
        let pairs = pairs_of(&code);
        let err = chain_condition(&code, &pairs, 2, 3).unwrap_err();
        assert_eq!(err.pc(), Some(1));
    }
}
