//! Decoded instruction set
//!
//! The loader hands over instructions already decoded into a dialect-neutral
//! form: RK operands, `K`/`I` opcode variants (`ADDK`, `EQI`, `GETFIELD`, ...)
//! and the split load opcodes all collapse onto the variants below. Jump
//! offsets are relative: the target of a jump at `pc` is `pc + 1 + offset`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into a function's register file.
pub type Register = usize;

/// Source operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Register(Register),
    /// Index into the constant pool.
    Constant(usize),
    /// Integer immediate (`LOADI`, `ADDI`, `EQI`, ...).
    Integer(i64),
}

impl Operand {
    pub fn register(&self) -> Option<Register> {
        match self {
            Operand::Register(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "r{}", r),
            Operand::Constant(k) => write!(f, "k{}", k),
            Operand::Integer(i) => write!(f, "#{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Minus,
    Not,
    Len,
    BNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

/// One decoded instruction.
///
/// Counts follow the source-level meaning rather than the biased encodings:
/// `Call::args` is the number of arguments, `Call::results` the number of
/// results, and `None` stands for "up to the stack top" (`B = 0` / `C = 0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Move { a: Register, b: Register },
    LoadK { a: Register, constant: usize },
    LoadInt { a: Register, value: i64 },
    LoadFloat { a: Register, value: f64 },
    LoadBool { a: Register, value: bool },
    /// `R[a], ..., R[a + count - 1] := nil`
    LoadNil { a: Register, count: usize },
    GetUpval { a: Register, upvalue: usize },
    SetUpval { a: Register, upvalue: usize },
    GetTabUp { a: Register, upvalue: usize, key: Operand },
    SetTabUp { upvalue: usize, key: Operand, value: Operand },
    GetTable { a: Register, table: Register, key: Operand },
    SetTable { table: Register, key: Operand, value: Operand },
    NewTable { a: Register, array: usize, hash: usize },
    /// `R[a][offset + i] := R[a + i]` for `1 <= i <= count`.
    SetList { a: Register, count: Option<usize>, offset: usize },
    /// `R[a + 1] := R[object]; R[a] := R[object][key]`
    Method { a: Register, object: Register, key: Operand },
    Binary { a: Register, op: BinOp, left: Operand, right: Operand },
    Unary { a: Register, op: UnOp, operand: Register },
    /// `R[a] := R[a] .. ... .. R[a + count - 1]`
    Concat { a: Register, count: usize },
    Close { a: Register },
    Tbc { a: Register },
    Jmp { offset: i32 },
    /// Skip the next instruction when `(left op right) != k`.
    Compare { op: CompareOp, left: Operand, right: Operand, k: bool },
    /// Skip the next instruction when `truthy(R[a]) != k`.
    Test { a: Register, k: bool },
    /// Like `Test` on `R[b]`, copying it into `R[a]` when the jump is taken.
    TestSet { a: Register, b: Register, k: bool },
    Call { a: Register, args: Option<usize>, results: Option<usize> },
    TailCall { a: Register, args: Option<usize> },
    Return { a: Register, count: Option<usize> },
    /// Targets the matching `ForLoop`.
    ForPrep { a: Register, offset: i32 },
    /// Targets the first body instruction.
    ForLoop { a: Register, offset: i32 },
    /// Targets the matching `TForCall`.
    TForPrep { a: Register, offset: i32 },
    /// `R[a + 4], ..., R[a + 3 + results] := R[a](R[a + 1], R[a + 2])`
    TForCall { a: Register, results: usize },
    /// Targets the first body instruction.
    TForLoop { a: Register, offset: i32 },
    Closure { a: Register, proto: usize },
    VarArg { a: Register, count: Option<usize> },
}

fn operand_registers(operands: &[Operand]) -> impl Iterator<Item = Register> + '_ {
    operands.iter().filter_map(Operand::register)
}

fn span(start: Register, end: Register) -> Vec<Register> {
    (start..end).collect()
}

impl Instruction {
    /// Relative jump offset of jump-bearing instructions.
    pub fn jump_offset(&self) -> Option<i32> {
        match self {
            Instruction::Jmp { offset }
            | Instruction::ForPrep { offset, .. }
            | Instruction::ForLoop { offset, .. }
            | Instruction::TForPrep { offset, .. }
            | Instruction::TForLoop { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Absolute jump target, `None` for non-jumps or targets before instruction 0.
    pub fn jump_target(&self, pc: usize) -> Option<usize> {
        let offset = self.jump_offset()?;
        let target = pc as i64 + 1 + offset as i64;
        usize::try_from(target).ok()
    }

    /// Compare, Test and TestSet: instructions that conditionally skip the next jump.
    pub fn is_test(&self) -> bool {
        matches!(
            self,
            Instruction::Compare { .. } | Instruction::Test { .. } | Instruction::TestSet { .. }
        )
    }

    pub fn is_jmp(&self) -> bool {
        matches!(self, Instruction::Jmp { .. })
    }

    /// Instructions whose only effect is producing register values.
    pub fn is_value(&self) -> bool {
        match self {
            Instruction::Move { .. }
            | Instruction::LoadK { .. }
            | Instruction::LoadInt { .. }
            | Instruction::LoadFloat { .. }
            | Instruction::LoadBool { .. }
            | Instruction::LoadNil { .. }
            | Instruction::GetUpval { .. }
            | Instruction::GetTabUp { .. }
            | Instruction::GetTable { .. }
            | Instruction::Method { .. }
            | Instruction::Binary { .. }
            | Instruction::Unary { .. }
            | Instruction::Concat { .. }
            | Instruction::Closure { .. } => true,
            Instruction::Call { results, .. } => results.map_or(true, |n| n > 0),
            Instruction::VarArg { count, .. } => count.map_or(true, |n| n > 0),
            _ => false,
        }
    }

    /// Registers read by this instruction.
    ///
    /// `top` is the first register past an open (multi-value) result, used by
    /// the `None` count forms.
    pub fn reads(&self, top: Option<Register>) -> Vec<Register> {
        let open = |start: Register, count: Option<usize>| match count {
            Some(n) => span(start, start + n),
            None => span(start, top.unwrap_or(start).max(start)),
        };
        match self {
            Instruction::Move { b, .. } => vec![*b],
            Instruction::SetUpval { a, .. } => vec![*a],
            Instruction::GetTabUp { key, .. } => operand_registers(std::slice::from_ref(key)).collect(),
            Instruction::SetTabUp { key, value, .. } => operand_registers(&[*key, *value]).collect(),
            Instruction::GetTable { table, key, .. } => {
                let mut regs = vec![*table];
                regs.extend(key.register());
                regs
            }
            Instruction::SetTable { table, key, value } => {
                let mut regs = vec![*table];
                regs.extend(operand_registers(&[*key, *value]));
                regs
            }
            Instruction::SetList { a, count, .. } => {
                let mut regs = vec![*a];
                regs.extend(open(*a + 1, *count));
                regs
            }
            Instruction::Method { object, key, .. } => {
                let mut regs = vec![*object];
                regs.extend(key.register());
                regs
            }
            Instruction::Binary { left, right, .. } => operand_registers(&[*left, *right]).collect(),
            Instruction::Unary { operand, .. } => vec![*operand],
            Instruction::Concat { a, count } => span(*a, *a + *count),
            Instruction::Compare { left, right, .. } => operand_registers(&[*left, *right]).collect(),
            Instruction::Test { a, .. } => vec![*a],
            Instruction::TestSet { b, .. } => vec![*b],
            Instruction::Call { a, args, .. } | Instruction::TailCall { a, args } => {
                let mut regs = vec![*a];
                regs.extend(open(*a + 1, *args));
                regs
            }
            Instruction::Return { a, count } => open(*a, *count),
            Instruction::ForPrep { a, .. } => span(*a, *a + 3),
            Instruction::TForPrep { a, .. } => span(*a, *a + 4),
            _ => Vec::new(),
        }
    }

    /// Registers written by this instruction; open results report only their base.
    pub fn writes(&self) -> Vec<Register> {
        match self {
            Instruction::Move { a, .. }
            | Instruction::LoadK { a, .. }
            | Instruction::LoadInt { a, .. }
            | Instruction::LoadFloat { a, .. }
            | Instruction::LoadBool { a, .. }
            | Instruction::GetUpval { a, .. }
            | Instruction::GetTabUp { a, .. }
            | Instruction::GetTable { a, .. }
            | Instruction::NewTable { a, .. }
            | Instruction::Binary { a, .. }
            | Instruction::Unary { a, .. }
            | Instruction::Concat { a, .. }
            | Instruction::TestSet { a, .. }
            | Instruction::Closure { a, .. } => vec![*a],
            Instruction::LoadNil { a, count } => span(*a, *a + (*count).max(1)),
            Instruction::Method { a, .. } => vec![*a, *a + 1],
            Instruction::Call { a, results, .. } => match results {
                Some(n) => span(*a, *a + n),
                None => vec![*a],
            },
            Instruction::VarArg { a, count } => match count {
                Some(n) => span(*a, *a + n),
                None => vec![*a],
            },
            Instruction::ForPrep { a, .. } => span(*a, *a + 4),
            Instruction::TForCall { a, results } => span(*a + 4, *a + 4 + results),
            _ => Vec::new(),
        }
    }

    /// Mnemonic used by diagnostics and block dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Move { .. } => "MOVE",
            Instruction::LoadK { .. } => "LOADK",
            Instruction::LoadInt { .. } => "LOADI",
            Instruction::LoadFloat { .. } => "LOADF",
            Instruction::LoadBool { .. } => "LOADBOOL",
            Instruction::LoadNil { .. } => "LOADNIL",
            Instruction::GetUpval { .. } => "GETUPVAL",
            Instruction::SetUpval { .. } => "SETUPVAL",
            Instruction::GetTabUp { .. } => "GETTABUP",
            Instruction::SetTabUp { .. } => "SETTABUP",
            Instruction::GetTable { .. } => "GETTABLE",
            Instruction::SetTable { .. } => "SETTABLE",
            Instruction::NewTable { .. } => "NEWTABLE",
            Instruction::SetList { .. } => "SETLIST",
            Instruction::Method { .. } => "SELF",
            Instruction::Binary { .. } => "BINOP",
            Instruction::Unary { .. } => "UNOP",
            Instruction::Concat { .. } => "CONCAT",
            Instruction::Close { .. } => "CLOSE",
            Instruction::Tbc { .. } => "TBC",
            Instruction::Jmp { .. } => "JMP",
            Instruction::Compare { .. } => "CMP",
            Instruction::Test { .. } => "TEST",
            Instruction::TestSet { .. } => "TESTSET",
            Instruction::Call { .. } => "CALL",
            Instruction::TailCall { .. } => "TAILCALL",
            Instruction::Return { .. } => "RETURN",
            Instruction::ForPrep { .. } => "FORPREP",
            Instruction::ForLoop { .. } => "FORLOOP",
            Instruction::TForPrep { .. } => "TFORPREP",
            Instruction::TForCall { .. } => "TFORCALL",
            Instruction::TForLoop { .. } => "TFORLOOP",
            Instruction::Closure { .. } => "CLOSURE",
            Instruction::VarArg { .. } => "VARARG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_targets() {
        assert_eq!(Instruction::Jmp { offset: 2 }.jump_target(3), Some(6));
        assert_eq!(Instruction::Jmp { offset: -4 }.jump_target(3), Some(0));
        assert_eq!(Instruction::Jmp { offset: -5 }.jump_target(3), None);
        assert_eq!(Instruction::ForLoop { a: 0, offset: -3 }.jump_target(5), Some(3));
        assert_eq!(Instruction::Move { a: 0, b: 1 }.jump_target(0), None);
    }

    #[test]
    fn test_call_register_usage() {
        let call = Instruction::Call { a: 2, args: Some(2), results: Some(1) };
        assert_eq!(call.reads(None), vec![2, 3, 4]);
        assert_eq!(call.writes(), vec![2]);

        let open = Instruction::Call { a: 0, args: None, results: Some(0) };
        assert_eq!(open.reads(Some(3)), vec![0, 1, 2]);
        assert!(open.writes().is_empty());
        assert!(!open.is_value());
    }

    #[test]
    fn test_operand_registers_skip_constants() {
        let add = Instruction::Binary {
            a: 2,
            op: BinOp::Add,
            left: Operand::Register(0),
            right: Operand::Constant(1),
        };
        assert_eq!(add.reads(None), vec![0]);
        assert!(add.is_value());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{"op":"load_int","a":0,"value":7}"#;
        let decoded: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(decoded, Instruction::LoadInt { a: 0, value: 7 });
    }
}
